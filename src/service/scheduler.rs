//! Fixed-interval job loop for daemon mode

use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run `job` now and then once per `interval` until cancelled
///
/// Each invocation is awaited before the next tick is considered, so
/// runs never overlap. A run that outlasts the interval delays the
/// following one instead of triggering a burst.
///
/// # Note
/// Returns only when `cancel` fires. An in-flight job is dropped at
/// that point; jobs are expected to observe the same token.
pub async fn run_every<F, Fut>(interval: Duration, cancel: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = job() => {}
        }
    }

    tracing::info!("Scheduler stopped");
}
