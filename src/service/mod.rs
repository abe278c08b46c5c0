//! Service layer
//!
//! The sync engine and the loop that re-runs it in daemon mode.

mod scheduler;
mod sync;

pub use scheduler::run_every;
pub use sync::{SyncEngine, SyncError, SyncReport, TransferError, fetch_backup};
