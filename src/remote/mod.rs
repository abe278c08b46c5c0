//! Remote backup source
//!
//! Lists the backups the Todoist export API offers and streams
//! individual archives.

mod todoist;

pub use todoist::{TodoistClient, USER_AGENT, parse_metadata};

use async_trait::async_trait;

use crate::data::{BackupDescriptor, BackupDownload};
use crate::error::AppError;

/// Source of backup archives
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupSource: Send + Sync {
    /// List every backup currently offered
    async fn list_backups(&self) -> Result<Vec<BackupDescriptor>, AppError>;

    /// Start downloading one backup
    ///
    /// Metadata is captured from the response; the body is streamed.
    async fn download(&self, backup: &BackupDescriptor) -> Result<BackupDownload, AppError>;
}
