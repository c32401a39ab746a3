//! Result archive contract
//!
//! The archive holds the durable record of each run's outcome. Only the
//! status and result fields matter to the controller; the document format
//! is the archive's own business.

use async_trait::async_trait;
use podwatch_common::Result;

/// The fields of an archived run record the controller reads and writes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivedRun {
    /// Archive document id
    pub run_id: String,
    /// Archived lifecycle status
    pub status: Option<String>,
    /// Archived result
    pub result: Option<String>,
}

impl ArchivedRun {
    /// Create a record with the given status and no result
    pub fn new(run_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: Some(status.into()),
            result: None,
        }
    }
}

/// Read/update access to archived run records
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ResultArchive: Send + Sync {
    /// Look up an archived run; `None` if no archive holds it
    async fn get_run(&self, run_id: &str) -> Result<Option<ArchivedRun>>;

    /// Replace the archived run's status and result
    async fn update_run(&self, run: &ArchivedRun) -> Result<()>;
}
