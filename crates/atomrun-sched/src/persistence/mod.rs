//! Persistence layer for calculation records and job archives.

mod local_store;
mod rest_server;
mod rest_store;
mod retry;
mod sqlite_store;

pub use local_store::LocalStore;
pub use rest_server::{store_router, store_router_with_auth};
pub use rest_store::RestStore;
pub use retry::{RetryPolicy, retry_transient};
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;

use crate::error::{SchedError, SchedResult};
use crate::record::{CalculationRecord, RecordFilter};

/// Durable storage for calculation records and their archived job
/// directories.
///
/// Records are partitioned by style and keyed by name within a style. Blobs
/// are keyed by the same pair. Adding a blob replaces an existing one.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Add a new record. Fails with `DuplicateRecord` if the name exists.
    async fn add_record(&self, record: &CalculationRecord) -> SchedResult<()>;

    /// Load a record.
    async fn get_record(&self, style: &str, name: &str)
    -> SchedResult<Option<CalculationRecord>>;

    /// Replace an existing record. Fails with `RecordNotFound` if absent.
    async fn update_record(&self, record: &CalculationRecord) -> SchedResult<()>;

    /// List the records of a style matching a filter.
    async fn get_records(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> SchedResult<Vec<CalculationRecord>>;

    /// Delete a record. Returns whether it existed.
    async fn delete_record(&self, style: &str, name: &str) -> SchedResult<bool>;

    /// Store the archive of a record, replacing any previous one.
    async fn add_blob(&self, style: &str, name: &str, data: &[u8]) -> SchedResult<()>;

    /// Load the archive of a record.
    async fn get_blob(&self, style: &str, name: &str) -> SchedResult<Option<Vec<u8>>>;

    /// Delete the archive of a record. Returns whether it existed.
    async fn delete_blob(&self, style: &str, name: &str) -> SchedResult<bool>;

    /// Whether an archive exists for a record.
    async fn has_blob(&self, style: &str, name: &str) -> SchedResult<bool> {
        Ok(self.get_blob(style, name).await?.is_some())
    }
}

/// Persist a record, adding it when the store has never seen it.
///
/// A concurrent add that wins the race turns into an update.
pub async fn save_record(store: &dyn JobStore, record: &CalculationRecord) -> SchedResult<()> {
    match store.update_record(record).await {
        Err(SchedError::RecordNotFound { .. }) => match store.add_record(record).await {
            Err(SchedError::DuplicateRecord { .. }) => store.update_record(record).await,
            other => other,
        },
        other => other,
    }
}
