use async_trait::async_trait;

use crate::{ExecutionId, ExecutionRecord, Result, Version};

/// Durable storage for saga execution snapshots.
///
/// Implementations must be thread-safe (Send + Sync) and must apply the
/// version check and the write atomically.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Saves a record if the stored version equals `expected_version`.
    ///
    /// A record that does not exist yet is at `Version::initial()`. On success
    /// the stored record is assigned `expected_version.next()`, which is
    /// returned. A mismatch fails with `ConcurrencyConflict`.
    async fn save(&self, record: ExecutionRecord, expected_version: Version) -> Result<Version>;

    /// Loads the latest record of an execution.
    ///
    /// Returns None if the execution was never saved.
    async fn load(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// Lists executions whose latest record is not terminal.
    async fn in_flight(&self) -> Result<Vec<ExecutionId>>;
}

/// Extension trait providing convenience methods for persistence stores.
#[async_trait]
pub trait PersistenceStoreExt: PersistenceStore {
    /// Loads a record, failing with `ExecutionNotFound` if it does not exist.
    async fn load_required(&self, execution_id: ExecutionId) -> Result<ExecutionRecord> {
        self.load(execution_id)
            .await?
            .ok_or(crate::StoreError::ExecutionNotFound(execution_id))
    }

    /// Returns the stored version of an execution, if any.
    async fn current_version(&self, execution_id: ExecutionId) -> Result<Option<Version>> {
        Ok(self.load(execution_id).await?.map(|r| r.version))
    }
}

impl<T: PersistenceStore + ?Sized> PersistenceStoreExt for T {}
