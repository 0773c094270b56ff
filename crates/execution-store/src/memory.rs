use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{ExecutionId, ExecutionRecord, PersistenceStore, Result, StoreError, Version};

/// In-memory persistence store.
///
/// Keeps the latest record per execution and enforces the same optimistic
/// version check a durable backend would.
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    records: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>,
}

impl InMemoryExecutionStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored executions.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if nothing was stored yet.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Clears all records.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl PersistenceStore for InMemoryExecutionStore {
    async fn save(&self, mut record: ExecutionRecord, expected_version: Version) -> Result<Version> {
        let execution_id = record.execution_id;
        let mut records = self.records.write().await;

        let current = records
            .get(&execution_id)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        if current != expected_version {
            tracing::warn!(
                %execution_id,
                expected = %expected_version,
                actual = %current,
                "rejected stale execution write"
            );
            return Err(StoreError::ConcurrencyConflict {
                execution_id,
                expected: expected_version,
                actual: current,
            });
        }

        let next = current.next();
        record.version = next;
        records.insert(execution_id, record);

        Ok(next)
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&execution_id).cloned())
    }

    async fn in_flight(&self) -> Result<Vec<ExecutionId>> {
        let records = self.records.read().await;
        let mut ids: Vec<_> = records
            .values()
            .filter(|r| !r.terminal)
            .map(|r| r.execution_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
