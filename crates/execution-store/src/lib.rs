//! Persistence boundary for saga executions.
//!
//! The engine stores one snapshot per execution and guards every write with
//! the version it expects to overwrite. A mismatch means another writer is
//! driving the same execution.

pub mod error;
pub mod memory;
pub mod record;
pub mod store;

pub use common::ExecutionId;
pub use error::{Result, StoreError};
pub use memory::InMemoryExecutionStore;
pub use record::{ExecutionRecord, Version};
pub use store::{PersistenceStore, PersistenceStoreExt};
