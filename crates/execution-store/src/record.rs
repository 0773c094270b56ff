use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::ExecutionId;

/// Version number of a stored execution, used for optimistic concurrency control.
///
/// A record that has never been written is at version 0; every successful
/// save increments the version by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of an execution that was never saved.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A stored snapshot of one saga execution.
///
/// The engine owns the shape of `state`; the store only looks at the
/// metadata fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// The execution this record belongs to.
    pub execution_id: ExecutionId,

    /// Name of the saga definition driving the execution.
    pub saga_name: String,

    /// Status name at the time of the write.
    pub status: String,

    /// True once the execution reached a terminal status.
    pub terminal: bool,

    /// Version of the record. Assigned by the store on save.
    pub version: Version,

    /// When the record was written.
    pub updated_at: DateTime<Utc>,

    /// The serialized execution state.
    pub state: serde_json::Value,
}

impl ExecutionRecord {
    /// Creates a record from a serializable execution state.
    pub fn from_state<T: Serialize>(
        execution_id: ExecutionId,
        saga_name: impl Into<String>,
        status: impl Into<String>,
        terminal: bool,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            execution_id,
            saga_name: saga_name.into(),
            status: status.into(),
            terminal,
            version: Version::initial(),
            updated_at: Utc::now(),
            state: serde_json::to_value(state)?,
        })
    }

    /// Deserializes the record state into a concrete type.
    pub fn to_state<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state.clone())
    }
}
