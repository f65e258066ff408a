//! Persistence backends for sealed token records

use std::{error, io};

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{RecordKey, StoredRecord};

#[cfg(feature = "file")]
pub mod file;
pub mod memory;

#[cfg(feature = "file")]
pub use file::FileBackend;
pub use memory::MemoryBackend;

/// A boxed error that can cross backend boundaries
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// An edit applied atomically to a single record
///
/// The closure sees the current record, if any, and returns the record to
/// write, or `None` to leave the stored state as it is. Returning an error
/// aborts the edit without writing.
pub type RecordEdit<'a> =
    Box<dyn FnOnce(Option<&StoredRecord>) -> Result<Option<StoredRecord>, BoxError> + Send + 'a>;

/// The result of applying a [`RecordEdit`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modified {
    /// The edit wrote this record
    Written(StoredRecord),
    /// The edit declined to write; holds the record as it stands, if any
    Unchanged(Option<StoredRecord>),
}

impl Modified {
    /// The record as it stands after the edit, whether or not it wrote
    pub fn current(self) -> Option<StoredRecord> {
        match self {
            Self::Written(record) => Some(record),
            Self::Unchanged(current) => current,
        }
    }

    /// The record the edit wrote, or `None` if it declined to write
    pub fn written(self) -> Option<StoredRecord> {
        match self {
            Self::Written(record) => Some(record),
            Self::Unchanged(_) => None,
        }
    }

    /// Whether the edit wrote a record
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

/// An error from a persistence backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The underlying storage could not be read or written
    #[error("storage I/O error")]
    Io(#[from] io::Error),
    /// Stored data could not be encoded or decoded
    #[error("stored data is malformed")]
    Serialization(#[from] serde_json::Error),
    /// The edit closure rejected the change
    #[error("edit rejected")]
    Rejected(#[source] BoxError),
}

/// Storage for sealed token records, keyed by subject and provider
///
/// Implementations must apply [`modify`](Self::modify) atomically with
/// respect to every other operation on the same key. No cross-record
/// transactions are required.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Loads a single record
    async fn fetch(&self, key: &RecordKey) -> Result<Option<StoredRecord>, BackendError>;

    /// Atomically applies `edit` to a single record
    ///
    /// Reports whether the edit wrote, together with the resulting record.
    async fn modify(
        &self,
        key: &RecordKey,
        edit: RecordEdit<'_>,
    ) -> Result<Modified, BackendError>;

    /// Removes a record, reporting whether one existed
    async fn remove(&self, key: &RecordKey) -> Result<bool, BackendError>;

    /// Loads every record
    async fn scan(&self) -> Result<Vec<StoredRecord>, BackendError>;
}
