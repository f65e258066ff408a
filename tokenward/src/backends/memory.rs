//! An in-memory record backend

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BackendError, Modified, RecordBackend, RecordEdit};
use crate::record::{RecordKey, StoredRecord};

/// An in-memory record backend
///
/// Records live for as long as the backend does.
#[derive(Default, Debug)]
pub struct MemoryBackend {
    records: Mutex<HashMap<RecordKey, StoredRecord>>,
}

impl MemoryBackend {
    /// Constructs a new, empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }
}

pub(super) fn apply_edit(
    records: &mut HashMap<RecordKey, StoredRecord>,
    key: &RecordKey,
    edit: RecordEdit<'_>,
) -> Result<Modified, BackendError> {
    match edit(records.get(key)).map_err(BackendError::Rejected)? {
        Some(updated) => {
            records.insert(key.clone(), updated.clone());
            Ok(Modified::Written(updated))
        }
        None => Ok(Modified::Unchanged(records.get(key).cloned())),
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<StoredRecord>, BackendError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn modify(
        &self,
        key: &RecordKey,
        edit: RecordEdit<'_>,
    ) -> Result<Modified, BackendError> {
        let mut records = self.records.lock().await;
        apply_edit(&mut records, key, edit)
    }

    async fn remove(&self, key: &RecordKey) -> Result<bool, BackendError> {
        Ok(self.records.lock().await.remove(key).is_some())
    }

    async fn scan(&self) -> Result<Vec<StoredRecord>, BackendError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}
