//! A record backend that uses a local file

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, sync::Mutex};

use super::{memory::apply_edit, BackendError, Modified, RecordBackend, RecordEdit};
use crate::record::{RecordKey, StoredRecord};

#[derive(Default, Deserialize)]
struct RecordFile {
    #[serde(default)]
    records: Vec<StoredRecord>,
}

#[derive(Serialize)]
struct RecordFileRef<'a> {
    records: Vec<&'a StoredRecord>,
}

type Records = HashMap<RecordKey, StoredRecord>;

/// A record backend that persists every record in a single JSON file
///
/// The file is read once, on first use, and rewritten in full after each
/// change. Writes go to a sibling temporary file that is then renamed over
/// the target, so a crash never leaves a partially written store. On Unix
/// the file is created readable by the owner only.
///
/// Only one process should point a `FileBackend` at a given path.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    records: Mutex<Option<Records>>,
}

impl FileBackend {
    /// Constructs a new file backend
    ///
    /// The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    /// The path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_records(&self) -> Result<Records, BackendError> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Records::new()),
            Err(err) => return Err(err.into()),
        };

        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        if data.trim().is_empty() {
            return Ok(Records::new());
        }

        let parsed: RecordFile = serde_json::from_str(&data)?;
        tracing::debug!(
            path = %self.path.display(),
            records = parsed.records.len(),
            "loaded token store"
        );

        Ok(parsed
            .records
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect())
    }

    async fn write_records(&self, records: &Records) -> Result<(), BackendError> {
        use tokio::io::AsyncWriteExt;

        let mut sorted: Vec<&StoredRecord> = records.values().collect();
        sorted.sort_by(|a, b| {
            (a.key.subject_id.as_str(), a.key.provider.as_str())
                .cmp(&(b.key.subject_id.as_str(), b.key.provider.as_str()))
        });
        let data = serde_json::to_vec_pretty(&RecordFileRef { records: sorted })?;

        let tmp_path = self.tmp_path();

        let mut file_opts = OpenOptions::new();
        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RecordBackend for FileBackend {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<StoredRecord>, BackendError> {
        let mut guard = self.records.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_records().await?);
        }
        Ok(guard.as_ref().and_then(|r| r.get(key).cloned()))
    }

    async fn modify(
        &self,
        key: &RecordKey,
        edit: RecordEdit<'_>,
    ) -> Result<Modified, BackendError> {
        let mut guard = self.records.lock().await;
        let mut records = match guard.take() {
            Some(records) => records,
            None => self.read_records().await?,
        };

        let result = apply_edit(&mut records, key, edit);
        let outcome = match result {
            Ok(written @ Modified::Written(_)) => match self.write_records(&records).await {
                Ok(()) => Ok(written),
                Err(err) => {
                    // the cached view must not get ahead of the file
                    *guard = None;
                    return Err(err);
                }
            },
            Ok(unchanged @ Modified::Unchanged(_)) => Ok(unchanged),
            Err(err) => Err(err),
        };

        *guard = Some(records);
        outcome
    }

    async fn remove(&self, key: &RecordKey) -> Result<bool, BackendError> {
        let mut guard = self.records.lock().await;
        let mut records = match guard.take() {
            Some(records) => records,
            None => self.read_records().await?,
        };

        if records.remove(key).is_none() {
            *guard = Some(records);
            return Ok(false);
        }

        self.write_records(&records).await?;
        *guard = Some(records);
        Ok(true)
    }

    async fn scan(&self) -> Result<Vec<StoredRecord>, BackendError> {
        let mut guard = self.records.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_records().await?);
        }
        Ok(guard
            .as_ref()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::TokenCipher,
        record::{ExtendedSession, ExtraFields},
        ProviderId, SubjectId,
    };
    use tokenward_clock::UnixTime;

    fn key(subject: &'static str) -> RecordKey {
        RecordKey::new(&SubjectId::from_static(subject), &ProviderId::default())
    }

    fn stored(cipher: &TokenCipher, subject: &'static str) -> StoredRecord {
        StoredRecord {
            key: key(subject),
            access_token: cipher.seal("plain-access-token", "ctx").unwrap(),
            refresh_token: Some(cipher.seal("plain-refresh-token", "ctx").unwrap()),
            token_type: "Bearer".to_owned(),
            expires_at: UnixTime(1_000),
            created_at: UnixTime(0),
            last_used_at: None,
            last_refreshed_at: None,
            scope: Some("openid".to_owned()),
            session: ExtendedSession::default(),
            is_active: true,
            extra: ExtraFields::new(),
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let cipher = TokenCipher::from_key_bytes(&[1u8; 32]).unwrap();

        let backend = FileBackend::new(&path);
        let record = stored(&cipher, "alice");
        let written = record.clone();
        backend
            .modify(&key("alice"), Box::new(move |_| Ok(Some(written))))
            .await
            .unwrap();

        let reopened = FileBackend::new(&path);
        assert_eq!(reopened.fetch(&key("alice")).await.unwrap(), Some(record));
        assert_eq!(reopened.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("absent.json"));
        assert!(backend.scan().await.unwrap().is_empty());
        assert!(!backend.remove(&key("nobody")).await.unwrap());
    }

    #[tokio::test]
    async fn file_holds_no_plaintext_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let cipher = TokenCipher::from_key_bytes(&[2u8; 32]).unwrap();

        let backend = FileBackend::new(&path);
        let record = stored(&cipher, "alice");
        backend
            .modify(&key("alice"), Box::new(move |_| Ok(Some(record))))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("plain-access-token"));
        assert!(!contents.contains("plain-refresh-token"));
        assert!(contents.contains("openid"));
        assert!(!dir.path().join("tokens.json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let cipher = TokenCipher::from_key_bytes(&[3u8; 32]).unwrap();

        let backend = FileBackend::new(&path);
        let record = stored(&cipher, "alice");
        backend
            .modify(&key("alice"), Box::new(move |_| Ok(Some(record))))
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
