//! Snapshot persistence over an injectable key-value backend, plus the HTTP
//! page fetcher used by remote page sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use crmx_core::{Category, Snapshot, SNAPSHOT_KEY};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crmx-storage";

const CHANGE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    #[error("storage backend rejected the write: {0}")]
    Rejected(String),
    #[error("encoding snapshot: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Asynchronous single-key storage facility.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;
}

/// Process-local backend for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Value>>,
    reject_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` fail until switched back.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected(format!("writes to `{key}` are disabled")));
        }
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// One `<key>.json` file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(key)?;
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Whole-blob replace through a temp file and atomic rename.
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating storage directory {}", self.root.display()))?;

        let bytes = serde_json::to_vec_pretty(&value)?;
        let temp_path = self
            .root
            .join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(anyhow::Error::new(err).context(format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            ))));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOutcome {
    pub removed: usize,
    pub snapshot: Snapshot,
}

/// Handle over the one snapshot blob.
///
/// `read`/`write` are the raw last-write-wins contract. `update` serializes
/// read-modify-write cycles that go through the same handle and bumps
/// `revision`; writers holding different handles can still overwrite each
/// other.
pub struct SnapshotStore {
    backend: Arc<dyn KeyValueBackend>,
    key: String,
    changes: broadcast::Sender<Snapshot>,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self::with_key(backend, SNAPSHOT_KEY)
    }

    pub fn with_key(backend: Arc<dyn KeyValueBackend>, key: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            backend,
            key: key.into(),
            changes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stored snapshot, or `None` when nothing was written yet.
    pub async fn try_read(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.backend.get(&self.key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Never fails: unreadable state is treated as no previous snapshot.
    pub async fn read(&self) -> Snapshot {
        match self.try_read().await {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(err) => {
                warn!(key = %self.key, error = %err, "snapshot unreadable; falling back to empty snapshot");
                Snapshot::default()
            }
        }
    }

    /// Replace the blob wholesale and notify subscribers.
    pub async fn write(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.store(snapshot).await.map(|_| ())
    }

    /// Write and return the snapshot as it decodes from the stored blob, so
    /// subscribers and callers see exactly what `read` will.
    async fn store(&self, snapshot: &Snapshot) -> Result<Snapshot, StorageError> {
        let value = serde_json::to_value(snapshot)?;
        let stored: Snapshot = serde_json::from_value(value.clone())?;
        self.backend.set(&self.key, value).await?;
        // No subscribers is fine.
        let _ = self.changes.send(stored.clone());
        Ok(stored)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.changes.subscribe()
    }

    /// Serialized read-modify-write. The closure sees the current snapshot and
    /// returns the next one; the stored revision is advanced by one.
    pub async fn update<F>(&self, apply: F) -> Result<Snapshot, StorageError>
    where
        F: FnOnce(Snapshot) -> Snapshot + Send,
    {
        let span = info_span!("snapshot_update", key = %self.key);
        async {
            let _guard = self.write_lock.lock().await;
            let current = self.read().await;
            let revision = current.revision;
            let mut next = apply(current);
            next.revision = revision + 1;
            self.store(&next).await
        }
        .instrument(span)
        .await
    }

    /// Remove one record by id and stamp `last_sync`.
    pub async fn delete_record(&self, category: Category, id: &str) -> Result<DeleteOutcome, StorageError> {
        let mut removed = 0;
        let snapshot = self
            .update(|mut snapshot| {
                removed = snapshot.remove(category, id);
                snapshot.last_sync = Some(Utc::now().trunc_subsecs(3));
                snapshot
            })
            .await?;
        Ok(DeleteOutcome { removed, snapshot })
    }

    /// Empty one category list. Returns how many records were dropped.
    pub async fn clear_category(&self, category: Category) -> Result<usize, StorageError> {
        let mut cleared = 0;
        self.update(|mut snapshot| {
            let list = snapshot.list_mut(category);
            cleared = list.len();
            list.clear();
            snapshot
        })
        .await?;
        Ok(cleared)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt page fetcher. Failures surface to the caller; nothing retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use crmx_core::{ExtractionBatch, Record};
    use tempfile::tempdir;

    fn contact(id: &str, name: &str) -> Record {
        Record::new(id).with_field("name", name)
    }

    fn old_sync() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn first_read_returns_empty_default() {
        let store = SnapshotStore::in_memory();
        assert_eq!(store.read().await, Snapshot::default());
        assert!(store.try_read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_blob_reads_as_empty() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set(SNAPSHOT_KEY, serde_json::json!({"contacts": "not-a-list"}))
            .await
            .unwrap();
        let store = SnapshotStore::new(backend);
        assert!(store.try_read().await.is_err());
        assert_eq!(store.read().await, Snapshot::default());
    }

    #[tokio::test]
    async fn write_broadcasts_new_snapshot() {
        let store = SnapshotStore::in_memory();
        let mut rx = store.subscribe();
        let mut snapshot = Snapshot::default();
        snapshot.contacts.push(contact("con_a", "A"));
        store.write(&snapshot).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), snapshot);
        assert_eq!(store.read().await, snapshot);
    }

    #[tokio::test]
    async fn rejected_write_leaves_previous_blob_and_sends_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SnapshotStore::new(backend.clone());
        let mut first = Snapshot::default();
        first.contacts.push(contact("con_a", "A"));
        store.write(&first).await.unwrap();

        let mut rx = store.subscribe();
        backend.reject_writes(true);
        let result = store
            .update(|s| crmx_core::merge_batch(&s, &ExtractionBatch::default(), Utc::now()))
            .await;
        assert!(matches!(result, Err(StorageError::Rejected(_))));
        assert_eq!(store.read().await, first);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_advances_revision() {
        let store = SnapshotStore::in_memory();
        let first = store.update(|s| s).await.unwrap();
        let second = store.update(|s| s).await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
    }

    #[tokio::test]
    async fn concurrent_updates_through_one_handle_do_not_lose_writes() {
        let store = Arc::new(SnapshotStore::in_memory());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(move |mut s| {
                        s.contacts.push(contact(&format!("con_{i}"), "X"));
                        s
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snapshot = store.read().await;
        assert_eq!(snapshot.contacts.len(), 8);
        assert_eq!(snapshot.revision, 8);
    }

    #[tokio::test]
    async fn delete_removes_exactly_one_record_and_moves_last_sync() {
        let store = SnapshotStore::in_memory();
        let mut snapshot = Snapshot::default();
        snapshot.contacts = vec![contact("con_a", "A"), contact("con_b", "B")];
        snapshot.last_sync = Some(old_sync());
        store.write(&snapshot).await.unwrap();

        let outcome = store.delete_record(Category::Contact, "con_a").await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.snapshot.contacts.len(), 1);
        assert_eq!(outcome.snapshot.contacts[0].id, "con_b");
        assert!(outcome.snapshot.last_sync.unwrap() > old_sync());
        assert_eq!(store.read().await, outcome.snapshot);
    }

    #[tokio::test]
    async fn delete_notification_matches_stored_snapshot() {
        let store = SnapshotStore::in_memory();
        let mut snapshot = Snapshot::default();
        snapshot.contacts = vec![contact("con_a", "A")];
        store.write(&snapshot).await.unwrap();
        let mut changes = store.subscribe();

        let outcome = store.delete_record(Category::Contact, "missing").await.unwrap();
        let notified = changes.recv().await.unwrap();
        let stored = store.read().await;

        assert_eq!(outcome.removed, 0);
        assert_eq!(notified, stored);
        assert_eq!(outcome.snapshot, stored);
        assert!(stored.last_sync.is_some());
    }

    #[tokio::test]
    async fn update_returns_the_stored_form() {
        let store = SnapshotStore::in_memory();
        let sub_ms = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let returned = store
            .update(|mut s| {
                s.last_sync = Some(sub_ms);
                s
            })
            .await
            .unwrap();
        assert_eq!(returned, store.read().await);
        assert_eq!(returned.last_sync.unwrap().timestamp_millis(), 1_700_000_000_123);
    }

    #[tokio::test]
    async fn clear_category_leaves_other_lists() {
        let store = SnapshotStore::in_memory();
        let mut snapshot = Snapshot::default();
        snapshot.contacts = vec![contact("con_a", "A")];
        snapshot.tasks = vec![Record::new("task_a").with_field("description", "Call")];
        store.write(&snapshot).await.unwrap();

        assert_eq!(store.clear_category(Category::Contact).await.unwrap(), 1);
        let after = store.read().await;
        assert!(after.contacts.is_empty());
        assert_eq!(after.tasks.len(), 1);
    }

    #[tokio::test]
    async fn file_backend_round_trips_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(Arc::new(FileBackend::new(dir.path())));
        let mut snapshot = Snapshot::default();
        snapshot.contacts.push(contact("con_a", "A"));
        snapshot.last_sync = Some(old_sync());
        store.write(&snapshot).await.unwrap();
        store.write(&snapshot).await.unwrap();

        assert_eq!(store.read().await, snapshot);
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["close_data.json".to_string()]);
    }

    #[test]
    fn file_backend_rejects_path_like_keys() {
        let backend = FileBackend::new("/tmp/unused");
        assert!(matches!(backend.path_for("../etc"), Err(StorageError::InvalidKey(_))));
        assert!(backend.path_for("close_data").is_ok());
    }
}
