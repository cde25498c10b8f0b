//! Extraction coordinator: document actor, message envelopes and the
//! extract → merge → write run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use crmx_adapters::{
    load_rules_or_default, wait_for_rows, FilePage, HttpPage, PageSource, RecordExtractor,
    StaticPage, WaitPolicy,
};
use crmx_core::{merge_batch, Category, CategoryCounts, ExtractionBatch};
use crmx_storage::{
    FileBackend, HttpClientConfig, HttpFetcher, SnapshotStore, StorageError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crmx-sync";

const DOCUMENT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub struct CrmxConfig {
    pub data_dir: PathBuf,
    pub rules_path: Option<PathBuf>,
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub web_port: u16,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for CrmxConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            rules_path: None,
            wait_timeout_ms: 3000,
            poll_interval_ms: 250,
            web_port: 8000,
            user_agent: "crmx/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl CrmxConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("CRMX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            rules_path: std::env::var("CRMX_RULES_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            wait_timeout_ms: env_parse("CRMX_WAIT_TIMEOUT_MS").unwrap_or(defaults.wait_timeout_ms),
            poll_interval_ms: env_parse("CRMX_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval_ms),
            web_port: env_parse("CRMX_WEB_PORT").unwrap_or(defaults.web_port),
            user_agent: std::env::var("CRMX_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("CRMX_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(self.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }

    pub fn open_store(&self) -> Arc<SnapshotStore> {
        Arc::new(SnapshotStore::new(Arc::new(FileBackend::new(self.data_dir.clone()))))
    }

    pub fn load_extractor(&self) -> Result<RecordExtractor> {
        let rules = load_rules_or_default(self.rules_path.as_deref())?;
        RecordExtractor::new(&rules).context("compiling extraction rules")
    }
}

/// Where the document to extract from comes from.
#[derive(Debug, Clone)]
pub enum PageTarget {
    Inline { url: String, html: String },
    File { url: String, path: PathBuf },
    Remote { url: String },
}

impl PageTarget {
    pub fn into_source(self, config: &CrmxConfig) -> Result<Arc<dyn PageSource>> {
        Ok(match self {
            PageTarget::Inline { url, html } => Arc::new(StaticPage::new(url, html)),
            PageTarget::File { url, path } => Arc::new(FilePage::new(url, path)),
            PageTarget::Remote { url } => {
                let fetcher = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                })?;
                Arc::new(HttpPage::new(url, fetcher))
            }
        })
    }
}

/// Cross-context request, tagged by `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Coordinator → document context.
    RunExtraction,
    /// Panel → coordinator.
    ExtractContacts,
}

/// Response envelope: `{"status":"success","data":..}` or
/// `{"status":"error","message":".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope<T> {
    Success { data: T },
    Error { message: String },
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Envelope::Success { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Envelope::Success { data } => Ok(data),
            Envelope::Error { message } => Err(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("could not reach the document context: {0}")]
    Messaging(String),
    #[error("{0}")]
    Extraction(String),
    #[error("saving snapshot failed: {0}")]
    Storage(#[from] StorageError),
}

/// Request/response link to the document context.
#[async_trait]
pub trait DocumentChannel: Send + Sync {
    async fn request(&self, message: Message) -> Result<Envelope<ExtractionBatch>, CoordinatorError>;
}

struct DocumentRequest {
    message: Message,
    reply: oneshot::Sender<Envelope<ExtractionBatch>>,
}

/// Sending side of a running document actor.
#[derive(Clone)]
pub struct DocumentHandle {
    tx: mpsc::Sender<DocumentRequest>,
}

#[async_trait]
impl DocumentChannel for DocumentHandle {
    async fn request(&self, message: Message) -> Result<Envelope<ExtractionBatch>, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(DocumentRequest { message, reply })
            .await
            .map_err(|_| CoordinatorError::Messaging("document context is not running".into()))?;
        response
            .await
            .map_err(|_| CoordinatorError::Messaging("document context closed before replying".into()))
    }
}

/// Run the document context as its own task. It owns the page source and
/// answers one request at a time.
pub fn spawn_document_actor(
    source: Arc<dyn PageSource>,
    extractor: Arc<RecordExtractor>,
    policy: WaitPolicy,
) -> (DocumentHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<DocumentRequest>(DOCUMENT_QUEUE_DEPTH);
    let task = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let envelope = handle_document_message(request.message, source.as_ref(), &extractor, policy).await;
            // The requester may have given up; nothing to do then.
            let _ = request.reply.send(envelope);
        }
    });
    (DocumentHandle { tx }, task)
}

/// Document-side handling of one message.
pub async fn handle_document_message(
    message: Message,
    source: &dyn PageSource,
    extractor: &RecordExtractor,
    policy: WaitPolicy,
) -> Envelope<ExtractionBatch> {
    match message {
        Message::RunExtraction => match extract_from_source(source, extractor, policy).await {
            Ok(batch) => Envelope::success(batch),
            Err(err) => Envelope::error(err.to_string()),
        },
        Message::ExtractContacts => Envelope::error("EXTRACT_CONTACTS is not handled by the document context"),
    }
}

async fn extract_from_source(
    source: &dyn PageSource,
    extractor: &RecordExtractor,
    policy: WaitPolicy,
) -> Result<ExtractionBatch, crmx_adapters::AdapterError> {
    // Fail fast on the first capture before waiting for rows.
    let first = source.capture().await?;
    extractor.extract_page(&first)?;
    let page = wait_for_rows(source, extractor, policy).await?;
    extractor.extract_page(&page)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub stored: CategoryCounts,
    pub submitted: CategoryCounts,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_sync: DateTime<Utc>,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSummary {
    pub category: Category,
    pub id: String,
    pub removed: usize,
    pub remaining: usize,
}

/// Owns the write side of the snapshot for extraction runs and deletes.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<SnapshotStore>,
    document: Arc<dyn DocumentChannel>,
}

impl Coordinator {
    pub fn new(store: Arc<SnapshotStore>, document: Arc<dyn DocumentChannel>) -> Self {
        Self { store, document }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Panel-facing entry point.
    pub async fn handle(&self, message: Message) -> Envelope<RunSummary> {
        match message {
            Message::ExtractContacts => self.run_extraction().await,
            Message::RunExtraction => Envelope::error("RUN_EXTRACTION is handled by the document context"),
        }
    }

    /// Extract, merge all three categories, write once. Every failure comes
    /// back as an error envelope.
    pub async fn run_extraction(&self) -> Envelope<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run_extraction", %run_id);
        async {
            match self.try_run(run_id).await {
                Ok(summary) => {
                    info!(
                        stored = summary.stored.total(),
                        submitted = summary.submitted.total(),
                        revision = summary.revision,
                        "extraction run stored"
                    );
                    Envelope::success(summary)
                }
                Err(err) => {
                    warn!(error = %err, "extraction run failed");
                    Envelope::error(err.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_run(&self, run_id: Uuid) -> Result<RunSummary, CoordinatorError> {
        let batch = self
            .document
            .request(Message::RunExtraction)
            .await?
            .into_result()
            .map_err(CoordinatorError::Extraction)?;

        let submitted = batch.counts();
        // Stored with millisecond precision.
        let now = Utc::now().trunc_subsecs(3);
        let snapshot = self
            .store
            .update(|current| merge_batch(&current, &batch, now))
            .await?;

        Ok(RunSummary {
            run_id,
            stored: snapshot.counts(),
            submitted,
            last_sync: now,
            revision: snapshot.revision,
        })
    }

    pub async fn delete_record(&self, category: Category, id: &str) -> Envelope<DeleteSummary> {
        match self.store.delete_record(category, id).await {
            Ok(outcome) => Envelope::success(DeleteSummary {
                category,
                id: id.to_string(),
                removed: outcome.removed,
                remaining: outcome.snapshot.list(category).len(),
            }),
            Err(err) => {
                warn!(%category, id, error = %err, "delete failed");
                Envelope::error(CoordinatorError::from(err).to_string())
            }
        }
    }
}

/// Wire a coordinator to a freshly spawned document actor for `target`.
pub fn build_coordinator(
    config: &CrmxConfig,
    store: Arc<SnapshotStore>,
    target: PageTarget,
) -> Result<(Coordinator, JoinHandle<()>)> {
    let extractor = Arc::new(config.load_extractor()?);
    let source = target.into_source(config)?;
    let (handle, task) = spawn_document_actor(source, extractor, config.wait_policy());
    Ok((Coordinator::new(store, Arc::new(handle)), task))
}

/// One extraction run against the configured store.
pub async fn run_extraction_once(config: &CrmxConfig, target: PageTarget) -> Result<Envelope<RunSummary>> {
    let (coordinator, task) = build_coordinator(config, config.open_store(), target)?;
    let envelope = coordinator.handle(Message::ExtractContacts).await;
    task.abort();
    Ok(envelope)
}
