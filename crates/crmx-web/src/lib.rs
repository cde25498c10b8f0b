//! Axum + Askama panel over the snapshot store, plus the JSON API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use crmx_core::{Category, CategoryCounts, Contact, Snapshot};
use crmx_sync::{build_coordinator, Coordinator, CrmxConfig, Envelope, Message, PageTarget, RunSummary};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use url::form_urlencoded::byte_serialize;

pub const CRATE_NAME: &str = "crmx-web";

const DEFAULT_CHANGE_WAIT_MS: u64 = 25_000;
const MAX_CHANGE_WAIT_MS: u64 = 60_000;
const RUN_IN_FLIGHT_MESSAGE: &str = "An extraction is already running";

pub struct AppState {
    pub coordinator: Coordinator,
    extracting: AtomicBool,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            extracting: AtomicBool::new(false),
        }
    }

    pub fn is_extracting(&self) -> bool {
        self.extracting.load(Ordering::SeqCst)
    }

    /// Run one extraction unless another is in flight.
    async fn guarded_run(&self) -> Option<Envelope<RunSummary>> {
        if self
            .extracting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let _reset = InFlight(&self.extracting);
        Some(self.coordinator.handle(Message::ExtractContacts).await)
    }
}

/// Clears the in-flight flag when the run ends, including on cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize, Default)]
struct IndexQuery {
    q: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChangesQuery {
    after: Option<u64>,
    wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct ContactRow {
    name: String,
    lead: String,
    emails: String,
    phones: String,
    delete_path: String,
}

#[derive(Debug, Clone)]
struct Notice {
    text: String,
    is_error: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    last_sync: String,
    query: String,
    counts: CategoryCounts,
    contacts: Vec<ContactRow>,
    notice: Option<Notice>,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/extract", post(extract_form_handler))
        .route("/contacts/{id}/delete", post(delete_contact_form_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/snapshot/changes", get(snapshot_changes_handler))
        .route("/api/extract", post(extract_api_handler))
        .route("/api/records/{category}/{id}", delete(delete_record_api_handler))
        .with_state(state)
}

/// Bind the panel on `CRMX_WEB_PORT`, extracting from `target` on demand.
pub async fn serve_from_env(target: PageTarget) -> anyhow::Result<()> {
    let config = CrmxConfig::from_env();
    let (coordinator, _document) = build_coordinator(&config, config.open_store(), target)?;
    let state = Arc::new(AppState::new(coordinator));
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, data_dir = %config.data_dir.display(), "serving panel");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>, Query(query): Query<IndexQuery>) -> Response {
    let snapshot = state.coordinator.store().read().await;
    render_html(index_page(&snapshot, query.q.unwrap_or_default(), None))
}

async fn extract_form_handler(State(state): State<Arc<AppState>>) -> Response {
    let (status, notice) = match state.guarded_run().await {
        None => (
            StatusCode::CONFLICT,
            Notice {
                text: RUN_IN_FLIGHT_MESSAGE.to_string(),
                is_error: true,
            },
        ),
        Some(Envelope::Success { data }) => (
            StatusCode::OK,
            Notice {
                text: format!(
                    "Extracted {} contacts, {} opportunities, {} tasks",
                    data.submitted.contacts, data.submitted.opportunities, data.submitted.tasks
                ),
                is_error: false,
            },
        ),
        Some(Envelope::Error { message }) => (StatusCode::OK, Notice { text: message, is_error: true }),
    };
    let snapshot = state.coordinator.store().read().await;
    let mut resp = render_html(index_page(&snapshot, String::new(), Some(notice)));
    if resp.status() == StatusCode::OK {
        *resp.status_mut() = status;
    }
    resp
}

async fn delete_contact_form_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.coordinator.delete_record(Category::Contact, &id).await {
        Envelope::Success { .. } => Redirect::to("/").into_response(),
        Envelope::Error { message } => server_error(anyhow::anyhow!(message)),
    }
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(state.coordinator.store().read().await)
}

/// Long-poll: answers as soon as the stored revision passes `after`, or with
/// 204 once `wait_ms` runs out.
async fn snapshot_changes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let store = state.coordinator.store();
    let after = query.after.unwrap_or(0);
    let wait = Duration::from_millis(
        query
            .wait_ms
            .unwrap_or(DEFAULT_CHANGE_WAIT_MS)
            .min(MAX_CHANGE_WAIT_MS),
    );

    // Subscribe before reading so a write in between is not missed.
    let mut changes = store.subscribe();
    let current = store.read().await;
    if current.revision > after {
        return Json(current).into_response();
    }

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, changes.recv()).await {
            Err(_) => return StatusCode::NO_CONTENT.into_response(),
            Ok(Ok(snapshot)) if snapshot.revision > after => return Json(snapshot).into_response(),
            Ok(Ok(_)) => continue,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "change listener lagged; re-reading snapshot");
                let latest = store.read().await;
                if latest.revision > after {
                    return Json(latest).into_response();
                }
            }
            Ok(Err(RecvError::Closed)) => return StatusCode::NO_CONTENT.into_response(),
        }
    }
}

async fn extract_api_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.guarded_run().await {
        Some(envelope) => Json(envelope).into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(Envelope::<RunSummary>::error(RUN_IN_FLIGHT_MESSAGE)),
        )
            .into_response(),
    }
}

async fn delete_record_api_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((category, id)): AxumPath<(String, String)>,
) -> Response {
    let category: Category = match category.parse() {
        Ok(category) => category,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(Envelope::<()>::error(format!("{err}")))).into_response();
        }
    };
    Json(state.coordinator.delete_record(category, &id).await).into_response()
}

fn index_page(snapshot: &Snapshot, query: String, notice: Option<Notice>) -> IndexTemplate {
    let contacts = snapshot
        .typed::<Contact>()
        .into_iter()
        .filter(|c| c.matches_query(&query))
        .map(|c| ContactRow {
            delete_path: encode_path_segment(&c.id),
            name: c.name,
            lead: c.lead,
            emails: c.emails.join(", "),
            phones: c.phones.join(", "),
        })
        .collect();
    IndexTemplate {
        last_sync: snapshot
            .last_sync
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "Never".to_string()),
        query,
        counts: snapshot.counts(),
        contacts,
        notice,
    }
}

/// Record ids are base64 and may contain `/`, `+` and `=`.
fn encode_path_segment(raw: &str) -> String {
    byte_serialize(raw.as_bytes()).collect()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
