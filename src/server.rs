//! HTTP server.
//!
//! Exposes ingestion, chat routing, context invalidation and the nurture
//! ledger as a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/ingest` | Ingest one base64-encoded document |
//! | `POST` | `/chat` | Route one chat turn for a session |
//! | `POST` | `/context/invalidate` | Drop a cached entity from one or all sessions |
//! | `POST` | `/nurture/run` | Run a nurture pass now |
//! | `GET`  | `/notifications/pending` | Undelivered notification events |
//! | `POST` | `/notifications/{id}/delivered` | Mark an event delivered |
//! | `POST` | `/leads/{id}/actions` | Record an agent action on a lead |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "utterance must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `unsupported_format` (415), `extraction_failed` (422),
//! `ingest_failed` (503), `internal` (500).
//!
//! # Background tasks
//!
//! While serving, the nurture scheduler runs every `nurture.interval_secs`
//! and idle chat sessions are swept every `context.sweep_interval_secs`.
//! Both tasks are aborted when the server stops.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use estate_harness_core::models::{EntityRef, EntityType, Lead, NotificationEvent};

use crate::config::Config;
use crate::context;
use crate::error::IngestError;
use crate::harness::Harness;
use crate::ingest::IngestResult;
use crate::nurture::{self, LeadAction, PassOutcome};
use crate::router::MergedResponse;

type AppState = Arc<Harness>;

/// Open the configured database and serve on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let harness = Arc::new(Harness::open(config).await?);
    let listener = TcpListener::bind(&config.server.bind).await?;
    serve(listener, harness).await
}

/// Serve on an already-bound listener, running the background tasks.
pub async fn serve(listener: TcpListener, harness: Arc<Harness>) -> anyhow::Result<()> {
    let nurture_every = Duration::from_secs(harness.config.nurture.interval_secs.max(1));
    let sweep_every = Duration::from_secs(harness.config.context.sweep_interval_secs.max(1));
    let nurture_task = harness.scheduler.clone().spawn(nurture_every);
    let sweep_task = context::spawn_sweeper(harness.context.clone(), sweep_every);

    info!(addr = %listener.local_addr()?, "estate server listening");
    let result = axum::serve(listener, app(harness)).await;

    nurture_task.abort();
    sweep_task.abort();
    result?;
    Ok(())
}

pub fn app(harness: Arc<Harness>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ingest", post(handle_ingest))
        .route("/chat", post(handle_chat))
        .route("/context/invalidate", post(handle_invalidate))
        .route("/nurture/run", post(handle_nurture_run))
        .route("/notifications/pending", get(handle_pending))
        .route("/notifications/{id}/delivered", post(handle_delivered))
        .route("/leads/{id}/actions", post(handle_lead_action))
        .layer(cors)
        .with_state(harness)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let status = match &err {
            IngestError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            IngestError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IngestError::IngestFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        AppError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestBody {
    format: String,
    content_base64: String,
    #[serde(default)]
    source_name: Option<String>,
}

async fn handle_ingest(
    State(harness): State<AppState>,
    Json(body): Json<IngestBody>,
) -> Result<Json<IngestResult>, AppError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body.content_base64.trim())
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?;

    let source_name = body.source_name.as_deref().unwrap_or("-");
    match harness.pipeline.ingest(&bytes, &body.format).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            warn!(source_name, code = e.code(), error = %e, "ingest rejected");
            Err(e.into())
        }
    }
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatBody {
    session_id: String,
    utterance: String,
}

async fn handle_chat(
    State(harness): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<MergedResponse>, AppError> {
    if body.session_id.trim().is_empty() {
        return Err(bad_request("session_id must not be empty"));
    }
    if body.utterance.trim().is_empty() {
        return Err(bad_request("utterance must not be empty"));
    }
    Ok(Json(harness.router.route(&body.utterance, &body.session_id).await))
}

// ============ POST /context/invalidate ============

#[derive(Deserialize)]
struct InvalidateBody {
    entity_type: String,
    entity_id: String,
    /// Without a session, the entity is dropped from every session.
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct InvalidateResponse {
    invalidated: usize,
}

async fn handle_invalidate(
    State(harness): State<AppState>,
    Json(body): Json<InvalidateBody>,
) -> Result<Json<InvalidateResponse>, AppError> {
    let entity_type = EntityType::parse(&body.entity_type)
        .ok_or_else(|| bad_request(format!("unknown entity_type '{}'", body.entity_type)))?;
    let entity = EntityRef::new(entity_type, &body.entity_id);
    let invalidated = match body.session_id.as_deref() {
        Some(session_id) => usize::from(harness.context.invalidate(session_id, &entity)),
        None => harness.context.invalidate_everywhere(&entity),
    };
    Ok(Json(InvalidateResponse { invalidated }))
}

// ============ POST /nurture/run ============

async fn handle_nurture_run(State(harness): State<AppState>) -> Result<Json<PassOutcome>, AppError> {
    harness.scheduler.run_pass().await.map(Json).map_err(internal)
}

// ============ Notifications ============

#[derive(Serialize)]
struct PendingResponse {
    events: Vec<NotificationEvent>,
}

async fn handle_pending(State(harness): State<AppState>) -> Result<Json<PendingResponse>, AppError> {
    let events = harness.stores.leads.pending_events().await.map_err(internal)?;
    Ok(Json(PendingResponse { events }))
}

async fn handle_delivered(
    State(harness): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if harness.stores.leads.mark_delivered(&id).await.map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("no notification event with id: {}", id)))
    }
}

// ============ POST /leads/{id}/actions ============

#[derive(Deserialize)]
struct LeadActionBody {
    action: String,
}

async fn handle_lead_action(
    State(harness): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LeadActionBody>,
) -> Result<Json<Lead>, AppError> {
    let action = LeadAction::parse(&body.action)
        .ok_or_else(|| bad_request(format!("unknown action '{}'", body.action)))?;
    if harness.stores.leads.lead(&id).await.map_err(internal)?.is_none()
        && matches!(action, LeadAction::Qualified | LeadAction::Closed)
    {
        return Err(not_found(format!("no lead with id: {}", id)));
    }
    nurture::apply_action(harness.stores.leads.as_ref(), &id, action, Utc::now())
        .await
        .map(Json)
        .map_err(internal)
}
