//! HTTP surfaces: webhook, job submission/status/reports, contacts, health.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactStore, ReportKind};
use crate::delivery::DeliveryNormalizer;
use crate::error::Error;
use crate::hub::ws::{ChatState, chat_routes};
use crate::job::JobEngine;
use crate::source::CsvRowSource;
use crate::store::Store;
use crate::template::TemplateKind;
use crate::transport::Transport;

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<JobEngine>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub normalizer: Arc<DeliveryNormalizer>,
    pub transport: Arc<dyn Transport>,
    pub verify_token: String,
}

/// Build the full application router: REST surfaces plus the chat
/// WebSocket, with permissive CORS for the dashboard frontend.
pub fn app_router(state: AppState, chat: ChatState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/{id}", get(job_status))
        .route("/api/jobs/{id}/report/{kind}", get(download_report))
        .route("/api/contacts", get(contacts))
        .route("/api/media", post(upload_media))
        .with_state(state)
        .merge(chat_routes(chat))
        .layer(CorsLayer::permissive())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "wa-dispatch"
    }))
}

// ── Webhook ─────────────────────────────────────────────────────────────

/// Provider verification handshake: echo the challenge when the shared
/// secret matches.
async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == Some("subscribe") && token == Some(state.verify_token.as_str()) {
        (StatusCode::OK, challenge).into_response()
    } else {
        (StatusCode::BAD_REQUEST, "Invalid verification.").into_response()
    }
}

/// Event delivery: inbound messages and delivery receipts.
///
/// A parseable envelope always gets a success response — per-item failures
/// are confined inside the normalizer so the provider never redelivers the
/// whole batch over one bad item.
async fn receive_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<serde_json::Value>,
) -> impl IntoResponse {
    state.normalizer.process_envelope(&envelope).await;
    Json(serde_json::json!({"status": "received"}))
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubmitRequest {
    /// Template selector: snake_case name or legacy numeric code.
    template: String,
    /// Server-side CSV locator.
    source: String,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> impl IntoResponse {
    let template: TemplateKind = match body.template.parse() {
        Ok(template) => template,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            );
        }
    };

    let source = Arc::new(CsvRowSource::new(&body.source));
    match state.engine.submit(source, template).await {
        Ok(job_id) => {
            info!(job_id = %job_id, "Job accepted");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({"job_id": job_id})),
            )
        }
        Err(e @ (Error::Template(_) | Error::Source(_))) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e) => {
            warn!(error = %e, "Job submission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "submission failed"})),
            )
        }
    }
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let Ok(job_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid job ID"})),
        );
    };

    match state.store.get_job(job_id).await {
        Ok(Some(job)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "job_id": job.job_id,
                "template": job.template.key(),
                "status": job.status,
                "total": job.total,
                "attempted": job.attempted,
                "succeeded": job.succeeded,
                "failed": job.failed,
                "dead": job.dead,
                "progress": job.progress_percent(),
                "started_at": job.started_at,
                "completed_at": job.completed_at,
                "success_report": job.success_report,
                "failed_report": job.failed_report,
            })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Job not found"})),
        ),
        Err(e) => {
            warn!(error = %e, "Job lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "lookup failed"})),
            )
        }
    }
}

async fn download_report(
    State(state): State<AppState>,
    Path((id, kind)): Path<(String, String)>,
) -> impl IntoResponse {
    let Ok(job_id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, "Invalid job ID").into_response();
    };
    let Ok(kind) = kind.parse::<ReportKind>() else {
        return (StatusCode::BAD_REQUEST, "Unknown report kind").into_response();
    };

    let job = match state.store.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return (StatusCode::NOT_FOUND, "Job not found").into_response(),
        Err(e) => {
            warn!(error = %e, "Job lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed").into_response();
        }
    };

    let key = match kind {
        ReportKind::Success => job.success_report,
        ReportKind::Failed => job.failed_report,
    };
    let Some(key) = key else {
        return (StatusCode::NOT_FOUND, "Report not ready").into_response();
    };

    match state.artifacts.read_bytes(&key).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{key}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(key = %key, error = %e, "Report read failed");
            (StatusCode::NOT_FOUND, "Report not found").into_response()
        }
    }
}

// ── Media ───────────────────────────────────────────────────────────────

/// Push media bytes to the provider ahead of a `send_message` with
/// `media_id`. The body is the raw file; mime comes from Content-Type and
/// the filename from the query string.
async fn upload_media(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let filename = params
        .get("filename")
        .cloned()
        .unwrap_or_else(|| "upload.bin".to_string());

    match state
        .transport
        .upload_media(body.to_vec(), &mime, &filename)
        .await
    {
        Ok(media_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"media_id": media_id})),
        ),
        Err(e) => {
            warn!(error = %e, "Media upload failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

// ── Contacts ────────────────────────────────────────────────────────────

async fn contacts(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let q = params.get("q").map(String::as_str).unwrap_or("");
    match state.store.contacts(q).await {
        Ok(contacts) => (
            StatusCode::OK,
            Json(serde_json::json!({"contacts": contacts})),
        ),
        Err(e) => {
            warn!(error = %e, "Contacts query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "contacts query failed"})),
            )
        }
    }
}
