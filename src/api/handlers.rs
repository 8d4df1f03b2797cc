use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::WatchStream;

use super::AppState;
use crate::assistant::AssistantKind;
use crate::errors::AppError;
use crate::metrics;
use crate::models::chat::ChatMessage;
use crate::models::session::{Role, Session};
use crate::notification::{FeedSnapshot, Toast};

pub const USER_ID_HEADER: &str = "x-classhub-user-id";
pub const ROLE_HEADER: &str = "x-classhub-role";

/// How long a request waits for the feed's first delivery before acting.
const LOAD_TIMEOUT: Duration = Duration::from_secs(5);

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub reply: String,
}

/// Session set by the fronting auth collaborator.
fn session_from_headers(headers: &HeaderMap) -> Result<Session, AppError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(AppError::Unauthorized)?;

    let role = match headers.get(ROLE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(raw) => raw.parse::<Role>().map_err(AppError::BadRequest)?,
        None => Role::Student,
    };

    Ok(Session::new(user_id, role))
}

fn feed_event(snapshot: &FeedSnapshot) -> Event {
    let data = json!({
        "items": snapshot.items,
        "unread": snapshot.unread_count(),
        "loaded": snapshot.loaded,
    });
    Event::default().event("feed").data(data.to_string())
}

fn toast_event(toasts: &[Toast]) -> Event {
    let data = serde_json::to_string(toasts).unwrap_or_default();
    Event::default().event("toast").data(data)
}

// ── Chat ─────────────────────────────────────────────────────

/// POST /api/v1/chat/:assistant — one assistant turn
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Path(assistant): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let kind: AssistantKind = assistant
        .parse()
        .map_err(|_| AppError::UnknownAssistant(assistant.clone()))?;

    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest("message must not be empty".into()));
    }

    let reply = state
        .assistant(kind)
        .reply(&req.history, req.message.trim())
        .await;

    Ok(Json(ChatResponse { reply }))
}

// ── Notification Stream (SSE) ────────────────────────────────

/// GET /api/v1/notifications/stream — live feed and toasts for one session
pub async fn stream_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session = session_from_headers(&headers)?;
    let user_id = session.user_id.clone();

    let surface = state.mount_surface();
    let feed_updates = WatchStream::new(surface.feed().updates()).map(|snapshot| feed_event(&snapshot));
    let toast_updates = WatchStream::new(surface.toasts().subscribe()).map(|toasts| toast_event(&toasts));
    surface.sign_in(session);
    tracing::debug!(user_id = %user_id, "notification stream opened");

    // The surface lives exactly as long as the client stays connected.
    let stream = stream::select(feed_updates, toast_updates).map(move |event| {
        let _mounted = &surface;
        Ok::<_, Infallible>(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Notification Mutations ───────────────────────────────────

/// POST /api/v1/notifications/:id/read — mark as read
pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = session_from_headers(&headers)?;
    let surface = state.mount_surface();
    surface.sign_in(session);

    if surface.loaded(LOAD_TIMEOUT).await.is_none() {
        tracing::warn!(id = %id, "notification feed did not load before mark_as_read");
    }
    surface.feed().mark_as_read(&id).await?;

    let toasts = surface.visible_toasts();
    Ok(Json(json!({ "success": toasts.is_empty(), "toasts": toasts })))
}

/// POST /api/v1/notifications/read-all — mark every unread notification
pub async fn mark_all_notifications_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = session_from_headers(&headers)?;
    let surface = state.mount_surface();
    surface.sign_in(session);

    let unread = match surface.loaded(LOAD_TIMEOUT).await {
        Some(snapshot) => snapshot.unread_count(),
        None => {
            tracing::warn!("notification feed did not load before mark_all_as_read");
            0
        }
    };
    surface.feed().mark_all_as_read().await?;

    let toasts = surface.visible_toasts();
    Ok(Json(json!({
        "success": toasts.is_empty(),
        "requested": unread,
        "toasts": toasts,
    })))
}

// ── Metrics ──────────────────────────────────────────────────

/// GET /metrics — Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
