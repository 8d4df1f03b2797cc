use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::assistant::{AssistantKind, ChatAssistant};
use crate::config::Config;
use crate::notification::NotificationSurface;
use crate::store::DocumentStore;

pub mod handlers;

/// Shared application state passed to handlers.
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub config: Config,
    pub general: ChatAssistant,
    pub resources: ChatAssistant,
}

impl AppState {
    pub fn assistant(&self, kind: AssistantKind) -> &ChatAssistant {
        match kind {
            AssistantKind::General => &self.general,
            AssistantKind::Resources => &self.resources,
        }
    }

    /// A fresh, unshared notification surface for one connection or request.
    pub fn mount_surface(&self) -> NotificationSurface {
        NotificationSurface::mount(
            self.store.clone(),
            self.config.presentation(),
            self.config.feed_limit,
            self.config.toast_limit,
        )
    }
}

/// Build the API router.
/// All routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/:assistant", post(handlers::chat))
        // Notifications
        .route("/notifications/stream", get(handlers::stream_notifications))
        .route(
            "/notifications/:id/read",
            post(handlers::mark_notification_read),
        )
        .route(
            "/notifications/read-all",
            post(handlers::mark_all_notifications_read),
        )
        .layer(TraceLayer::new_for_http())
        .fallback(fallback_404)
}

/// Full application: health, metrics and the API under `/api/v1`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api_router())
        .with_state(state)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
