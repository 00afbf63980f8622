//! The HTTP surface: thin handlers translating requests into calls on
//! the runner, models and services.

mod contacts;
mod flows;
mod ivr;
mod surveyor;
mod tickets;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::FlowhubError;
use crate::runtime::Runtime;

pub type AppState = Arc<Runtime>;

/// Error responses are JSON `{"error": "..."}` with a 4xx status for
/// client mistakes and 5xx for ours. Only the outermost sentence of the
/// error chain goes over the wire; workers log the full chain.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> ApiError {
        ApiError { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> ApiError {
        ApiError { status: StatusCode::NOT_FOUND, message: message.into() }
    }
}

impl From<FlowhubError> for ApiError {
    fn from(err: FlowhubError) -> ApiError {
        let status = match &err {
            FlowhubError::Validation(_) | FlowhubError::Search(_) => StatusCode::BAD_REQUEST,
            FlowhubError::AssetMissing(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError { status, message: err.outermost() }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> ApiError {
        FlowhubError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Builds the full router.
pub fn router(rt: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fh/ivr/c/{channel_uuid}/incoming", post(ivr::handle_incoming))
        .route("/fh/ivr/c/{channel_uuid}/handle", post(ivr::handle_callback))
        .route("/fh/ivr/c/{channel_uuid}/status", post(ivr::handle_status))
        .route("/fh/ivr/c/{channel_uuid}/call", post(ivr::handle_call_event))
        .route("/fh/surveyor/submit", post(surveyor::handle_submit))
        .route("/fh/ticket/{service}/receive", post(tickets::handle_receive))
        .route("/fh/flow/inspect", post(flows::handle_inspect))
        .route("/fh/flow/clone", post(flows::handle_clone))
        .route("/fh/flow/migrate", post(flows::handle_migrate))
        .route("/fh/contact/search", post(contacts::handle_search))
        .route("/fh/contact/parse_query", post(contacts::handle_parse_query))
        .layer(TraceLayer::new_for_http())
        .with_state(rt)
}

async fn health(State(rt): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "tasks_completed": rt.stats.tasks_completed.load(std::sync::atomic::Ordering::Relaxed),
        "tasks_failed": rt.stats.tasks_failed.load(std::sync::atomic::Ordering::Relaxed),
        "post_commit_failures": rt.stats.post_commit_failures.load(std::sync::atomic::Ordering::Relaxed),
    }))
}

/// Serves the router until the shutdown signal fires.
pub async fn serve(rt: AppState, mut shutdown: tokio::sync::watch::Receiver<bool>) -> crate::error::Result<()> {
    let address = format!("{}:{}", rt.config.address, rt.config.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| FlowhubError::Configuration(format!("error binding {address}: {e}")))?;
    info!(address, "web server started");

    axum::serve(listener, router(rt))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| FlowhubError::Configuration(format!("web server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_statuses() {
        let err: ApiError = FlowhubError::Validation("bad json".to_string()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = FlowhubError::AssetMissing("no such flow".to_string()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = FlowhubError::Queue("redis gone".to_string()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn api_error_exposes_only_outermost_sentence() {
        let err = FlowhubError::Validation("inner cause".to_string())
            .wrap("error applying pre commit hook: commit_messages");
        let api: ApiError = err.into();
        assert_eq!(api.message, "error applying pre commit hook: commit_messages");
    }
}
