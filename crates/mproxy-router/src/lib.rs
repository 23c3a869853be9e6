mod admin;
mod claude;
mod codex;

use std::sync::Arc;

use axum::Router;
use axum::response::IntoResponse;
use axum::routing::{get, post};

use mproxy_core::AppState;

/// Binds every ingress endpoint to the pipeline.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/claude/v1/messages", post(claude::messages))
        .route(
            "/claude/v1/messages/count_tokens",
            post(claude::count_tokens),
        )
        .route("/codex/v1/responses", post(codex::responses))
        .route("/health", get(admin::health))
        .route("/api/config/status", get(admin::config_status))
        .route("/api/config/validate", post(admin::validate))
        .route("/api/config/validate-yaml", post(admin::validate_yaml))
        .route("/api/config/reload", post(admin::reload))
        .with_state(state)
}

pub(crate) fn headers_to_vec(headers: &axum::http::HeaderMap) -> mproxy_core::exchange::Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

pub(crate) fn error_response(err: &mproxy_core::ProxyError) -> axum::response::Response {
    let status = axum::http::StatusCode::from_u16(err.status)
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(err.to_json())).into_response()
}
