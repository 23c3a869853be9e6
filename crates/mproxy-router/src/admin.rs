use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value as JsonValue, json};

use mproxy_core::AppState;
use mproxy_provider::{ConfigError, UserConfig, yaml};

pub(crate) async fn health() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

pub(crate) async fn config_status(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let container = state.snapshot();
    let mut status = container.status();
    status["transformer_cache"] = json!(state.registry().cached_instances());
    Json(status)
}

/// Validates a candidate JSON UserConfig without installing it.
pub(crate) async fn validate(
    State(state): State<Arc<AppState>>,
    Json(candidate): Json<JsonValue>,
) -> Json<JsonValue> {
    let config: UserConfig = match serde_json::from_value(candidate) {
        Ok(config) => config,
        Err(err) => return Json(validation_result(Err(ConfigError::Parse(err.to_string())))),
    };
    Json(validation_result(state.validate(&config)))
}

/// Same, accepting YAML text (with `!env` resolution applied).
pub(crate) async fn validate_yaml(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Json<JsonValue> {
    let result = yaml::load_user_config(&body).and_then(|config| state.validate(&config));
    Json(validation_result(result))
}

pub(crate) async fn reload(State(state): State<Arc<AppState>>) -> Response {
    match state.reload().await {
        Ok(summary) => Json(json!({
            "status": "reloaded",
            "providers": summary.providers,
            "models": summary.models,
        }))
        .into_response(),
        Err(err) => {
            tracing::warn!("config reload rejected: {err}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "errors": config_errors(err)})),
            )
                .into_response()
        }
    }
}

fn validation_result(result: Result<(), ConfigError>) -> JsonValue {
    match result {
        Ok(()) => json!({"valid": true, "errors": []}),
        Err(err) => json!({"valid": false, "errors": config_errors(err)}),
    }
}

fn config_errors(err: ConfigError) -> Vec<String> {
    match err {
        ConfigError::Parse(message) => vec![message],
        ConfigError::Invalid(errors) => errors,
    }
}
