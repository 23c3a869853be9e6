use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value as JsonValue;

use mproxy_core::exchange::{Channel, ExchangeRequest, Operation};
use mproxy_core::router;
use mproxy_core::{AppState, ProxyError, RequestContext};

use crate::{error_response, headers_to_vec};

/// OpenAI Responses dialect in and out; JSON only, no SSE synthesis on this
/// channel. The model field is used as the alias directly.
pub(crate) async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: JsonValue = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return error_response(&ProxyError::bad_request(format!("invalid request: {err}")));
        }
    };
    let Some(model) = payload.get("model").and_then(JsonValue::as_str) else {
        return error_response(&ProxyError::bad_request("request must include a model field"));
    };
    let model = model.to_string();

    let cx = RequestContext::new(Channel::Codex, model.clone());
    let container = state.snapshot();
    let routing = match router::route_codex(&container, &model) {
        Ok(routing) => routing,
        Err(err) => return error_response(&err),
    };

    let ingress_headers = headers_to_vec(&headers);
    state.dumper.write_ingress(&cx, &ingress_headers, &payload);
    let exchange = ExchangeRequest::new(Channel::Codex, Operation::Responses, payload)
        .with_headers(ingress_headers);

    let Some(client) = container.provider_client(&routing.provider) else {
        return error_response(&ProxyError::internal("routed provider is not loaded"));
    };
    match client.execute(exchange, &routing, &cx, &state.dumper).await {
        Ok(resp) => {
            state.dumper.write_response(&cx, &resp.body);
            tracing::info!(
                correlation_id = %cx.correlation_id,
                alias = %routing.alias,
                provider = %routing.provider,
                status = resp.status,
                latency_ms = cx.elapsed_ms() as u64,
                "codex request completed"
            );
            let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK);
            (status, Json(resp.body)).into_response()
        }
        Err(err) => {
            tracing::warn!(
                correlation_id = %cx.correlation_id,
                alias = %routing.alias,
                status = err.status,
                "codex request failed: {}",
                err.body.error.message
            );
            error_response(&err)
        }
    }
}
