use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value as JsonValue;

use mproxy_core::exchange::{Channel, ExchangeRequest, Operation};
use mproxy_core::router::{self, RoutingResult};
use mproxy_core::{AppState, ProxyError, RequestContext, count_tokens, sse_synth};
use mproxy_protocol::claude::messages::MessagesRequestBody;
use mproxy_provider::{OperationKind, ProviderKind};

use crate::{error_response, headers_to_vec};

pub(crate) async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut request: MessagesRequestBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&ProxyError::bad_request(format!("invalid request: {err}")));
        }
    };

    // Captured once, before any mutation of the payload.
    let original_stream = request.stream.unwrap_or(false);
    let cx = RequestContext::new(Channel::Claude, request.model.clone());
    let container = state.snapshot();

    router::ensure_thinking_budget(&mut request);
    let signals = container.inspector.inspect(&mut request);
    let routing = match router::route_claude(&container, &signals) {
        Ok(routing) => routing,
        Err(err) => {
            log_failure(&cx, None, &err);
            return error_response(&err);
        }
    };

    let ingress_headers = headers_to_vec(&headers);
    let payload = match serde_json::to_value(&request) {
        Ok(payload) => payload,
        Err(err) => return error_response(&ProxyError::internal(err.to_string())),
    };
    state.dumper.write_ingress(&cx, &ingress_headers, &payload);

    let exchange =
        ExchangeRequest::new(Channel::Claude, Operation::Messages, payload).with_headers(ingress_headers);

    let Some(client) = container.provider_client(&routing.provider) else {
        return error_response(&ProxyError::internal("routed provider is not loaded"));
    };
    match client.execute(exchange, &routing, &cx, &state.dumper).await {
        Ok(resp) => {
            state.dumper.write_response(&cx, &resp.body);
            log_completion(&cx, &routing, resp.status, &resp.annotations);
            if original_stream {
                sse_response(resp.body, &state)
            } else {
                (status_of(resp.status), Json(resp.body)).into_response()
            }
        }
        Err(err) => {
            log_failure(&cx, Some(&routing), &err);
            error_response(&err)
        }
    }
}

pub(crate) async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut request: MessagesRequestBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&ProxyError::bad_request(format!("invalid request: {err}")));
        }
    };

    let cx = RequestContext::new(Channel::Claude, request.model.clone());
    let container = state.snapshot();
    let signals = container.inspector.inspect(&mut request);
    let routing = match router::route_claude(&container, &signals) {
        Ok(routing) => routing,
        Err(err) => return error_response(&err),
    };

    let Some(handle) = container.provider_handle(&routing.provider) else {
        return error_response(&ProxyError::internal("routed provider is not loaded"));
    };

    if handle
        .descriptor
        .supports(mproxy_provider::Channel::Claude, OperationKind::CountTokens)
    {
        let ingress_headers = headers_to_vec(&headers);
        let payload = match serde_json::to_value(&request) {
            Ok(payload) => payload,
            Err(err) => return error_response(&ProxyError::internal(err.to_string())),
        };
        let exchange = ExchangeRequest::new(Channel::Claude, Operation::CountTokens, payload)
            .with_headers(ingress_headers);
        let Some(client) = container.provider_client(&routing.provider) else {
            return error_response(&ProxyError::internal("routed provider is not loaded"));
        };
        return match client.execute(exchange, &routing, &cx, &state.dumper).await {
            Ok(resp) => {
                log_completion(&cx, &routing, resp.status, &resp.annotations);
                (status_of(resp.status), Json(resp.body)).into_response()
            }
            Err(err) => {
                log_failure(&cx, Some(&routing), &err);
                error_response(&err)
            }
        };
    }

    // No native count endpoint upstream: estimate for OpenAI-shaped
    // providers, refuse otherwise.
    match handle.config.kind {
        ProviderKind::OpenAI | ProviderKind::OpenAIResponses => {
            let estimate = count_tokens::estimate_input_tokens(&request);
            log_completion(&cx, &routing, 200, &serde_json::Map::new());
            Json(serde_json::json!({"input_tokens": estimate})).into_response()
        }
        _ => error_response(&ProxyError::not_supported(format!(
            "provider '{}' does not support token counting",
            routing.provider
        ))),
    }
}

fn sse_response(body: JsonValue, state: &AppState) -> Response {
    let stream = sse_synth::spawn_stream(body, state.ping_interval).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn status_of(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
}

fn log_completion(
    cx: &RequestContext,
    routing: &RoutingResult,
    status: u16,
    annotations: &serde_json::Map<String, JsonValue>,
) {
    let usage = annotations.get("usage");
    let input_tokens = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    let upstream_latency_ms = annotations
        .get("upstream_latency_ms")
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    tracing::info!(
        correlation_id = %cx.correlation_id,
        routing_key = routing.routing_key.as_str(),
        alias = %routing.alias,
        provider = %routing.provider,
        status,
        upstream_latency_ms,
        latency_ms = cx.elapsed_ms() as u64,
        input_tokens,
        output_tokens,
        "request completed"
    );
}

fn log_failure(cx: &RequestContext, routing: Option<&RoutingResult>, err: &ProxyError) {
    tracing::warn!(
        correlation_id = %cx.correlation_id,
        routing_key = routing.map(|r| r.routing_key.as_str()).unwrap_or("unrouted"),
        alias = routing.map(|r| r.alias.as_str()).unwrap_or(""),
        provider = routing.map(|r| r.provider.as_str()).unwrap_or(""),
        status = err.status,
        error_type = err.error_type(),
        latency_ms = cx.elapsed_ms() as u64,
        "request failed: {}",
        err.body.error.message
    );
}
