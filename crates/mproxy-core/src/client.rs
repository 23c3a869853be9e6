use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use wreq::Client;

use mproxy_transform::{Headers, TransformContext, header_remove, header_set};

use crate::context::RequestContext;
use crate::dump::Dumper;
use crate::error::ProxyError;
use crate::exchange::{ExchangeRequest, ExchangeResponse};
use crate::router::RoutingResult;
use crate::state::ProviderHandle;

pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_MESSAGE_BYTES: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamFailure::Transport { kind, message } => {
                write!(f, "transport failure ({kind:?}): {message}")
            }
        }
    }
}

/// The one seam between the pipeline and the network; tests substitute a
/// recording mock here.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

/// Pooled wreq-backed client; one underlying pool per distinct timeout so
/// per-provider timeouts stay configurable.
pub struct WreqUpstreamClient {
    clients: Mutex<HashMap<u64, Client>>,
}

impl WreqUpstreamClient {
    pub fn new() -> Result<Self, wreq::Error> {
        let default = build_client(Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS))?;
        let mut clients = HashMap::new();
        clients.insert(DEFAULT_UPSTREAM_TIMEOUT_SECS, default);
        Ok(Self {
            clients: Mutex::new(clients),
        })
    }

    fn client_for_timeout(&self, timeout: Duration) -> Result<Client, UpstreamFailure> {
        let secs = timeout.as_secs().max(1);
        let mut guard = self.clients.lock().map_err(|_| UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Other,
            message: "upstream client cache lock failed".to_string(),
        })?;
        if let Some(client) = guard.get(&secs) {
            return Ok(client.clone());
        }
        let client = build_client(Duration::from_secs(secs)).map_err(map_wreq_error)?;
        guard.insert(secs, client.clone());
        Ok(client)
    }
}

fn build_client(timeout: Duration) -> Result<Client, wreq::Error> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let client = self.client_for_timeout(req.timeout)?;
            let method = match req.method {
                HttpMethod::Get => wreq::Method::GET,
                HttpMethod::Post => wreq::Method::POST,
            };
            let mut builder = client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|v| (k.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = resp.bytes().await.map_err(map_wreq_error)?;
            Ok(UpstreamHttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let kind = if err.is_timeout() {
        UpstreamTransportErrorKind::Timeout
    } else if err.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            UpstreamTransportErrorKind::Dns
        } else if lowered.contains("tls") || lowered.contains("ssl") {
            UpstreamTransportErrorKind::Tls
        } else {
            UpstreamTransportErrorKind::Connect
        }
    } else {
        UpstreamTransportErrorKind::Other
    };
    UpstreamFailure::Transport { kind, message }
}

/// Executes one exchange against one provider: request pipeline, a single
/// forced-non-streaming upstream POST, then the response pipeline.
#[derive(Clone)]
pub struct ProviderClient {
    handle: Arc<ProviderHandle>,
    upstream: Arc<dyn UpstreamClient>,
}

impl ProviderClient {
    pub fn new(handle: Arc<ProviderHandle>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self { handle, upstream }
    }

    pub fn provider_name(&self) -> &str {
        &self.handle.config.name
    }

    pub async fn execute(
        &self,
        mut req: ExchangeRequest,
        routing: &RoutingResult,
        cx: &RequestContext,
        dumper: &Dumper,
    ) -> Result<ExchangeResponse, ProxyError> {
        let spec = self
            .handle
            .descriptor
            .operation(req.channel, req.operation)
            .ok_or_else(|| {
                ProxyError::not_supported(format!(
                    "provider '{}' does not support this operation",
                    self.handle.config.name
                ))
            })?;
        let pipeline = self
            .handle
            .pipeline(req.channel, req.operation)
            .ok_or_else(|| ProxyError::internal("pipeline missing for supported operation"))?;

        let payload = req.payload.as_object_mut().ok_or_else(|| {
            ProxyError::bad_request("request payload must be a JSON object")
        })?;
        payload.insert("model".to_string(), json!(routing.resolved_model));
        // Upstream streaming is deliberately off: transformers stay plain
        // functions over complete documents and SSE is synthesized on egress.
        payload.insert("stream".to_string(), json!(false));
        req.metadata
            .insert("ingress_model".to_string(), json!(cx.original_model));

        header_remove(&mut req.headers, "x-api-key");
        header_remove(&mut req.headers, "authorization");

        let mut ctx = TransformContext {
            provider: self.handle.config.name.clone(),
            provider_kind: self.handle.config.kind.as_str().to_string(),
            base_url: self.handle.config.base_url.clone(),
            api_key: self.handle.config.api_key.clone(),
            routing_key: routing.routing_key.as_str().to_string(),
            ingress_model: cx.original_model.clone(),
            resolved_model: routing.resolved_model.clone(),
            correlation_id: cx.correlation_id.clone(),
            ..TransformContext::default()
        };

        for (name, transformer) in &pipeline.request {
            transformer
                .transform(&mut req.payload, &mut req.headers, &mut ctx)
                .map_err(|err| ProxyError::transformer_failed(name, err))?;
        }
        dumper.write_transformed(cx, &req.headers, &req.payload);

        let url = resolve_url(&ctx, spec.suffix, &routing.resolved_model);
        let body = serde_json::to_vec(&req.payload)
            .map_err(|err| ProxyError::internal(format!("failed to encode payload: {err}")))?;
        header_set(&mut req.headers, "content-type", "application/json");

        let timeout = Duration::from_secs(
            self.handle
                .config
                .timeout
                .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
        );
        let upstream_req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers: req.headers.clone(),
            body: Some(Bytes::from(body)),
            timeout,
        };

        let started = Instant::now();
        let resp = self
            .upstream
            .send(upstream_req)
            .await
            .map_err(failure_to_error)?;
        let upstream_latency_ms = started.elapsed().as_millis() as u64;

        if !(200..300).contains(&resp.status) {
            // Error bodies skip the response pipeline; they are mapped, not
            // normalized.
            return Err(ProxyError::upstream(
                resp.status,
                extract_upstream_message(&resp.body),
            ));
        }

        let mut body: JsonValue = serde_json::from_slice(&resp.body).map_err(|err| {
            ProxyError::upstream_unreachable(format!("invalid upstream JSON: {err}"))
        })?;
        for (name, transformer) in &pipeline.response {
            transformer
                .transform_response(&mut body, &ctx)
                .map_err(|err| ProxyError::transformer_failed(name, err))?;
        }

        let mut headers = filter_response_headers(&resp.headers);
        header_set(&mut headers, "content-type", "application/json");

        let mut annotations = serde_json::Map::new();
        annotations.insert("provider".to_string(), json!(self.handle.config.name));
        annotations.insert("routing_key".to_string(), json!(routing.routing_key.as_str()));
        annotations.insert("alias".to_string(), json!(routing.alias));
        annotations.insert("upstream_latency_ms".to_string(), json!(upstream_latency_ms));
        if let Some(usage) = body.get("usage") {
            annotations.insert("usage".to_string(), usage.clone());
        }
        if let Some(request_id) = mproxy_transform::header_get(&resp.headers, "request-id")
            .or_else(|| mproxy_transform::header_get(&resp.headers, "x-request-id"))
        {
            annotations.insert("upstream_request_id".to_string(), json!(request_id));
        }

        Ok(ExchangeResponse {
            status: resp.status,
            headers,
            body,
            upstream_model: routing.resolved_model.clone(),
            annotations,
        })
    }
}

fn failure_to_error(failure: UpstreamFailure) -> ProxyError {
    match &failure {
        UpstreamFailure::Transport { kind, message } => match kind {
            UpstreamTransportErrorKind::Timeout => ProxyError::upstream_timeout(message.clone()),
            _ => ProxyError::upstream_unreachable(message.clone()),
        },
    }
}

/// base_url + operation suffix (with `{model}` substituted), unless a
/// request transformer overrode the URL; query parameters contributed by
/// transformers are appended either way.
pub fn resolve_url(ctx: &TransformContext, suffix: &str, model: &str) -> String {
    let mut url = match &ctx.url_override {
        Some(override_url) => override_url.clone(),
        None => format!(
            "{}{}",
            ctx.base_url.trim_end_matches('/'),
            suffix.replace("{model}", model)
        ),
    };
    if !ctx.query.is_empty() {
        let encoded: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(ctx.query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&encoded);
    }
    url
}

fn extract_upstream_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<JsonValue>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(JsonValue::as_str)
        {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(JsonValue::as_str) {
            return message.to_string();
        }
    }
    let text = String::from_utf8_lossy(body);
    let mut message = text.trim().to_string();
    if message.is_empty() {
        message = "upstream returned an error with no body".to_string();
    }
    message.truncate(MAX_ERROR_MESSAGE_BYTES);
    message
}

fn filter_response_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| {
            !matches!(
                name.to_ascii_lowercase().as_str(),
                "content-length" | "transfer-encoding" | "connection" | "content-encoding"
            )
        })
        .cloned()
        .collect()
}
