use serde_json::Value as JsonValue;

pub use mproxy_provider::Channel;
pub use mproxy_provider::OperationKind as Operation;
pub use mproxy_transform::{Headers, JsonObject, header_get, header_remove, header_set};

/// Provider-neutral envelope for one ingress request.
///
/// `original_stream_requested` is captured exactly once, from the raw body
/// at ingress; transformers may rewrite `payload.stream` freely afterwards.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub channel: Channel,
    pub operation: Operation,
    pub payload: JsonValue,
    pub headers: Headers,
    pub original_stream_requested: bool,
    pub metadata: JsonObject,
}

impl ExchangeRequest {
    pub fn new(channel: Channel, operation: Operation, payload: JsonValue) -> Self {
        let original_stream_requested = payload
            .get("stream")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        Self {
            channel,
            operation,
            payload,
            headers: Headers::new(),
            original_stream_requested,
            metadata: JsonObject::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A completed upstream exchange, already normalized to the ingress dialect.
#[derive(Debug, Clone)]
pub struct ExchangeResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: JsonValue,
    pub upstream_model: String,
    pub annotations: JsonObject,
}

/// Reserved for true upstream streaming. The current egress path synthesizes
/// SSE from a finalized `ExchangeResponse`; this type is carried for contract
/// stability only.
#[derive(Debug, Clone)]
pub struct ExchangeStreamChunk {
    pub event: String,
    pub data: JsonValue,
    pub finished: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_intent_is_captured_at_construction() {
        let mut req = ExchangeRequest::new(
            Channel::Claude,
            Operation::Messages,
            json!({"model": "m", "stream": true}),
        );
        assert!(req.original_stream_requested);

        // Downstream mutation must not affect the captured intent.
        req.payload["stream"] = json!(false);
        assert!(req.original_stream_requested);
    }

    #[test]
    fn missing_stream_field_means_no_streaming() {
        let req = ExchangeRequest::new(Channel::Codex, Operation::Responses, json!({"model": "m"}));
        assert!(!req.original_stream_requested);
    }
}
