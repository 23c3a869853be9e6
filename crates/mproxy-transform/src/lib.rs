pub mod anthropic;
pub mod gemini;
pub mod headers;
pub mod openai;
pub mod openai_responses;
pub mod util;

use serde_json::Value as JsonValue;

pub use headers::{Headers, header_get, header_remove, header_set};

pub type JsonObject = serde_json::Map<String, JsonValue>;

/// Per-call context handed to every transformer.
///
/// Mirrors the exchange metadata bag: transformers read provider identity and
/// routing facts, and may write a URL override or extra query parameters that
/// the provider client folds into the final upstream URL.
#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    pub provider: String,
    pub provider_kind: String,
    pub base_url: String,
    pub api_key: String,
    pub routing_key: String,
    pub ingress_model: String,
    pub resolved_model: String,
    pub correlation_id: String,
    pub url_override: Option<String>,
    pub query: Vec<(String, String)>,
    pub metadata: JsonObject,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("bad transformer params: {0}")]
    BadParams(String),
}

/// Rewrites an outgoing payload and header set before the upstream call.
pub trait RequestTransformer: Send + Sync {
    fn transform(
        &self,
        payload: &mut JsonValue,
        headers: &mut Headers,
        ctx: &mut TransformContext,
    ) -> Result<(), TransformError>;
}

/// Normalizes a decoded upstream body into the ingress dialect.
pub trait ResponseTransformer: Send + Sync {
    fn transform_response(
        &self,
        body: &mut JsonValue,
        ctx: &TransformContext,
    ) -> Result<(), TransformError>;
}

/// Reserved for true upstream streaming; registered and validated but never
/// driven by the current egress path, which synthesizes SSE from the
/// finalized response.
pub trait StreamTransformer: Send + Sync {
    fn transform_chunk(
        &self,
        chunk: &[u8],
        ctx: &TransformContext,
    ) -> Result<Vec<u8>, TransformError>;
}

/// Whether a tool entry is an Anthropic built-in (server) tool: it declares a
/// `type` but no `input_schema`.
pub fn is_builtin_tool(tool: &JsonValue) -> bool {
    tool.as_object()
        .map(|obj| obj.contains_key("type") && !obj.contains_key("input_schema"))
        .unwrap_or(false)
}

/// Thinking budget to OpenAI reasoning effort.
pub fn reasoning_effort_for_budget(budget_tokens: u64) -> Option<&'static str> {
    if budget_tokens == 0 {
        return None;
    }
    Some(match budget_tokens {
        0..1024 => "low",
        1024..8192 => "medium",
        _ => "high",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_tool_detection() {
        assert!(is_builtin_tool(&json!({"type": "web_search_20241022", "name": "web_search"})));
        assert!(!is_builtin_tool(
            &json!({"name": "Read", "input_schema": {"type": "object"}})
        ));
        assert!(!is_builtin_tool(&json!("not a tool")));
    }

    #[test]
    fn reasoning_effort_thresholds() {
        assert_eq!(reasoning_effort_for_budget(0), None);
        assert_eq!(reasoning_effort_for_budget(512), Some("low"));
        assert_eq!(reasoning_effort_for_budget(1024), Some("medium"));
        assert_eq!(reasoning_effort_for_budget(4000), Some("medium"));
        assert_eq!(reasoning_effort_for_budget(8192), Some("high"));
    }
}
