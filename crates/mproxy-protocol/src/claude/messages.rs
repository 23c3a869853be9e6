use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub type JsonObject = serde_json::Map<String, JsonValue>;

/// Anthropic Messages request body.
///
/// Only the fields the router and transformers actually read are typed;
/// everything else round-trips through `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequestBody {
    /// Required by the Messages API but absent on count_tokens bodies, which
    /// share this shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub messages: Vec<MessageParam>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<JsonValue>>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageParam {
    pub role: String,
    pub content: MessageContent,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<JsonValue>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemParam {
    Text(String),
    Blocks(Vec<JsonValue>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

/// `{"type": "enabled", "budget_tokens": N}`; a disabled config carries no
/// budget and deserializes to 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(default)]
    pub budget_tokens: u32,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextBlockType {
    #[serde(rename = "text")]
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    #[serde(rename = "type")]
    pub r#type: TextBlockType,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThinkingBlockType {
    #[serde(rename = "thinking")]
    Thinking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingBlock {
    #[serde(default)]
    pub signature: String,
    pub thinking: String,
    #[serde(rename = "type")]
    pub r#type: ThinkingBlockType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolUseBlockType {
    #[serde(rename = "tool_use")]
    ToolUse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub input: JsonValue,
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: ToolUseBlockType,
}

/// Response content block. Untagged: each typed variant carries a
/// single-variant `type` marker, so unknown block shapes fall through to
/// `Other` instead of failing the whole message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Text(TextBlock),
    Thinking(ThinkingBlock),
    ToolUse(ToolUseBlock),
    Other(JsonValue),
}

impl ContentBlock {
    pub fn type_name(&self) -> &str {
        match self {
            ContentBlock::Text(_) => "text",
            ContentBlock::Thinking(_) => "thinking",
            ContentBlock::ToolUse(_) => "tool_use",
            ContentBlock::Other(value) => value
                .get("type")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(flatten)]
    pub extra: JsonObject,
}

/// A finalized Anthropic message as returned on the claude channel.
///
/// Deliberately lenient: provider responses have already been normalized by
/// the response pipeline, but stray or missing fields must not break SSE
/// synthesis, so strings stand in for closed enums.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(rename = "type", default = "default_message_type")]
    pub r#type: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(flatten)]
    pub extra: JsonObject,
}

fn default_role() -> String {
    "assistant".to_string()
}

fn default_message_type() -> String {
    "message".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokensResponse {
    pub input_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips_unknown_fields() {
        let raw = json!({
            "model": "sonnet",
            "max_tokens": 100,
            "temperature": 0.5,
            "top_p": 0.9,
            "messages": [{"role": "user", "content": "hi"}],
        });
        let body: MessagesRequestBody = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(body.model, "sonnet");
        assert_eq!(body.extra.get("temperature"), Some(&json!(0.5)));
        let back = serde_json::to_value(&body).unwrap();
        assert_eq!(back.get("top_p"), Some(&json!(0.9)));
        assert_eq!(back.get("stream"), None);
    }

    #[test]
    fn content_blocks_discriminate_by_type_marker() {
        let blocks: Vec<ContentBlock> = serde_json::from_value(json!([
            {"type": "text", "text": "hello"},
            {"type": "thinking", "thinking": "hmm", "signature": "sig"},
            {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file": "a"}},
            {"type": "web_search_tool_result", "id": "s1", "content": {}},
        ]))
        .unwrap();
        assert!(matches!(blocks[0], ContentBlock::Text(_)));
        assert!(matches!(blocks[1], ContentBlock::Thinking(_)));
        assert!(matches!(blocks[2], ContentBlock::ToolUse(_)));
        assert_eq!(blocks[3].type_name(), "web_search_tool_result");
    }

    #[test]
    fn message_defaults_tolerate_sparse_bodies() {
        let message: Message =
            serde_json::from_value(json!({"content": [{"type": "text", "text": "ok"}]})).unwrap();
        assert_eq!(message.role, "assistant");
        assert_eq!(message.r#type, "message");
        assert_eq!(message.usage.input_tokens, 0);
    }

    #[test]
    fn thinking_config_without_budget_is_zero() {
        let cfg: ThinkingConfig = serde_json::from_value(json!({"type": "disabled"})).unwrap();
        assert_eq!(cfg.budget_tokens, 0);
    }
}
