use std::sync::OnceLock;

use serde_json::Value as JsonValue;
use tiktoken_rs::CoreBPE;

use mproxy_protocol::claude::messages::{
    MessageContent, MessagesRequestBody, SystemParam,
};

/// Fixed per-message framing overhead, matching the usual chat-format
/// accounting.
const PER_MESSAGE_OVERHEAD: usize = 4;

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary is embedded"))
}

/// Synthesized token estimate for providers with no native count endpoint.
/// Counts system text, message text blocks, and tool schemas.
pub fn estimate_input_tokens(body: &MessagesRequestBody) -> u64 {
    let bpe = bpe();
    let mut tokens = 0usize;

    if let Some(system) = &body.system {
        let text = match system {
            SystemParam::Text(text) => text.clone(),
            SystemParam::Blocks(blocks) => collect_block_text(blocks),
        };
        tokens += bpe.encode_with_special_tokens(&text).len();
    }

    for message in &body.messages {
        tokens += PER_MESSAGE_OVERHEAD;
        let text = match &message.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => collect_block_text(blocks),
        };
        tokens += bpe.encode_with_special_tokens(&text).len();
    }

    if let Some(tools) = &body.tools {
        for tool in tools {
            let serialized = serde_json::to_string(tool).unwrap_or_default();
            tokens += bpe.encode_with_special_tokens(&serialized).len();
        }
    }

    tokens as u64
}

fn collect_block_text(blocks: &[JsonValue]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block.get("type").and_then(JsonValue::as_str) {
            Some("text") => block.get("text").and_then(JsonValue::as_str),
            Some("tool_result") => block.get("content").and_then(JsonValue::as_str),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
