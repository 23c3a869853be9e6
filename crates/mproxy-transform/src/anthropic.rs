use serde_json::{Value as JsonValue, json};

use crate::{
    Headers, RequestTransformer, ResponseTransformer, TransformContext, TransformError,
    header_remove, header_set, is_builtin_tool,
};

const MAX_CACHE_BREAKPOINTS: usize = 4;

/// Injects Anthropic credential headers and drops stale transport headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderInject;

impl RequestTransformer for HeaderInject {
    fn transform(
        &self,
        _payload: &mut JsonValue,
        headers: &mut Headers,
        ctx: &mut TransformContext,
    ) -> Result<(), TransformError> {
        header_remove(headers, "authorization");
        header_remove(headers, "host");
        header_remove(headers, "content-length");
        header_set(headers, "x-api-key", ctx.api_key.clone());
        if crate::header_get(headers, "anthropic-version").is_none() {
            header_set(headers, "anthropic-version", "2023-06-01");
        }
        Ok(())
    }
}

/// Strips the trailing `gitStatus:` snapshot from the last system text block.
/// The snapshot changes on every turn and would defeat prompt caching.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCleaner;

impl RequestTransformer for SystemCleaner {
    fn transform(
        &self,
        payload: &mut JsonValue,
        _headers: &mut Headers,
        _ctx: &mut TransformContext,
    ) -> Result<(), TransformError> {
        let Some(system) = payload.get_mut("system") else {
            return Ok(());
        };

        match system {
            JsonValue::String(text) => {
                if let Some(cleaned) = strip_git_status(text) {
                    *text = cleaned;
                }
            }
            JsonValue::Array(blocks) => {
                if let Some(last) = blocks.last_mut()
                    && let Some(text) = last.get("text").and_then(JsonValue::as_str)
                    && let Some(cleaned) = strip_git_status(text)
                {
                    last["text"] = JsonValue::String(cleaned);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn strip_git_status(text: &str) -> Option<String> {
    let idx = text.rfind("\ngitStatus:")?;
    Some(text[..idx].to_string())
}

/// Places up to four `cache_control: ephemeral` markers to maximize prompt
/// cache hits across turns: system block, last tool, penultimate user turn,
/// final user turn (priority order when the budget runs out). Also reorders
/// tools so `mcp__`-prefixed entries trail the stable default set.
///
/// Skipped entirely for background traffic and for requests carrying
/// built-in tools, where the payloads are either tiny or change shape
/// upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheBreakpoints;

impl RequestTransformer for CacheBreakpoints {
    fn transform(
        &self,
        payload: &mut JsonValue,
        _headers: &mut Headers,
        ctx: &mut TransformContext,
    ) -> Result<(), TransformError> {
        if ctx.routing_key == "background" || has_builtin_tools(payload) {
            return Ok(());
        }

        reorder_tools(payload);

        let mut used = 0usize;
        used += mark_system(payload);
        if used < MAX_CACHE_BREAKPOINTS {
            used += mark_last_tool(payload);
        }

        let user_turns = user_message_indices(payload);
        // Penultimate before final: when only one marker is left, the final
        // user turn wins because it is placed last and displaces nothing.
        if user_turns.len() >= 2 && used < MAX_CACHE_BREAKPOINTS {
            used += mark_message_content(payload, user_turns[user_turns.len() - 2]);
        }
        if let Some(&last) = user_turns.last()
            && used < MAX_CACHE_BREAKPOINTS
        {
            mark_message_content(payload, last);
        }
        Ok(())
    }
}

fn has_builtin_tools(payload: &JsonValue) -> bool {
    payload
        .get("tools")
        .and_then(JsonValue::as_array)
        .map(|tools| tools.iter().any(is_builtin_tool))
        .unwrap_or(false)
}

fn reorder_tools(payload: &mut JsonValue) {
    let Some(tools) = payload.get_mut("tools").and_then(JsonValue::as_array_mut) else {
        return;
    };
    // Stable partition: default tools keep their order, MCP tools follow.
    let mcp: Vec<JsonValue> = tools
        .iter()
        .filter(|t| is_mcp_tool(t))
        .cloned()
        .collect();
    tools.retain(|t| !is_mcp_tool(t));
    tools.extend(mcp);
}

fn is_mcp_tool(tool: &JsonValue) -> bool {
    tool.get("name")
        .and_then(JsonValue::as_str)
        .map(|name| name.starts_with("mcp__"))
        .unwrap_or(false)
}

fn mark_system(payload: &mut JsonValue) -> usize {
    let Some(system) = payload.get_mut("system") else {
        return 0;
    };
    match system {
        JsonValue::String(text) => {
            let block = json!({
                "type": "text",
                "text": std::mem::take(text),
                "cache_control": {"type": "ephemeral"},
            });
            *system = JsonValue::Array(vec![block]);
            1
        }
        JsonValue::Array(blocks) => match blocks.last_mut().and_then(JsonValue::as_object_mut) {
            Some(block) => {
                block.insert("cache_control".to_string(), json!({"type": "ephemeral"}));
                1
            }
            None => 0,
        },
        _ => 0,
    }
}

fn mark_last_tool(payload: &mut JsonValue) -> usize {
    let Some(tools) = payload.get_mut("tools").and_then(JsonValue::as_array_mut) else {
        return 0;
    };
    match tools.last_mut().and_then(JsonValue::as_object_mut) {
        Some(tool) => {
            tool.insert("cache_control".to_string(), json!({"type": "ephemeral"}));
            1
        }
        None => 0,
    }
}

fn user_message_indices(payload: &JsonValue) -> Vec<usize> {
    payload
        .get("messages")
        .and_then(JsonValue::as_array)
        .map(|messages| {
            messages
                .iter()
                .enumerate()
                .filter(|(_, m)| m.get("role").and_then(JsonValue::as_str) == Some("user"))
                .map(|(i, _)| i)
                .collect()
        })
        .unwrap_or_default()
}

/// Marks the last cacheable block of one message. String content is promoted
/// to a single text block since `cache_control` only attaches to blocks.
/// Thinking blocks never take markers.
fn mark_message_content(payload: &mut JsonValue, index: usize) -> usize {
    let Some(message) = payload
        .get_mut("messages")
        .and_then(JsonValue::as_array_mut)
        .and_then(|m| m.get_mut(index))
    else {
        return 0;
    };
    let Some(content) = message.get_mut("content") else {
        return 0;
    };

    match content {
        JsonValue::String(text) => {
            let block = json!({
                "type": "text",
                "text": std::mem::take(text),
                "cache_control": {"type": "ephemeral"},
            });
            *content = JsonValue::Array(vec![block]);
            1
        }
        JsonValue::Array(blocks) => {
            for block in blocks.iter_mut().rev() {
                let block_type = block.get("type").and_then(JsonValue::as_str);
                if matches!(block_type, Some("thinking") | Some("redacted_thinking")) {
                    continue;
                }
                if let Some(obj) = block.as_object_mut() {
                    obj.insert("cache_control".to_string(), json!({"type": "ephemeral"}));
                    return 1;
                }
            }
            0
        }
        _ => 0,
    }
}

/// The upstream already speaks the ingress dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ResponseTransformer for Passthrough {
    fn transform_response(
        &self,
        _body: &mut JsonValue,
        _ctx: &TransformContext,
    ) -> Result<(), TransformError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> JsonValue {
        json!({
            "model": "claude-sonnet-4-20250514",
            "system": [
                {"type": "text", "text": "You are a coding agent"},
                {"type": "text", "text": "Large project context"},
            ],
            "tools": [
                {"name": "Read", "input_schema": {"type": "object"}},
                {"name": "mcp__ide__diagnostics", "input_schema": {"type": "object"}},
                {"name": "Write", "input_schema": {"type": "object"}},
            ],
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": [{"type": "text", "text": "Hi"}]},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "1", "content": "ok"}]},
            ],
        })
    }

    fn run_cache(payload: &mut JsonValue, routing_key: &str) {
        let mut headers = Headers::new();
        let mut ctx = TransformContext {
            routing_key: routing_key.to_string(),
            ..TransformContext::default()
        };
        CacheBreakpoints
            .transform(payload, &mut headers, &mut ctx)
            .unwrap();
    }

    fn count_markers(value: &JsonValue) -> usize {
        match value {
            JsonValue::Object(obj) => {
                let own = usize::from(obj.contains_key("cache_control"));
                own + obj.values().map(count_markers).sum::<usize>()
            }
            JsonValue::Array(items) => items.iter().map(count_markers).sum(),
            _ => 0,
        }
    }

    #[test]
    fn system_marker_lands_on_last_block_only() {
        let mut payload = sample_request();
        run_cache(&mut payload, "default");
        assert!(payload["system"][0].get("cache_control").is_none());
        assert_eq!(payload["system"][1]["cache_control"], json!({"type": "ephemeral"}));
    }

    #[test]
    fn tools_reorder_mcp_last_and_mark_last() {
        let mut payload = sample_request();
        run_cache(&mut payload, "default");
        let tools = payload["tools"].as_array().unwrap();
        assert_eq!(tools[0]["name"], "Read");
        assert_eq!(tools[1]["name"], "Write");
        assert_eq!(tools[2]["name"], "mcp__ide__diagnostics");
        assert!(tools[2].get("cache_control").is_some());
    }

    #[test]
    fn at_most_four_markers_total() {
        let mut payload = sample_request();
        run_cache(&mut payload, "default");
        assert!(count_markers(&payload) <= MAX_CACHE_BREAKPOINTS);
    }

    #[test]
    fn string_user_content_is_promoted_to_blocks() {
        let mut payload = sample_request();
        run_cache(&mut payload, "default");
        let first_user = &payload["messages"][0]["content"];
        assert!(first_user.is_array());
        assert_eq!(first_user[0]["cache_control"], json!({"type": "ephemeral"}));
    }

    #[test]
    fn thinking_blocks_are_skipped() {
        let mut payload = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "a"},
                    {"type": "thinking", "thinking": "hmm"},
                ],
            }],
        });
        run_cache(&mut payload, "default");
        assert!(payload["messages"][0]["content"][1].get("cache_control").is_none());
        assert!(payload["messages"][0]["content"][0].get("cache_control").is_some());
    }

    #[test]
    fn background_and_builtin_requests_bypass_caching() {
        let mut payload = sample_request();
        let before = payload.clone();
        run_cache(&mut payload, "background");
        assert_eq!(payload, before);

        let mut payload = json!({
            "tools": [{"type": "web_search_20241022", "name": "web_search"}],
            "messages": [{"role": "user", "content": "search"}],
        });
        let before = payload.clone();
        run_cache(&mut payload, "default");
        assert_eq!(payload, before);
    }

    #[test]
    fn system_cleaner_truncates_at_last_git_status() {
        let mut payload = json!({
            "system": [{
                "type": "text",
                "text": "Instructions.\ngitStatus: old status\nMore text.\ngitStatus: current snapshot\nCurrent branch: main",
            }],
        });
        let mut headers = Headers::new();
        let mut ctx = TransformContext::default();
        SystemCleaner
            .transform(&mut payload, &mut headers, &mut ctx)
            .unwrap();
        assert_eq!(
            payload["system"][0]["text"],
            "Instructions.\ngitStatus: old status\nMore text."
        );
    }

    #[test]
    fn system_cleaner_leaves_clean_text_alone() {
        let mut payload = json!({"system": "No snapshot here"});
        let mut headers = Headers::new();
        let mut ctx = TransformContext::default();
        SystemCleaner
            .transform(&mut payload, &mut headers, &mut ctx)
            .unwrap();
        assert_eq!(payload["system"], "No snapshot here");
    }

    #[test]
    fn header_inject_sets_key_and_version() {
        let mut payload = json!({});
        let mut headers: Headers = vec![
            ("authorization".into(), "Bearer caller".into()),
            ("content-length".into(), "42".into()),
        ];
        let mut ctx = TransformContext {
            api_key: "sk-test".into(),
            ..TransformContext::default()
        };
        HeaderInject
            .transform(&mut payload, &mut headers, &mut ctx)
            .unwrap();
        assert_eq!(crate::header_get(&headers, "x-api-key"), Some("sk-test"));
        assert_eq!(crate::header_get(&headers, "anthropic-version"), Some("2023-06-01"));
        assert_eq!(crate::header_get(&headers, "authorization"), None);
        assert_eq!(crate::header_get(&headers, "content-length"), None);
    }
}
