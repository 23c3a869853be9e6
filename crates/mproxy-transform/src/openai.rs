use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};

use crate::{
    Headers, JsonObject, RequestTransformer, ResponseTransformer, TransformContext,
    TransformError, header_remove, header_set, is_builtin_tool, reasoning_effort_for_budget,
};

/// `Authorization: Bearer <key>` for OpenAI-compatible upstreams.
#[derive(Debug, Clone, Copy, Default)]
pub struct BearerAuth;

impl RequestTransformer for BearerAuth {
    fn transform(
        &self,
        _payload: &mut JsonValue,
        headers: &mut Headers,
        ctx: &mut TransformContext,
    ) -> Result<(), TransformError> {
        header_remove(headers, "x-api-key");
        header_remove(headers, "anthropic-version");
        header_remove(headers, "anthropic-beta");
        header_remove(headers, "host");
        header_remove(headers, "content-length");
        header_set(headers, "authorization", format!("Bearer {}", ctx.api_key));
        Ok(())
    }
}

/// Anthropic Messages → OpenAI Chat Completions request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatRequest;

impl RequestTransformer for ChatRequest {
    fn transform(
        &self,
        payload: &mut JsonValue,
        _headers: &mut Headers,
        _ctx: &mut TransformContext,
    ) -> Result<(), TransformError> {
        let request = payload
            .as_object()
            .ok_or_else(|| TransformError::InvalidPayload("request body is not an object".into()))?
            .clone();

        let tools = request
            .get("tools")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let builtin: Vec<JsonValue> = tools.iter().filter(|t| is_builtin_tool(t)).cloned().collect();
        let callable: Vec<JsonValue> = tools
            .iter()
            .filter(|t| !is_builtin_tool(t))
            .cloned()
            .collect();

        // Built-in tools only take over when no callable tools compete; the
        // two request shapes are mutually exclusive on the OpenAI side.
        let builtin_tool = if callable.is_empty() {
            builtin.into_iter().next()
        } else {
            None
        };

        let mut out = JsonObject::new();
        copy_if_present(&request, &mut out, "model");
        copy_if_present(&request, &mut out, "temperature");
        copy_if_present(&request, &mut out, "stream");
        out.insert(
            "messages".to_string(),
            JsonValue::Array(convert_messages(&request)),
        );
        if let Some(max_tokens) = request.get("max_tokens") {
            out.insert("max_completion_tokens".to_string(), max_tokens.clone());
        }
        let budget = request
            .get("thinking")
            .and_then(|t| t.get("budget_tokens"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        if let Some(effort) = reasoning_effort_for_budget(budget) {
            out.insert("reasoning_effort".to_string(), json!(effort));
        }

        match builtin_tool {
            Some(tool) => apply_builtin_tool(&mut out, &tool)?,
            None if !callable.is_empty() => {
                out.insert(
                    "tools".to_string(),
                    JsonValue::Array(callable.iter().map(convert_tool).collect()),
                );
            }
            None => {}
        }

        *payload = JsonValue::Object(out);
        Ok(())
    }
}

fn copy_if_present(from: &JsonObject, to: &mut JsonObject, key: &str) {
    if let Some(value) = from.get(key)
        && !value.is_null()
    {
        to.insert(key.to_string(), value.clone());
    }
}

fn convert_tool(tool: &JsonValue) -> JsonValue {
    json!({
        "type": "function",
        "function": {
            "name": tool.get("name").and_then(JsonValue::as_str).unwrap_or(""),
            "description": tool.get("description").and_then(JsonValue::as_str).unwrap_or(""),
            "parameters": tool.get("input_schema").cloned().unwrap_or_else(|| json!({})),
        },
    })
}

fn convert_messages(request: &JsonObject) -> Vec<JsonValue> {
    let mut messages = Vec::new();

    if let Some(system) = request.get("system")
        && let Some(text) = system_text(system)
        && !text.is_empty()
    {
        messages.push(json!({"role": "system", "content": text}));
    }

    if let Some(items) = request.get("messages").and_then(JsonValue::as_array) {
        for message in items {
            messages.extend(convert_message(message));
        }
    }

    messages
}

fn system_text(system: &JsonValue) -> Option<String> {
    match system {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(JsonValue::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(JsonValue::as_str))
                .collect();
            Some(parts.join("\n"))
        }
        _ => None,
    }
}

/// One Anthropic message can fan out into several OpenAI messages:
/// tool_result blocks become role:tool messages, while text and tool_use on
/// an assistant turn combine into a single message with `tool_calls`.
fn convert_message(message: &JsonValue) -> Vec<JsonValue> {
    let role = message
        .get("role")
        .and_then(JsonValue::as_str)
        .unwrap_or("user")
        .to_string();
    let blocks: Vec<JsonValue> = match message.get("content") {
        Some(JsonValue::String(text)) => vec![json!({"type": "text", "text": text})],
        Some(JsonValue::Array(blocks)) => blocks.clone(),
        _ => return Vec::new(),
    };

    let mut out = Vec::new();
    let mut content: Vec<JsonValue> = Vec::new();
    let mut tool_calls: Vec<JsonValue> = Vec::new();

    let flush = |out: &mut Vec<JsonValue>,
                 content: &mut Vec<JsonValue>,
                 tool_calls: &mut Vec<JsonValue>,
                 role: &str| {
        if !content.is_empty() && !tool_calls.is_empty() {
            out.push(json!({
                "role": "assistant",
                "content": collapse_content(std::mem::take(content)),
                "tool_calls": std::mem::take(tool_calls),
            }));
        } else if !content.is_empty() {
            out.push(json!({
                "role": role,
                "content": collapse_content(std::mem::take(content)),
            }));
        } else if !tool_calls.is_empty() {
            out.push(json!({
                "role": "assistant",
                "content": JsonValue::Null,
                "tool_calls": std::mem::take(tool_calls),
            }));
        }
    };

    for block in &blocks {
        match block.get("type").and_then(JsonValue::as_str) {
            Some("tool_result") => {
                flush(&mut out, &mut content, &mut tool_calls, &role);
                out.push(convert_tool_result(block));
            }
            Some("tool_use") if role == "assistant" => {
                tool_calls.push(convert_tool_call(block));
            }
            Some("text") => content.push(block.clone()),
            Some("image") => {
                if let Some(image) = convert_image(block) {
                    content.push(image);
                }
            }
            _ => {}
        }
    }
    flush(&mut out, &mut content, &mut tool_calls, &role);
    out
}

fn collapse_content(blocks: Vec<JsonValue>) -> JsonValue {
    let converted: Vec<JsonValue> = blocks
        .into_iter()
        .filter_map(|block| match block.get("type").and_then(JsonValue::as_str) {
            Some("text") => Some(json!({
                "type": "text",
                "text": block.get("text").and_then(JsonValue::as_str).unwrap_or(""),
            })),
            Some("image_url") => Some(block),
            _ => None,
        })
        .collect();

    if converted.len() == 1
        && converted[0].get("type").and_then(JsonValue::as_str) == Some("text")
    {
        return converted[0]["text"].clone();
    }
    JsonValue::Array(converted)
}

fn convert_image(block: &JsonValue) -> Option<JsonValue> {
    let source = block.get("source")?;
    if source.get("type").and_then(JsonValue::as_str) != Some("base64") {
        return None;
    }
    let data = source.get("data").and_then(JsonValue::as_str).unwrap_or("");
    let media_type = source
        .get("media_type")
        .and_then(JsonValue::as_str)
        .unwrap_or("image/jpeg");
    Some(json!({
        "type": "image_url",
        "image_url": {"url": format!("data:{media_type};base64,{data}")},
    }))
}

fn convert_tool_result(block: &JsonValue) -> JsonValue {
    let content = match block.get("content") {
        Some(JsonValue::String(text)) => JsonValue::String(text.clone()),
        Some(JsonValue::Array(parts)) => {
            if parts.len() == 1
                && parts[0].get("type").and_then(JsonValue::as_str) == Some("text")
            {
                parts[0]["text"].clone()
            } else {
                JsonValue::Array(parts.clone())
            }
        }
        _ => {
            let is_error = block
                .get("is_error")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            JsonValue::String(if is_error { "Error" } else { "Success" }.to_string())
        }
    };
    json!({
        "role": "tool",
        "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(JsonValue::Null),
        "content": content,
    })
}

fn convert_tool_call(block: &JsonValue) -> JsonValue {
    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
    json!({
        "id": block.get("id").cloned().unwrap_or(JsonValue::Null),
        "type": "function",
        "function": {
            "name": block.get("name").and_then(JsonValue::as_str).unwrap_or(""),
            "arguments": serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
        },
    })
}

fn apply_builtin_tool(out: &mut JsonObject, tool: &JsonValue) -> Result<(), TransformError> {
    let is_web_search = tool
        .get("type")
        .and_then(JsonValue::as_str)
        .map(|t| t.starts_with("web_search"))
        .unwrap_or(false);
    if !is_web_search {
        return Ok(());
    }

    out.insert(
        "web_search_options".to_string(),
        web_search_options(tool)?,
    );

    let model = out
        .get("model")
        .and_then(JsonValue::as_str)
        .unwrap_or("")
        .to_string();
    out.insert("model".to_string(), json!(search_capable_model(&model)));
    Ok(())
}

/// Upgrade to a search-capable variant when the resolved model has none.
fn search_capable_model(model: &str) -> String {
    match model {
        "gpt-4o" => "gpt-4o-search-preview".to_string(),
        "gpt-4o-mini" => "gpt-4o-mini-search-preview".to_string(),
        m if m.contains("search") => m.to_string(),
        _ => "gpt-4o-search-preview".to_string(),
    }
}

pub(crate) fn web_search_options(tool: &JsonValue) -> Result<JsonValue, TransformError> {
    let allowed = tool.get("allowed_domains").filter(|v| !v.is_null());
    let blocked = tool.get("blocked_domains").filter(|v| !v.is_null());
    if allowed.is_some() && blocked.is_some() {
        return Err(TransformError::InvalidPayload(
            "web_search cannot set both allowed_domains and blocked_domains".into(),
        ));
    }

    let mut filters = JsonObject::new();
    if let Some(allowed) = allowed {
        filters.insert("allowed_domains".to_string(), allowed.clone());
    }
    if let Some(blocked) = blocked {
        filters.insert("blocked_domains".to_string(), blocked.clone());
    }

    let mut config = JsonObject::new();
    config.insert("filters".to_string(), JsonValue::Object(filters));
    if let Some(location) = tool.get("user_location").and_then(JsonValue::as_object) {
        let mut approximate = JsonObject::new();
        for field in ["country", "city", "region", "timezone"] {
            if let Some(value) = location.get(field) {
                approximate.insert(field.to_string(), value.clone());
            }
        }
        config.insert(
            "user_location".to_string(),
            json!({"type": "approximate", "approximate": approximate}),
        );
    }
    config.insert(
        "search_context_size".to_string(),
        tool.get("search_context_size")
            .cloned()
            .unwrap_or_else(|| json!("medium")),
    );
    Ok(JsonValue::Object(config))
}

/// OpenAI Chat Completions → Anthropic Messages response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatResponse;

impl ResponseTransformer for ChatResponse {
    fn transform_response(
        &self,
        body: &mut JsonValue,
        _ctx: &TransformContext,
    ) -> Result<(), TransformError> {
        let Some(choice) = body
            .get("choices")
            .and_then(JsonValue::as_array)
            .and_then(|c| c.first())
            .cloned()
        else {
            return Err(TransformError::InvalidPayload(
                "chat completion has no choices".into(),
            ));
        };
        let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));

        let mut content = Vec::new();
        let text = message
            .get("content")
            .and_then(JsonValue::as_str)
            .unwrap_or("");
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }

        if let Some(tool_calls) = message.get("tool_calls").and_then(JsonValue::as_array) {
            for call in tool_calls {
                let function = call.get("function").cloned().unwrap_or_else(|| json!({}));
                let arguments = function
                    .get("arguments")
                    .and_then(JsonValue::as_str)
                    .and_then(|raw| serde_json::from_str::<JsonValue>(raw).ok())
                    .unwrap_or_else(|| json!({}));
                content.push(json!({
                    "type": "tool_use",
                    "id": call.get("id").and_then(JsonValue::as_str).unwrap_or(""),
                    "name": function.get("name").and_then(JsonValue::as_str).unwrap_or(""),
                    "input": arguments,
                }));
            }
        }

        if let Some(annotations) = message.get("annotations").and_then(JsonValue::as_array) {
            content.extend(citation_blocks(annotations, text));
        }

        let usage = convert_usage(body.get("usage"));
        let stop_reason = convert_stop_reason(
            choice.get("finish_reason").and_then(JsonValue::as_str),
        );

        *body = json!({
            "id": body.get("id").and_then(JsonValue::as_str).unwrap_or(""),
            "type": "message",
            "role": "assistant",
            "content": content,
            "model": body.get("model").and_then(JsonValue::as_str).unwrap_or(""),
            "stop_reason": stop_reason,
            "stop_sequence": JsonValue::Null,
            "usage": usage,
        });
        Ok(())
    }
}

fn convert_stop_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("content_filter") => "stop_sequence",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

fn convert_usage(usage: Option<&JsonValue>) -> JsonValue {
    let Some(usage) = usage.and_then(JsonValue::as_object) else {
        return json!({
            "input_tokens": 0,
            "output_tokens": 0,
            "cache_creation_input_tokens": 0,
            "cache_read_input_tokens": 0,
        });
    };
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    json!({
        "input_tokens": usage.get("prompt_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
        "output_tokens": usage.get("completion_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
        "cache_creation_input_tokens": 0,
        "cache_read_input_tokens": cached,
    })
}

/// OpenAI `url_citation` annotations → Anthropic web_search_tool_result
/// blocks, with deterministic ids and the cited span as the snippet.
fn citation_blocks(annotations: &[JsonValue], text: &str) -> Vec<JsonValue> {
    let mut blocks = Vec::new();
    for annotation in annotations {
        if annotation.get("type").and_then(JsonValue::as_str) != Some("url_citation") {
            continue;
        }
        let Some(citation) = annotation.get("url_citation") else {
            continue;
        };
        let Some(url) = citation.get("url").and_then(JsonValue::as_str) else {
            continue;
        };
        let title = citation
            .get("title")
            .and_then(JsonValue::as_str)
            .unwrap_or("Untitled");
        let snippet = extract_snippet(
            text,
            citation.get("start_index").and_then(JsonValue::as_u64),
            citation.get("end_index").and_then(JsonValue::as_u64),
        );
        blocks.push(json!({
            "type": "web_search_tool_result",
            "id": format!("search_{}", url_digest(url)),
            "content": {
                "type": "web_search_result",
                "url": url,
                "title": title,
                "snippet": snippet,
            },
        }));
    }
    blocks
}

fn url_digest(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut out = String::with_capacity(8);
    for byte in &digest[..4] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn extract_snippet(text: &str, start: Option<u64>, end: Option<u64>) -> String {
    let (Some(start), Some(end)) = (start, end) else {
        return String::new();
    };
    let (start, end) = (start as usize, end as usize);
    if start >= end || end > text.len() {
        return String::new();
    }
    text.get(start..end).unwrap_or("").to_string()
}
