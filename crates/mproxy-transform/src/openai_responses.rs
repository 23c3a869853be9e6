use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};

use crate::{
    Headers, JsonObject, RequestTransformer, ResponseTransformer, TransformContext,
    TransformError, is_builtin_tool, reasoning_effort_for_budget,
};

/// Anthropic Messages → OpenAI Responses request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponsesRequest;

impl RequestTransformer for ResponsesRequest {
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

        let mut out = JsonObject::new();
        if let Some(model) = request.get("model") {
            out.insert("model".to_string(), model.clone());
        }
        out.insert("stream".to_string(), json!(false));
        out.insert("store".to_string(), json!(false));

        if let Some(system) = request.get("system")
            && let Some(instructions) = instructions_text(system)
            && !instructions.is_empty()
        {
            out.insert("instructions".to_string(), json!(instructions));
        }

        let mut input_items = Vec::new();
        if let Some(messages) = request.get("messages").and_then(JsonValue::as_array) {
            for message in messages {
                input_items.extend(convert_message(message));
            }
        }
        out.insert(
            "input".to_string(),
            if input_items.is_empty() {
                json!("")
            } else {
                JsonValue::Array(input_items)
            },
        );

        let budget = request
            .get("thinking")
            .and_then(|t| t.get("budget_tokens"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        if let Some(effort) = reasoning_effort_for_budget(budget) {
            out.insert("reasoning".to_string(), json!({"effort": effort}));
        }

        for key in ["temperature", "top_p"] {
            if let Some(value) = request.get(key)
                && !value.is_null()
            {
                out.insert(key.to_string(), value.clone());
            }
        }
        if let Some(max_tokens) = request.get("max_tokens").and_then(JsonValue::as_u64) {
            out.insert("max_output_tokens".to_string(), json!(max_tokens));
        }

        let tools: Vec<JsonValue> = request
            .get("tools")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let converted = convert_tools(&tools)?;
        if !converted.is_empty() {
            out.insert("tools".to_string(), JsonValue::Array(converted));
        }

        *payload = JsonValue::Object(out);
        Ok(())
    }
}

fn instructions_text(system: &JsonValue) -> Option<String> {
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

fn convert_message(message: &JsonValue) -> Vec<JsonValue> {
    let role = message
        .get("role")
        .and_then(JsonValue::as_str)
        .unwrap_or("user");
    let blocks: Vec<JsonValue> = match message.get("content") {
        Some(JsonValue::String(text)) => vec![json!({"type": "text", "text": text})],
        Some(JsonValue::Array(blocks)) => blocks.clone(),
        _ => return Vec::new(),
    };

    let mut items = Vec::new();
    let mut parts: Vec<JsonValue> = Vec::new();

    let flush = |items: &mut Vec<JsonValue>, parts: &mut Vec<JsonValue>, role: &str| {
        if !parts.is_empty() {
            items.push(json!({
                "type": "message",
                "role": role,
                "content": std::mem::take(parts),
            }));
        }
    };

    for block in &blocks {
        match block.get("type").and_then(JsonValue::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(JsonValue::as_str).unwrap_or("");
                let part_type = if role == "assistant" {
                    "output_text"
                } else {
                    "input_text"
                };
                parts.push(json!({"type": part_type, "text": text}));
            }
            Some("image") => {
                if let Some(part) = convert_image(block) {
                    parts.push(part);
                }
            }
            Some("tool_use") => {
                flush(&mut items, &mut parts, role);
                if let Some(call) = convert_tool_use(block) {
                    items.push(call);
                }
            }
            Some("tool_result") => {
                flush(&mut items, &mut parts, role);
                items.push(convert_tool_result(block));
            }
            // Thinking turns never round-trip to a foreign provider.
            Some("thinking") | Some("redacted_thinking") => {}
            _ => {}
        }
    }
    flush(&mut items, &mut parts, role);
    items
}

fn convert_image(block: &JsonValue) -> Option<JsonValue> {
    let source = block.get("source")?;
    match source.get("type").and_then(JsonValue::as_str) {
        Some("base64") => {
            let data = source.get("data").and_then(JsonValue::as_str)?;
            let media_type = source
                .get("media_type")
                .and_then(JsonValue::as_str)
                .unwrap_or("image/png");
            Some(json!({
                "type": "input_image",
                "image_url": format!("data:{media_type};base64,{data}"),
            }))
        }
        Some("url") => source
            .get("url")
            .and_then(JsonValue::as_str)
            .map(|url| json!({"type": "input_image", "image_url": url})),
        _ => None,
    }
}

fn convert_tool_use(block: &JsonValue) -> Option<JsonValue> {
    let name = block.get("name").and_then(JsonValue::as_str)?;
    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
    let arguments = serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
    let mut call = json!({
        "type": "function_call",
        "name": name,
        "arguments": arguments,
    });
    if let Some(id) = block.get("id").and_then(JsonValue::as_str) {
        call["call_id"] = json!(id);
    }
    Some(call)
}

fn convert_tool_result(block: &JsonValue) -> JsonValue {
    let output = match block.get("content") {
        Some(JsonValue::Array(parts)) => parts
            .iter()
            .filter(|p| p.get("type").and_then(JsonValue::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(JsonValue::String(text)) => text.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    };
    let mut result = json!({"type": "function_call_output", "output": output});
    if let Some(id) = block.get("tool_use_id").and_then(JsonValue::as_str) {
        result["call_id"] = json!(id);
    }
    if block.get("is_error").and_then(JsonValue::as_bool) == Some(true) {
        result["is_error"] = json!(true);
    }
    result
}

fn convert_tools(tools: &[JsonValue]) -> Result<Vec<JsonValue>, TransformError> {
    let mut out = Vec::new();
    for tool in tools {
        if is_builtin_tool(tool) {
            let name = tool.get("name").and_then(JsonValue::as_str).unwrap_or("");
            if name == "web_search" {
                out.push(json!({
                    "type": "web_search",
                    "web_search": crate::openai::web_search_options(tool)?,
                }));
            }
            continue;
        }
        let Some(name) = tool.get("name").and_then(JsonValue::as_str) else {
            continue;
        };
        out.push(json!({
            "type": "function",
            "name": name,
            "description": tool.get("description").and_then(JsonValue::as_str).unwrap_or(""),
            "parameters": tool.get("input_schema").cloned().unwrap_or_else(|| json!({})),
        }));
    }
    Ok(out)
}

/// OpenAI Responses → Anthropic Messages response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponsesResponse;

impl ResponseTransformer for ResponsesResponse {
    fn transform_response(
        &self,
        body: &mut JsonValue,
        _ctx: &TransformContext,
    ) -> Result<(), TransformError> {
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("OpenAI Responses API error");
            let error_type = error
                .get("type")
                .and_then(JsonValue::as_str)
                .unwrap_or("api_error");
            *body = json!({"type": "error", "error": {"type": error_type, "message": message}});
            return Ok(());
        }

        let mut content = Vec::new();
        if let Some(output) = body.get("output").and_then(JsonValue::as_array) {
            for item in output {
                match item.get("type").and_then(JsonValue::as_str) {
                    Some("message") => content.extend(convert_message_item(item)),
                    Some("function_call") => {
                        if let Some(block) = convert_function_call(item) {
                            content.push(block);
                        }
                    }
                    Some("reasoning") => {
                        if let Some(block) = convert_reasoning_item(item) {
                            content.push(block);
                        }
                    }
                    _ => {}
                }
            }
        }
        if content.is_empty() {
            content.push(json!({"type": "text", "text": ""}));
        }

        let stop_reason = match body.get("status").and_then(JsonValue::as_str) {
            Some("incomplete") | Some("in_progress") => "max_tokens",
            Some("requires_action") => "tool_use",
            _ => "end_turn",
        };

        *body = json!({
            "id": body.get("id").and_then(JsonValue::as_str).unwrap_or(""),
            "type": "message",
            "role": "assistant",
            "content": content,
            "model": body.get("model").and_then(JsonValue::as_str).unwrap_or(""),
            "stop_reason": stop_reason,
            "stop_sequence": JsonValue::Null,
            "usage": convert_usage(body.get("usage")),
        });
        Ok(())
    }
}

fn convert_message_item(item: &JsonValue) -> Vec<JsonValue> {
    let Some(parts) = item.get("content").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    let mut blocks = Vec::new();
    for part in parts {
        match part.get("type").and_then(JsonValue::as_str) {
            Some("output_text") => blocks.push(json!({
                "type": "text",
                "text": part.get("text").and_then(JsonValue::as_str).unwrap_or(""),
            })),
            Some("output_image") => {
                if let Some(url) = part.get("image_url").and_then(JsonValue::as_str) {
                    blocks.push(json!({
                        "type": "image",
                        "source": {"type": "url", "url": url},
                    }));
                }
            }
            Some("web_search_result") => {
                if let Some(block) = web_search_block(part) {
                    blocks.push(block);
                }
            }
            _ => {}
        }
    }
    blocks
}

fn convert_function_call(item: &JsonValue) -> Option<JsonValue> {
    let name = item.get("name").and_then(JsonValue::as_str)?;
    let call_id = item
        .get("call_id")
        .or_else(|| item.get("id"))
        .and_then(JsonValue::as_str)
        .unwrap_or("");
    let input = match item.get("arguments") {
        Some(JsonValue::String(raw)) => {
            serde_json::from_str::<JsonValue>(raw).unwrap_or_else(|_| json!(raw))
        }
        Some(value) if !value.is_null() => value.clone(),
        _ => json!({}),
    };
    Some(json!({"type": "tool_use", "id": call_id, "name": name, "input": input}))
}

fn convert_reasoning_item(item: &JsonValue) -> Option<JsonValue> {
    let mut segments = Vec::new();
    if let Some(summary) = item.get("summary").and_then(JsonValue::as_array) {
        for entry in summary {
            if let Some(text) = entry.get("text").and_then(JsonValue::as_str) {
                segments.push(text);
            }
        }
    }
    for key in ["text", "content"] {
        if let Some(text) = item.get(key).and_then(JsonValue::as_str) {
            segments.push(text);
        }
    }
    let thinking = segments.concat();
    if thinking.trim().is_empty() {
        return None;
    }
    let mut block = json!({"type": "thinking", "thinking": thinking});
    if let Some(signature) = item.get("signature").and_then(JsonValue::as_str) {
        block["signature"] = json!(signature);
    }
    Some(block)
}

fn web_search_block(part: &JsonValue) -> Option<JsonValue> {
    let entry = part.get("web_search_result").unwrap_or(part);
    let url = entry.get("url").and_then(JsonValue::as_str).unwrap_or("");
    let snippet = entry
        .get("snippet")
        .or_else(|| entry.get("text"))
        .and_then(JsonValue::as_str)
        .unwrap_or("");
    if url.is_empty() && snippet.is_empty() {
        return None;
    }
    let title = entry
        .get("title")
        .and_then(JsonValue::as_str)
        .unwrap_or("Untitled");
    let digest = Sha256::digest(if url.is_empty() { snippet } else { url }.as_bytes());
    let id: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    Some(json!({
        "type": "web_search_tool_result",
        "id": format!("search_{id}"),
        "content": {
            "type": "web_search_result",
            "url": url,
            "title": title,
            "snippet": snippet,
        },
    }))
}

fn convert_usage(usage: Option<&JsonValue>) -> JsonValue {
    let Some(usage) = usage.and_then(JsonValue::as_object) else {
        return json!({"input_tokens": 0, "output_tokens": 0, "cache_read_input_tokens": 0});
    };
    let cached = usage
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    json!({
        "input_tokens": usage.get("input_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
        "output_tokens": usage.get("output_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
        "cache_read_input_tokens": cached,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_request(mut payload: JsonValue) -> JsonValue {
        let mut headers = Headers::new();
        let mut ctx = TransformContext::default();
        ResponsesRequest
            .transform(&mut payload, &mut headers, &mut ctx)
            .unwrap();
        payload
    }

    fn run_response(mut body: JsonValue) -> JsonValue {
        let ctx = TransformContext::default();
        ResponsesResponse.transform_response(&mut body, &ctx).unwrap();
        body
    }

    #[test]
    fn request_builds_instructions_and_input_items() {
        let out = run_request(json!({
            "model": "o4-mini",
            "max_tokens": 256,
            "system": "terse answers",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "c1", "name": "Read", "input": {"p": 1}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "c1", "content": [{"type": "text", "text": "ok"}]},
                ]},
            ],
        }));
        assert_eq!(out["instructions"], "terse answers");
        assert_eq!(out["stream"], false);
        assert_eq!(out["store"], false);
        assert_eq!(out["max_output_tokens"], 256);

        let input = out["input"].as_array().unwrap();
        assert_eq!(input[0]["type"], "message");
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["content"][0]["type"], "output_text");
        assert_eq!(input[2]["type"], "function_call");
        assert_eq!(input[2]["call_id"], "c1");
        assert_eq!(input[3], json!({
            "type": "function_call_output",
            "output": "ok",
            "call_id": "c1",
        }));
    }

    #[test]
    fn empty_messages_produce_empty_string_input() {
        let out = run_request(json!({"model": "o4-mini", "max_tokens": 1, "messages": []}));
        assert_eq!(out["input"], "");
    }

    #[test]
    fn function_tools_are_flat() {
        let out = run_request(json!({
            "model": "o4-mini",
            "max_tokens": 1,
            "tools": [{"name": "Grep", "description": "search", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "x"}],
        }));
        assert_eq!(out["tools"][0], json!({
            "type": "function",
            "name": "Grep",
            "description": "search",
            "parameters": {"type": "object"},
        }));
    }

    #[test]
    fn response_maps_output_items() {
        let out = run_response(json!({
            "id": "resp_1",
            "model": "o4-mini",
            "status": "completed",
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "thinking hard"}]},
                {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "answer"}]},
                {"type": "function_call", "call_id": "c9", "name": "Read", "arguments": "{\"p\":2}"},
            ],
            "usage": {"input_tokens": 5, "output_tokens": 9, "input_tokens_details": {"cached_tokens": 2}},
        }));
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["content"][0]["type"], "thinking");
        assert_eq!(out["content"][0]["thinking"], "thinking hard");
        assert_eq!(out["content"][1], json!({"type": "text", "text": "answer"}));
        assert_eq!(out["content"][2]["input"], json!({"p": 2}));
        assert_eq!(out["usage"]["cache_read_input_tokens"], 2);
    }

    #[test]
    fn error_payload_maps_to_error_body() {
        let out = run_response(json!({
            "error": {"type": "server_error", "message": "boom"},
        }));
        assert_eq!(out["type"], "error");
        assert_eq!(out["error"]["message"], "boom");
    }

    #[test]
    fn empty_output_yields_single_empty_text_block() {
        let out = run_response(json!({"id": "r", "status": "completed", "output": []}));
        assert_eq!(out["content"], json!([{"type": "text", "text": ""}]));
    }
}
