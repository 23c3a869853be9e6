use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};

use crate::{
    Headers, JsonObject, RequestTransformer, ResponseTransformer, TransformContext,
    TransformError, header_remove,
};

/// Gemini authenticates with a `key` query parameter; credential headers are
/// stripped so they never cross the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryKeyAuth;

impl RequestTransformer for QueryKeyAuth {
    fn transform(
        &self,
        _payload: &mut JsonValue,
        headers: &mut Headers,
        ctx: &mut TransformContext,
    ) -> Result<(), TransformError> {
        header_remove(headers, "authorization");
        header_remove(headers, "x-api-key");
        header_remove(headers, "anthropic-version");
        header_remove(headers, "anthropic-beta");
        header_remove(headers, "host");
        header_remove(headers, "content-length");
        ctx.query.push(("key".to_string(), ctx.api_key.clone()));
        Ok(())
    }
}

/// Anthropic Messages → Gemini GenerateContent request.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateContentRequest;

impl RequestTransformer for GenerateContentRequest {
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

        if let Some(system) = request.get("system")
            && let Some(instruction) = convert_system(system)
        {
            out.insert("system_instruction".to_string(), instruction);
        }

        if let Some(messages) = request.get("messages").and_then(JsonValue::as_array) {
            let contents: Vec<JsonValue> = messages.iter().filter_map(convert_message).collect();
            out.insert("contents".to_string(), JsonValue::Array(contents));
        }

        if let Some(tools) = request.get("tools").and_then(JsonValue::as_array)
            && !tools.is_empty()
        {
            let declarations: Vec<JsonValue> = tools.iter().filter_map(convert_tool).collect();
            if !declarations.is_empty() {
                out.insert(
                    "tools".to_string(),
                    json!([{"functionDeclarations": declarations}]),
                );
                out.insert(
                    "toolConfig".to_string(),
                    json!({"functionCallingConfig": {"mode": "AUTO"}}),
                );
            }
        }

        out.insert(
            "generationConfig".to_string(),
            generation_config(&request),
        );

        *payload = JsonValue::Object(out);
        Ok(())
    }
}

fn convert_system(system: &JsonValue) -> Option<JsonValue> {
    let text = match system {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(JsonValue::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    Some(json!({"parts": [{"text": text}]}))
}

fn convert_message(message: &JsonValue) -> Option<JsonValue> {
    let role = message.get("role").and_then(JsonValue::as_str)?;
    let gemini_role = if role == "assistant" { "model" } else { role };

    let parts = match message.get("content") {
        Some(JsonValue::String(text)) => vec![json!({"text": text})],
        Some(JsonValue::Array(blocks)) => blocks.iter().filter_map(convert_block).collect(),
        _ => Vec::new(),
    };
    if parts.is_empty() {
        return None;
    }
    Some(json!({"role": gemini_role, "parts": parts}))
}

fn convert_block(block: &JsonValue) -> Option<JsonValue> {
    match block.get("type").and_then(JsonValue::as_str)? {
        "text" => Some(json!({"text": block.get("text").and_then(JsonValue::as_str).unwrap_or("")})),
        "image" => {
            let source = block.get("source")?;
            if source.get("type").and_then(JsonValue::as_str) != Some("base64") {
                return None;
            }
            Some(json!({
                "inline_data": {
                    "mime_type": source.get("media_type").and_then(JsonValue::as_str).unwrap_or("image/jpeg"),
                    "data": source.get("data").and_then(JsonValue::as_str).unwrap_or(""),
                },
            }))
        }
        "tool_use" => {
            let name = block.get("name").and_then(JsonValue::as_str)?;
            Some(json!({
                "functionCall": {
                    "name": name,
                    "args": block.get("input").cloned().unwrap_or_else(|| json!({})),
                },
            }))
        }
        "tool_result" => {
            let id = block.get("tool_use_id").and_then(JsonValue::as_str)?;
            let content = tool_result_text(block.get("content"));
            let is_error = block.get("is_error").and_then(JsonValue::as_bool).unwrap_or(false);
            Some(json!({
                "functionResponse": {
                    "name": id,
                    "response": {"content": content, "success": !is_error},
                },
            }))
        }
        _ => None,
    }
}

fn tool_result_text(content: Option<&JsonValue>) -> String {
    match content {
        Some(JsonValue::String(text)) => text.clone(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::String(text) => Some(text.clone()),
                other => other
                    .get("text")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    }
}

fn convert_tool(tool: &JsonValue) -> Option<JsonValue> {
    let name = tool.get("name").and_then(JsonValue::as_str)?;
    if tool.get("input_schema").is_none() {
        // Built-in tools have no Gemini equivalent on this path.
        return None;
    }
    Some(json!({
        "name": name,
        "description": tool.get("description").and_then(JsonValue::as_str).unwrap_or(""),
        "parameters": tool.get("input_schema").cloned().unwrap_or_else(|| json!({})),
    }))
}

fn generation_config(request: &JsonObject) -> JsonValue {
    let mut config = JsonObject::new();
    if let Some(temperature) = request.get("temperature").filter(|v| !v.is_null()) {
        config.insert("temperature".to_string(), temperature.clone());
    }
    if let Some(max_tokens) = request.get("max_tokens").filter(|v| !v.is_null()) {
        config.insert("maxOutputTokens".to_string(), max_tokens.clone());
    }
    if let Some(stop) = request.get("stop_sequences").filter(|v| !v.is_null()) {
        config.insert("stopSequences".to_string(), stop.clone());
    }
    if let Some(top_p) = request.get("top_p").filter(|v| !v.is_null()) {
        config.insert("topP".to_string(), top_p.clone());
    }
    if let Some(top_k) = request.get("top_k").filter(|v| !v.is_null()) {
        config.insert("topK".to_string(), top_k.clone());
    }
    config.insert("candidateCount".to_string(), json!(1));
    JsonValue::Object(config)
}

/// Gemini GenerateContent → Anthropic Messages response.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateContentResponse;

impl ResponseTransformer for GenerateContentResponse {
    fn transform_response(
        &self,
        body: &mut JsonValue,
        _ctx: &TransformContext,
    ) -> Result<(), TransformError> {
        let Some(candidate) = body
            .get("candidates")
            .and_then(JsonValue::as_array)
            .and_then(|c| c.first())
            .cloned()
        else {
            return Err(TransformError::InvalidPayload(
                "gemini response has no candidates".into(),
            ));
        };

        let mut content = Vec::new();
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(JsonValue::as_array)
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(JsonValue::as_str) {
                    content.push(json!({"type": "text", "text": text}));
                } else if let Some(call) = part.get("functionCall") {
                    content.push(json!({
                        "type": "tool_use",
                        "id": function_call_id(call),
                        "name": call.get("name").and_then(JsonValue::as_str).unwrap_or(""),
                        "input": call.get("args").cloned().unwrap_or_else(|| json!({})),
                    }));
                }
            }
        }

        let stop_reason = match candidate.get("finishReason").and_then(JsonValue::as_str) {
            Some("MAX_TOKENS") => "max_tokens",
            Some("SAFETY") | Some("RECITATION") => "stop_sequence",
            _ => "end_turn",
        };

        let usage = convert_usage(body.get("usageMetadata"));
        let id = body
            .get("responseId")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("msg_{}", function_call_id(&candidate)));

        *body = json!({
            "id": id,
            "type": "message",
            "role": "assistant",
            "content": content,
            "model": body.get("modelVersion").and_then(JsonValue::as_str).unwrap_or(""),
            "stop_reason": stop_reason,
            "stop_sequence": JsonValue::Null,
            "usage": usage,
        });
        Ok(())
    }
}

/// Gemini function calls carry no id; derive a stable one from the call body.
fn function_call_id(value: &JsonValue) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    let mut id = String::from("toolu_");
    for byte in &digest[..6] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

fn convert_usage(metadata: Option<&JsonValue>) -> JsonValue {
    let Some(metadata) = metadata.and_then(JsonValue::as_object) else {
        return json!({"input_tokens": 0, "output_tokens": 0});
    };
    json!({
        "input_tokens": metadata.get("promptTokenCount").and_then(JsonValue::as_u64).unwrap_or(0),
        "output_tokens": metadata.get("candidatesTokenCount").and_then(JsonValue::as_u64).unwrap_or(0),
        "cache_read_input_tokens": metadata
            .get("cachedContentTokenCount")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0),
    })
}

/// Anthropic count_tokens → Gemini `:countTokens` request, which takes bare
/// `contents` without generation config.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountTokensRequest;

impl RequestTransformer for CountTokensRequest {
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

        let mut contents: Vec<JsonValue> = Vec::new();
        if let Some(system) = request.get("system")
            && let Some(instruction) = convert_system(system)
        {
            let parts = instruction.get("parts").cloned().unwrap_or_else(|| json!([]));
            contents.push(json!({"role": "user", "parts": parts}));
        }
        if let Some(messages) = request.get("messages").and_then(JsonValue::as_array) {
            contents.extend(messages.iter().filter_map(convert_message));
        }

        *payload = json!({"contents": contents});
        Ok(())
    }
}

/// Gemini `:countTokens` → Anthropic count_tokens response.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountTokensResponse;

impl ResponseTransformer for CountTokensResponse {
    fn transform_response(
        &self,
        body: &mut JsonValue,
        _ctx: &TransformContext,
    ) -> Result<(), TransformError> {
        let total = body
            .get("totalTokens")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        *body = json!({"input_tokens": total});
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_request(mut payload: JsonValue) -> JsonValue {
        let mut headers = Headers::new();
        let mut ctx = TransformContext::default();
        GenerateContentRequest
            .transform(&mut payload, &mut headers, &mut ctx)
            .unwrap();
        payload
    }

    #[test]
    fn request_maps_system_messages_and_config() {
        let out = run_request(json!({
            "model": "gemini-pro",
            "max_tokens": 300,
            "temperature": 0.7,
            "stop_sequences": ["END"],
            "system": [{"type": "text", "text": "be brief"}],
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [{"type": "text", "text": "hello"}]},
            ],
        }));
        assert_eq!(out["system_instruction"]["parts"][0]["text"], "be brief");
        assert_eq!(out["contents"][0]["role"], "user");
        assert_eq!(out["contents"][1]["role"], "model");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 300);
        assert_eq!(out["generationConfig"]["stopSequences"], json!(["END"]));
        assert_eq!(out["generationConfig"]["candidateCount"], 1);
    }

    #[test]
    fn tools_become_function_declarations() {
        let out = run_request(json!({
            "model": "gemini-pro",
            "max_tokens": 10,
            "tools": [{"name": "Read", "description": "read a file", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "x"}],
        }));
        assert_eq!(out["tools"][0]["functionDeclarations"][0]["name"], "Read");
        assert_eq!(
            out["toolConfig"]["functionCallingConfig"]["mode"],
            "AUTO"
        );
    }

    #[test]
    fn tool_use_and_result_round_trip_to_function_parts() {
        let out = run_request(json!({
            "model": "gemini-pro",
            "max_tokens": 10,
            "messages": [
                {"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "Read", "input": {"f": 1}}]},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "data", "is_error": true}]},
            ],
        }));
        assert_eq!(out["contents"][0]["parts"][0]["functionCall"]["name"], "Read");
        let response = &out["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "t1");
        assert_eq!(response["response"]["success"], false);
    }

    #[test]
    fn query_key_auth_moves_credential_to_query() {
        let mut payload = json!({});
        let mut headers: Headers = vec![("x-api-key".into(), "caller".into())];
        let mut ctx = TransformContext {
            api_key: "gk-123".into(),
            ..TransformContext::default()
        };
        QueryKeyAuth
            .transform(&mut payload, &mut headers, &mut ctx)
            .unwrap();
        assert!(headers.is_empty());
        assert_eq!(ctx.query, vec![("key".to_string(), "gk-123".to_string())]);
    }

    #[test]
    fn response_maps_candidates_and_usage() {
        let mut body = json!({
            "responseId": "resp-1",
            "modelVersion": "gemini-pro",
            "candidates": [{
                "finishReason": "STOP",
                "content": {"parts": [
                    {"text": "result"},
                    {"functionCall": {"name": "Read", "args": {"f": "x"}}},
                ]},
            }],
            "usageMetadata": {"promptTokenCount": 11, "candidatesTokenCount": 3},
        });
        GenerateContentResponse
            .transform_response(&mut body, &TransformContext::default())
            .unwrap();
        assert_eq!(body["id"], "resp-1");
        assert_eq!(body["model"], "gemini-pro");
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["content"][0], json!({"type": "text", "text": "result"}));
        assert_eq!(body["content"][1]["name"], "Read");
        assert!(body["content"][1]["id"].as_str().unwrap().starts_with("toolu_"));
        assert_eq!(body["usage"]["input_tokens"], 11);
    }

    #[test]
    fn count_tokens_response_maps_total() {
        let mut body = json!({"totalTokens": 42});
        CountTokensResponse
            .transform_response(&mut body, &TransformContext::default())
            .unwrap();
        assert_eq!(body, json!({"input_tokens": 42}));
    }
}
