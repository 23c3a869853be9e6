use mproxy_protocol::claude::messages::{MessageContent, MessagesRequestBody, ThinkingConfig};
use serde_json::Value as JsonValue;

use crate::error::ProxyError;
use crate::state::ServiceContainer;

const PLAN_MODE_SENTINEL: &str = "<system-reminder>\nPlan mode is active.";
const BACKGROUND_MARKER: &str = "background";

/// Classifier output stage, in the routing table's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    Default,
    Background,
    Thinking,
    Planning,
    PlanAndThink,
    BuiltinTools,
    Override,
}

impl RoutingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingKey::Default => "default",
            RoutingKey::Background => "background",
            RoutingKey::Thinking => "thinking",
            RoutingKey::Planning => "planning",
            RoutingKey::PlanAndThink => "plan_and_think",
            RoutingKey::BuiltinTools => "builtin_tools",
            RoutingKey::Override => "override",
        }
    }
}

/// Boolean-ized classifier inputs. The ingress adapter decides how each
/// signal is derived from the wire; the classifier only orders them.
#[derive(Debug, Clone, Default)]
pub struct ClassifierSignals {
    pub explicit_override: Option<String>,
    pub model_directive: Option<String>,
    pub has_builtin_tools: bool,
    pub plan_mode: bool,
    pub thinking_budget: u32,
    pub is_background: bool,
}

/// Complete routing decision for one request.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub provider: String,
    pub resolved_model: String,
    pub routing_key: RoutingKey,
    pub alias: String,
    pub used_fallback: bool,
}

/// Extracts classifier signals from an Anthropic Messages body, stripping
/// in-band directives (`!` model suffix, `/model` line) as it goes.
#[derive(Debug, Clone)]
pub struct RequestInspector {
    builtin_tool_prefixes: Vec<String>,
}

impl Default for RequestInspector {
    fn default() -> Self {
        Self {
            builtin_tool_prefixes: vec!["web_search".to_string(), "web_fetch".to_string()],
        }
    }
}

impl RequestInspector {
    pub fn with_builtin_prefixes(prefixes: Vec<String>) -> Self {
        Self {
            builtin_tool_prefixes: prefixes,
        }
    }

    pub fn inspect(&self, body: &mut MessagesRequestBody) -> ClassifierSignals {
        let explicit_override = body.model.strip_suffix('!').map(str::to_string);
        if let Some(alias) = &explicit_override {
            body.model = alias.clone();
        }

        ClassifierSignals {
            explicit_override,
            model_directive: extract_model_directive(body),
            has_builtin_tools: self.has_builtin_tools(body),
            plan_mode: has_plan_mode(body),
            thinking_budget: thinking_budget(body.thinking.as_ref()),
            is_background: is_background(body),
        }
    }

    fn has_builtin_tools(&self, body: &MessagesRequestBody) -> bool {
        let Some(tools) = &body.tools else {
            return false;
        };
        tools.iter().any(|tool| {
            if !mproxy_transform::is_builtin_tool(tool) {
                return false;
            }
            let tool_type = tool.get("type").and_then(JsonValue::as_str).unwrap_or("");
            self.builtin_tool_prefixes
                .iter()
                .any(|prefix| tool_type.starts_with(prefix.as_str()))
        })
    }
}

/// Ordered stage rules; the first match wins.
pub fn classify(signals: &ClassifierSignals) -> RoutingKey {
    if signals.explicit_override.is_some() || signals.model_directive.is_some() {
        RoutingKey::Override
    } else if signals.has_builtin_tools {
        RoutingKey::BuiltinTools
    } else if signals.plan_mode && signals.thinking_budget > 0 {
        RoutingKey::PlanAndThink
    } else if signals.plan_mode {
        RoutingKey::Planning
    } else if signals.thinking_budget > 0 {
        RoutingKey::Thinking
    } else if signals.is_background {
        RoutingKey::Background
    } else {
        RoutingKey::Default
    }
}

/// Claude-channel routing: classify, map the stage through the routing
/// table, resolve the alias to a provider binding.
///
/// An alias that came out of the routing table but is missing from the
/// models table routes to the compiled-in fallback provider (a broken
/// routing table should degrade, not hard-fail every request); an alias the
/// caller named explicitly is a request error.
pub fn route_claude(
    container: &ServiceContainer,
    signals: &ClassifierSignals,
) -> Result<RoutingResult, ProxyError> {
    let routing_key = classify(signals);

    let (alias, caller_named) = match routing_key {
        RoutingKey::Override => {
            let alias = signals
                .explicit_override
                .clone()
                .or_else(|| signals.model_directive.clone())
                .unwrap_or_default();
            (alias, true)
        }
        key => (
            container.config.routing.alias_for(key.as_str()).to_string(),
            false,
        ),
    };

    if let Some(binding) = container.aliases.get(&alias) {
        return Ok(RoutingResult {
            provider: binding.provider.clone(),
            resolved_model: binding.model_id.clone(),
            routing_key,
            alias,
            used_fallback: false,
        });
    }

    if caller_named {
        return Err(ProxyError::model_not_found(&alias));
    }

    let Some(fallback) = &container.fallback else {
        return Err(ProxyError::model_not_found(&alias));
    };
    Ok(RoutingResult {
        provider: fallback.config.name.clone(),
        resolved_model: alias.clone(),
        routing_key,
        alias,
        used_fallback: true,
    })
}

/// Non-claude channels bypass classification: the model field is the alias.
pub fn route_codex(container: &ServiceContainer, model: &str) -> Result<RoutingResult, ProxyError> {
    let binding = container
        .aliases
        .get(model)
        .ok_or_else(|| ProxyError::model_not_found(model))?;
    Ok(RoutingResult {
        provider: binding.provider.clone(),
        resolved_model: binding.model_id.clone(),
        routing_key: RoutingKey::Override,
        alias: model.to_string(),
        used_fallback: false,
    })
}

/// When the thinking budget exceeds max_tokens the upstream rejects the
/// request outright; lift max_tokens just above the budget instead.
pub fn ensure_thinking_budget(body: &mut MessagesRequestBody) {
    let budget = thinking_budget(body.thinking.as_ref());
    if budget == 0 {
        return;
    }
    if let Some(max_tokens) = body.max_tokens
        && budget > max_tokens
    {
        body.max_tokens = Some((budget + 1).min(32_000));
    }
}

fn thinking_budget(thinking: Option<&ThinkingConfig>) -> u32 {
    thinking.map(|t| t.budget_tokens).unwrap_or(0)
}

/// `/model <alias>` on the first line of the first user message selects the
/// alias directly; the directive line is stripped from the forwarded text.
fn extract_model_directive(body: &mut MessagesRequestBody) -> Option<String> {
    let message = body.messages.iter_mut().find(|m| m.role == "user")?;

    match &mut message.content {
        MessageContent::Text(text) => {
            let (alias, rest) = parse_model_directive(text)?;
            *text = rest;
            Some(alias)
        }
        MessageContent::Blocks(blocks) => {
            let first_text = blocks.iter_mut().find(|b| {
                b.get("type").and_then(JsonValue::as_str) == Some("text")
            })?;
            let text = first_text.get("text").and_then(JsonValue::as_str)?;
            let (alias, rest) = parse_model_directive(text)?;
            first_text["text"] = JsonValue::String(rest);
            Some(alias)
        }
    }
}

fn parse_model_directive(text: &str) -> Option<(String, String)> {
    let stripped = text.strip_prefix("/model ")?;
    let (first_line, rest) = match stripped.split_once('\n') {
        Some((line, rest)) => (line, rest),
        None => (stripped, ""),
    };
    let alias = first_line.trim();
    if alias.is_empty() || alias.contains(char::is_whitespace) {
        return None;
    }
    Some((alias.to_string(), rest.to_string()))
}

/// Plan mode arrives as a sentinel inside the last user message.
fn has_plan_mode(body: &MessagesRequestBody) -> bool {
    let Some(message) = body.messages.iter().rev().find(|m| m.role == "user") else {
        return false;
    };
    match &message.content {
        MessageContent::Text(text) => text.contains(PLAN_MODE_SENTINEL),
        MessageContent::Blocks(blocks) => blocks.iter().any(|block| {
            let text = block
                .get("text")
                .or_else(|| block.get("content"))
                .and_then(JsonValue::as_str)
                .unwrap_or("");
            text.contains(PLAN_MODE_SENTINEL)
        }),
    }
}

/// Background/subagent callers are identified by a metadata hint.
fn is_background(body: &MessagesRequestBody) -> bool {
    body.metadata
        .as_ref()
        .and_then(|m| m.user_id.as_deref())
        .map(|user_id| user_id.contains(BACKGROUND_MARKER))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: JsonValue) -> MessagesRequestBody {
        serde_json::from_value(value).unwrap()
    }

    fn signals_for(value: JsonValue) -> ClassifierSignals {
        let mut body = body(value);
        RequestInspector::default().inspect(&mut body)
    }

    #[test]
    fn bang_suffix_forces_override() {
        let mut request = body(json!({
            "model": "sonnet!",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let signals = RequestInspector::default().inspect(&mut request);
        assert_eq!(signals.explicit_override.as_deref(), Some("sonnet"));
        assert_eq!(request.model, "sonnet");
        assert_eq!(classify(&signals), RoutingKey::Override);
    }

    #[test]
    fn builtin_tools_outrank_thinking() {
        let signals = signals_for(json!({
            "model": "sonnet",
            "tools": [{"type": "web_search_20241022", "name": "web_search"}],
            "thinking": {"type": "enabled", "budget_tokens": 4000},
            "messages": [{"role": "user", "content": "hi"}],
        }));
        assert_eq!(classify(&signals), RoutingKey::BuiltinTools);
    }

    #[test]
    fn model_directive_is_extracted_and_stripped() {
        let mut request = body(json!({
            "model": "sonnet",
            "messages": [{"role": "user", "content": "/model fast\nactual question"}],
        }));
        let signals = RequestInspector::default().inspect(&mut request);
        assert_eq!(signals.model_directive.as_deref(), Some("fast"));
        assert_eq!(classify(&signals), RoutingKey::Override);
        match &request.messages[0].content {
            MessageContent::Text(text) => assert_eq!(text, "actual question"),
            _ => panic!("content shape changed"),
        }
    }

    #[test]
    fn plan_mode_with_thinking_is_plan_and_think() {
        let signals = signals_for(json!({
            "model": "sonnet",
            "thinking": {"type": "enabled", "budget_tokens": 8000},
            "messages": [{
                "role": "user",
                "content": format!("{PLAN_MODE_SENTINEL}\n</system-reminder>do it"),
            }],
        }));
        assert_eq!(classify(&signals), RoutingKey::PlanAndThink);
    }

    #[test]
    fn plan_mode_alone_is_planning() {
        let signals = signals_for(json!({
            "model": "sonnet",
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": format!("{PLAN_MODE_SENTINEL} now")}],
            }],
        }));
        assert_eq!(classify(&signals), RoutingKey::Planning);
    }

    #[test]
    fn thinking_alone_is_thinking() {
        let signals = signals_for(json!({
            "model": "sonnet",
            "thinking": {"type": "enabled", "budget_tokens": 1},
            "messages": [{"role": "user", "content": "hi"}],
        }));
        assert_eq!(classify(&signals), RoutingKey::Thinking);
    }

    #[test]
    fn background_metadata_hint_routes_background() {
        let signals = signals_for(json!({
            "model": "sonnet",
            "metadata": {"user_id": "background-topic-detector"},
            "messages": [{"role": "user", "content": "summarize"}],
        }));
        assert_eq!(classify(&signals), RoutingKey::Background);
    }

    #[test]
    fn empty_signals_default() {
        let signals = signals_for(json!({
            "model": "sonnet",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        assert_eq!(classify(&signals), RoutingKey::Default);
    }

    #[test]
    fn thinking_budget_lifts_max_tokens() {
        let mut request = body(json!({
            "model": "sonnet",
            "max_tokens": 1000,
            "thinking": {"type": "enabled", "budget_tokens": 6000},
            "messages": [{"role": "user", "content": "hi"}],
        }));
        ensure_thinking_budget(&mut request);
        assert_eq!(request.max_tokens, Some(6001));

        let mut request = body(json!({
            "model": "sonnet",
            "max_tokens": 100,
            "thinking": {"type": "enabled", "budget_tokens": 99000},
            "messages": [{"role": "user", "content": "hi"}],
        }));
        ensure_thinking_budget(&mut request);
        assert_eq!(request.max_tokens, Some(32_000));
    }
}
