use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

use crate::descriptor::ProviderKind;
use crate::registry::TransformerRegistry;

pub type JsonObject = JsonMap<String, JsonValue>;

/// A transformer reference as written in user config:
/// `{class: "builtin.openai.ChatRequest", params: {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformerSpec {
    #[serde(rename = "class")]
    pub name: String,
    #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
    pub params: JsonObject,
}

impl TransformerSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: JsonObject::new(),
        }
    }
}

/// User overrides around the descriptor defaults. `request`/`response`/
/// `stream` replace the defaults wholesale when present (even when empty);
/// the pre/post lists always apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerOverrides {
    pub request: Option<Vec<TransformerSpec>>,
    pub response: Option<Vec<TransformerSpec>>,
    pub stream: Option<Vec<TransformerSpec>>,
    pub pre_request: Vec<TransformerSpec>,
    pub post_request: Vec<TransformerSpec>,
    pub pre_response: Vec<TransformerSpec>,
    pub post_response: Vec<TransformerSpec>,
    pub pre_stream: Vec<TransformerSpec>,
    pub post_stream: Vec<TransformerSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Request,
    Response,
    Stream,
}

impl TransformerOverrides {
    fn parts(&self, stage: Stage) -> (&[TransformerSpec], Option<&Vec<TransformerSpec>>, &[TransformerSpec]) {
        match stage {
            Stage::Request => (&self.pre_request, self.request.as_ref(), &self.post_request),
            Stage::Response => (&self.pre_response, self.response.as_ref(), &self.post_response),
            Stage::Stream => (&self.pre_stream, self.stream.as_ref(), &self.post_stream),
        }
    }
}

/// The pipeline merge: `pre ++ (override | defaults) ++ post`.
pub fn effective_stage(
    overrides: Option<&TransformerOverrides>,
    stage: Stage,
    defaults: &[&str],
) -> Vec<TransformerSpec> {
    let empty = (&[][..], None, &[][..]);
    let (pre, full, post) = overrides.map(|o| o.parts(stage)).unwrap_or(empty);

    let mut merged: Vec<TransformerSpec> = pre.to_vec();
    match full {
        Some(list) => merged.extend(list.iter().cloned()),
        None => merged.extend(defaults.iter().map(|name| TransformerSpec::named(name))),
    }
    merged.extend(post.iter().cloned());
    merged
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Upstream request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformers: Option<TransformerOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAliasConfig {
    pub alias: String,
    pub id: String,
    pub provider: String,
}

/// Stage → alias. `default` is mandatory; unmapped stages fall back to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    pub default: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin_tools: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_and_think: Option<String>,
}

impl RoutingTable {
    pub fn alias_for(&self, stage: &str) -> &str {
        let mapped = match stage {
            "builtin_tools" => self.builtin_tools.as_deref(),
            "thinking" => self.thinking.as_deref(),
            "planning" => self.planning.as_deref(),
            "background" => self.background.as_deref(),
            "plan_and_think" => self.plan_and_think.as_deref(),
            _ => None,
        };
        mapped.filter(|a| !a.is_empty()).unwrap_or(&self.default)
    }

    fn entries(&self) -> Vec<(&'static str, &str)> {
        let mut out = vec![("default", self.default.as_str())];
        for (key, value) in [
            ("builtin_tools", &self.builtin_tools),
            ("thinking", &self.thinking),
            ("planning", &self.planning),
            ("background", &self.background),
            ("plan_and_think", &self.plan_and_think),
        ] {
            if let Some(alias) = value {
                out.push((key, alias.as_str()));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub transformer_paths: Vec<String>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelAliasConfig>,
    pub routing: RoutingTable,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse user config: {0}")]
    Parse(String),
    #[error("configuration validation failed:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

impl UserConfig {
    /// Cross-reference validation. Succeeding here is the contract that a
    /// service container can be built from this config.
    pub fn validate(&self, registry: &TransformerRegistry) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                errors.push(format!("duplicate provider name '{}'", provider.name));
            }
            if let Err(reason) = check_origin(&provider.base_url) {
                errors.push(format!(
                    "provider '{}' has invalid base_url '{}': {reason}",
                    provider.name, provider.base_url
                ));
            }
        }

        let mut aliases = HashSet::new();
        for model in &self.models {
            if !aliases.insert(model.alias.as_str()) {
                errors.push(format!("duplicate model alias '{}'", model.alias));
            }
            if !self.providers.iter().any(|p| p.name == model.provider) {
                errors.push(format!(
                    "model '{}' references unknown provider '{}'",
                    model.alias, model.provider
                ));
            }
        }

        for (stage, alias) in self.routing.entries() {
            if alias.is_empty() {
                errors.push(format!("routing '{stage}' maps to an empty alias"));
                continue;
            }
            if !aliases.contains(alias) {
                errors.push(format!(
                    "routing '{stage}' references unknown model alias '{alias}'"
                ));
            }
        }

        for path in &self.transformer_paths {
            if !registry.has_namespace(path) {
                errors.push(format!("unknown transformer namespace '{path}'"));
            }
        }

        for provider in &self.providers {
            errors.extend(self.transformer_errors(provider, registry));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Resolves the full effective pipeline of every operation the provider's
    /// descriptor exposes; a miss or a construction failure is a config
    /// error, surfaced at reload time rather than request time.
    fn transformer_errors(
        &self,
        provider: &ProviderConfig,
        registry: &TransformerRegistry,
    ) -> Vec<String> {
        let descriptor = crate::descriptor::descriptor(provider.kind);
        let mut errors = Vec::new();
        for (channel, op) in descriptor.operations() {
            let Some(spec) = descriptor.operation(channel, op) else {
                continue;
            };
            let overrides = provider.transformers.as_ref();
            for t in effective_stage(overrides, Stage::Request, spec.default_request) {
                if let Err(err) = registry.resolve_request(&t) {
                    errors.push(format!("provider '{}': {err}", provider.name));
                }
            }
            for t in effective_stage(overrides, Stage::Response, spec.default_response) {
                if let Err(err) = registry.resolve_response(&t) {
                    errors.push(format!("provider '{}': {err}", provider.name));
                }
            }
            for t in effective_stage(overrides, Stage::Stream, spec.default_stream) {
                if let Err(err) = registry.resolve_stream(&t) {
                    errors.push(format!("provider '{}': {err}", provider.name));
                }
            }
        }
        errors
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

fn check_origin(raw: &str) -> Result<(), String> {
    let parsed = url::Url::parse(raw).map_err(|err| err.to_string())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", parsed.scheme()));
    }
    if parsed.host_str().is_none() {
        return Err("missing host".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TransformerRegistry {
        TransformerRegistry::with_builtins()
    }

    fn valid_config() -> UserConfig {
        serde_yaml::from_str(
            r#"
providers:
  - name: openai-main
    type: openai
    base_url: https://api.openai.com
    api_key: sk-test
models:
  - alias: sonnet
    id: gpt-4.1
    provider: openai-main
routing:
  default: sonnet
"#,
        )
        .unwrap()
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate(&registry()).unwrap();
    }

    #[test]
    fn unknown_provider_reference_fails() {
        let mut config = valid_config();
        config.models[0].provider = "missing".to_string();
        let err = config.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("unknown provider 'missing'"));
    }

    #[test]
    fn unknown_routing_alias_fails() {
        let mut config = valid_config();
        config.routing.thinking = Some("nope".to_string());
        let err = config.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("unknown model alias 'nope'"));
    }

    #[test]
    fn duplicate_provider_names_fail() {
        let mut config = valid_config();
        let mut dup = config.providers[0].clone();
        dup.base_url = "https://other.example.com".to_string();
        config.providers.push(dup);
        let err = config.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("duplicate provider name"));
    }

    #[test]
    fn bad_base_url_fails() {
        let mut config = valid_config();
        config.providers[0].base_url = "not a url".to_string();
        assert!(config.validate(&registry()).is_err());

        config.providers[0].base_url = "ftp://files.example.com".to_string();
        let err = config.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn unknown_transformer_class_fails() {
        let mut config = valid_config();
        config.providers[0].transformers = Some(TransformerOverrides {
            pre_request: vec![TransformerSpec::named("builtin.nope.Missing")],
            ..TransformerOverrides::default()
        });
        let err = config.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("builtin.nope.Missing"));
    }

    #[test]
    fn unknown_transformer_namespace_fails() {
        let mut config = valid_config();
        config.transformer_paths = vec!["plugins".to_string()];
        let err = config.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("unknown transformer namespace"));
    }

    #[test]
    fn merge_uses_defaults_when_no_override() {
        let merged = effective_stage(None, Stage::Request, &["builtin.a.X", "builtin.b.Y"]);
        assert_eq!(
            merged,
            vec![TransformerSpec::named("builtin.a.X"), TransformerSpec::named("builtin.b.Y")]
        );
    }

    #[test]
    fn merge_wraps_defaults_with_pre_and_post() {
        let overrides = TransformerOverrides {
            pre_request: vec![TransformerSpec::named("builtin.p.Pre")],
            post_request: vec![TransformerSpec::named("builtin.p.Post")],
            ..TransformerOverrides::default()
        };
        let merged = effective_stage(Some(&overrides), Stage::Request, &["builtin.d.Default"]);
        let names: Vec<&str> = merged.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["builtin.p.Pre", "builtin.d.Default", "builtin.p.Post"]);
    }

    #[test]
    fn full_override_replaces_defaults_but_keeps_pre_post() {
        let overrides = TransformerOverrides {
            request: Some(vec![TransformerSpec::named("builtin.o.Only")]),
            pre_request: vec![TransformerSpec::named("builtin.p.Pre")],
            post_request: vec![TransformerSpec::named("builtin.p.Post")],
            ..TransformerOverrides::default()
        };
        let merged = effective_stage(Some(&overrides), Stage::Request, &["builtin.d.Default"]);
        let names: Vec<&str> = merged.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["builtin.p.Pre", "builtin.o.Only", "builtin.p.Post"]);
    }

    #[test]
    fn empty_override_suppresses_defaults() {
        let overrides = TransformerOverrides {
            request: Some(Vec::new()),
            ..TransformerOverrides::default()
        };
        let merged = effective_stage(Some(&overrides), Stage::Request, &["builtin.d.Default"]);
        assert!(merged.is_empty());
    }

    #[test]
    fn routing_falls_back_to_default() {
        let table = RoutingTable {
            default: "base".to_string(),
            builtin_tools: Some("search".to_string()),
            thinking: None,
            planning: None,
            background: None,
            plan_and_think: None,
        };
        assert_eq!(table.alias_for("builtin_tools"), "search");
        assert_eq!(table.alias_for("thinking"), "base");
        assert_eq!(table.alias_for("default"), "base");
    }
}
