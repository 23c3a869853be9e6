use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use mproxy_transform::{
    RequestTransformer, ResponseTransformer, StreamTransformer, anthropic, gemini, openai,
    openai_responses, util,
};

use crate::config::{JsonObject, TransformerSpec};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown transformer '{0}'")]
    Unknown(String),
    #[error("transformer '{name}' failed to construct: {message}")]
    Construction { name: String, message: String },
}

type RequestFactory =
    Box<dyn Fn(&JsonObject) -> Result<Arc<dyn RequestTransformer>, RegistryError> + Send + Sync>;
type ResponseFactory =
    Box<dyn Fn(&JsonObject) -> Result<Arc<dyn ResponseTransformer>, RegistryError> + Send + Sync>;
type StreamFactory =
    Box<dyn Fn(&JsonObject) -> Result<Arc<dyn StreamTransformer>, RegistryError> + Send + Sync>;

/// Qualified transformer name → factory, with a cross-reload instance cache.
///
/// Rust has no runtime class loading, so "search paths" are registry
/// namespaces populated at embed time via `register_*`; the `builtin`
/// namespace ships pre-registered. Resolution keeps the first registration
/// for a name, so built-ins cannot be shadowed.
pub struct TransformerRegistry {
    request: HashMap<String, RequestFactory>,
    response: HashMap<String, ResponseFactory>,
    stream: HashMap<String, StreamFactory>,
    namespaces: HashSet<String>,
    request_cache: Mutex<HashMap<String, Arc<dyn RequestTransformer>>>,
    response_cache: Mutex<HashMap<String, Arc<dyn ResponseTransformer>>>,
    stream_cache: Mutex<HashMap<String, Arc<dyn StreamTransformer>>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        let mut namespaces = HashSet::new();
        namespaces.insert("builtin".to_string());
        Self {
            request: HashMap::new(),
            response: HashMap::new(),
            stream: HashMap::new(),
            namespaces,
            request_cache: Mutex::new(HashMap::new()),
            response_cache: Mutex::new(HashMap::new()),
            stream_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    pub fn register_namespace(&mut self, namespace: impl Into<String>) {
        self.namespaces.insert(namespace.into());
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }

    /// Registers a request transformer factory. First registration wins.
    pub fn register_request<F>(&mut self, name: &str, factory: F) -> bool
    where
        F: Fn(&JsonObject) -> Result<Arc<dyn RequestTransformer>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.register_namespace_of(name);
        if self.request.contains_key(name) {
            return false;
        }
        self.request.insert(name.to_string(), Box::new(factory));
        true
    }

    pub fn register_response<F>(&mut self, name: &str, factory: F) -> bool
    where
        F: Fn(&JsonObject) -> Result<Arc<dyn ResponseTransformer>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.register_namespace_of(name);
        if self.response.contains_key(name) {
            return false;
        }
        self.response.insert(name.to_string(), Box::new(factory));
        true
    }

    pub fn register_stream<F>(&mut self, name: &str, factory: F) -> bool
    where
        F: Fn(&JsonObject) -> Result<Arc<dyn StreamTransformer>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.register_namespace_of(name);
        if self.stream.contains_key(name) {
            return false;
        }
        self.stream.insert(name.to_string(), Box::new(factory));
        true
    }

    fn register_namespace_of(&mut self, name: &str) {
        if let Some(namespace) = name.split('.').next()
            && !namespace.is_empty()
        {
            self.namespaces.insert(namespace.to_string());
        }
    }

    pub fn resolve_request(
        &self,
        spec: &TransformerSpec,
    ) -> Result<Arc<dyn RequestTransformer>, RegistryError> {
        let key = cache_key(spec);
        if let Some(cached) = self.request_cache.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }
        let factory = self
            .request
            .get(&spec.name)
            .ok_or_else(|| RegistryError::Unknown(spec.name.clone()))?;
        let instance = factory(&spec.params)?;
        self.request_cache
            .lock()
            .unwrap()
            .insert(key, instance.clone());
        Ok(instance)
    }

    pub fn resolve_response(
        &self,
        spec: &TransformerSpec,
    ) -> Result<Arc<dyn ResponseTransformer>, RegistryError> {
        let key = cache_key(spec);
        if let Some(cached) = self.response_cache.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }
        let factory = self
            .response
            .get(&spec.name)
            .ok_or_else(|| RegistryError::Unknown(spec.name.clone()))?;
        let instance = factory(&spec.params)?;
        self.response_cache
            .lock()
            .unwrap()
            .insert(key, instance.clone());
        Ok(instance)
    }

    pub fn resolve_stream(
        &self,
        spec: &TransformerSpec,
    ) -> Result<Arc<dyn StreamTransformer>, RegistryError> {
        let key = cache_key(spec);
        if let Some(cached) = self.stream_cache.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }
        let factory = self
            .stream
            .get(&spec.name)
            .ok_or_else(|| RegistryError::Unknown(spec.name.clone()))?;
        let instance = factory(&spec.params)?;
        self.stream_cache
            .lock()
            .unwrap()
            .insert(key, instance.clone());
        Ok(instance)
    }

    pub fn cached_instances(&self) -> usize {
        self.request_cache.lock().unwrap().len()
            + self.response_cache.lock().unwrap().len()
            + self.stream_cache.lock().unwrap().len()
    }

    fn register_builtins(&mut self) {
        self.register_request("builtin.anthropic.HeaderInject", |_| {
            Ok(Arc::new(anthropic::HeaderInject))
        });
        self.register_request("builtin.anthropic.SystemCleaner", |_| {
            Ok(Arc::new(anthropic::SystemCleaner))
        });
        self.register_request("builtin.anthropic.CacheBreakpoints", |_| {
            Ok(Arc::new(anthropic::CacheBreakpoints))
        });
        self.register_response("builtin.anthropic.Passthrough", |_| {
            Ok(Arc::new(anthropic::Passthrough))
        });

        self.register_request("builtin.openai.BearerAuth", |_| {
            Ok(Arc::new(openai::BearerAuth))
        });
        self.register_request("builtin.openai.ChatRequest", |_| {
            Ok(Arc::new(openai::ChatRequest))
        });
        self.register_response("builtin.openai.ChatResponse", |_| {
            Ok(Arc::new(openai::ChatResponse))
        });

        self.register_request("builtin.responses.Request", |_| {
            Ok(Arc::new(openai_responses::ResponsesRequest))
        });
        self.register_response("builtin.responses.Response", |_| {
            Ok(Arc::new(openai_responses::ResponsesResponse))
        });

        self.register_request("builtin.gemini.QueryKeyAuth", |_| {
            Ok(Arc::new(gemini::QueryKeyAuth))
        });
        self.register_request("builtin.gemini.GenerateContentRequest", |_| {
            Ok(Arc::new(gemini::GenerateContentRequest))
        });
        self.register_request("builtin.gemini.CountTokensRequest", |_| {
            Ok(Arc::new(gemini::CountTokensRequest))
        });
        self.register_response("builtin.gemini.GenerateContentResponse", |_| {
            Ok(Arc::new(gemini::GenerateContentResponse))
        });
        self.register_response("builtin.gemini.CountTokensResponse", |_| {
            Ok(Arc::new(gemini::CountTokensResponse))
        });

        self.register_request("builtin.util.AddHeader", |params| {
            parse_params::<util::AddHeader>("builtin.util.AddHeader", params)
                .map(|t| Arc::new(t) as Arc<dyn RequestTransformer>)
        });
        self.register_request("builtin.util.UrlPath", |params| {
            parse_params::<util::UrlPath>("builtin.util.UrlPath", params)
                .map(|t| Arc::new(t) as Arc<dyn RequestTransformer>)
        });
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    name: &str,
    params: &JsonObject,
) -> Result<T, RegistryError> {
    serde_json::from_value(JsonValue::Object(params.clone())).map_err(|err| {
        RegistryError::Construction {
            name: name.to_string(),
            message: err.to_string(),
        }
    })
}

/// Instances are cached by (name, canonical params); serde_json maps are
/// ordered, so equal params always hash to the same key.
fn cache_key(spec: &TransformerSpec) -> String {
    let params = serde_json::to_string(&spec.params).unwrap_or_default();
    format!("{}\u{1}{params}", spec.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_resolve() {
        let registry = TransformerRegistry::with_builtins();
        registry
            .resolve_request(&TransformerSpec::named("builtin.openai.ChatRequest"))
            .unwrap();
        registry
            .resolve_response(&TransformerSpec::named("builtin.gemini.GenerateContentResponse"))
            .unwrap();
    }

    #[test]
    fn unknown_name_is_an_error() {
        let registry = TransformerRegistry::with_builtins();
        let err = match registry.resolve_request(&TransformerSpec::named("builtin.missing.Nope")) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, RegistryError::Unknown(_)));
    }

    #[test]
    fn instances_are_cached_by_name_and_params() {
        let registry = TransformerRegistry::with_builtins();
        let spec = TransformerSpec::named("builtin.anthropic.CacheBreakpoints");
        let a = registry.resolve_request(&spec).unwrap();
        let b = registry.resolve_request(&spec).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let mut with_params = TransformerSpec::named("builtin.util.AddHeader");
        with_params.params = json!({"key": "x-a", "value": "1"})
            .as_object()
            .unwrap()
            .clone();
        let c = registry.resolve_request(&with_params).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.cached_instances(), 2);
    }

    #[test]
    fn bad_params_fail_construction() {
        let registry = TransformerRegistry::with_builtins();
        let mut spec = TransformerSpec::named("builtin.util.AddHeader");
        spec.params = json!({"key": 42}).as_object().unwrap().clone();
        let err = match registry.resolve_request(&spec) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, RegistryError::Construction { .. }));
    }

    #[test]
    fn first_registration_wins() {
        let mut registry = TransformerRegistry::with_builtins();
        let replaced = registry.register_request("builtin.openai.ChatRequest", |_| {
            Ok(Arc::new(anthropic::HeaderInject))
        });
        assert!(!replaced);
    }

    #[test]
    fn user_namespaces_are_tracked() {
        let mut registry = TransformerRegistry::with_builtins();
        assert!(registry.has_namespace("builtin"));
        assert!(!registry.has_namespace("plugins"));
        registry.register_request("plugins.custom.Tag", |_| {
            Ok(Arc::new(anthropic::HeaderInject))
        });
        assert!(registry.has_namespace("plugins"));
    }
}
