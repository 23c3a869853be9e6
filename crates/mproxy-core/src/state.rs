use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::{Value as JsonValue, json};

use mproxy_provider::config::{Stage, effective_stage};
use mproxy_provider::{
    Channel, ConfigError, OperationKind, ProviderConfig, ProviderDescriptor, ProviderKind,
    TransformerRegistry, UserConfig, descriptor, yaml,
};
use mproxy_transform::{RequestTransformer, ResponseTransformer, StreamTransformer};

use crate::client::{ProviderClient, UpstreamClient, WreqUpstreamClient};
use crate::dump::Dumper;
use crate::router::RequestInspector;
use crate::sse_synth::PING_INTERVAL;

pub const FALLBACK_PROVIDER_NAME: &str = "default-anthropic";
const DEFAULT_DRAIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelBinding {
    pub provider: String,
    pub model_id: String,
}

/// Transformer instances resolved for one (channel, operation); names are
/// kept alongside for error annotation.
pub struct ResolvedPipeline {
    pub request: Vec<(String, Arc<dyn RequestTransformer>)>,
    pub response: Vec<(String, Arc<dyn ResponseTransformer>)>,
    pub stream: Vec<(String, Arc<dyn StreamTransformer>)>,
}

/// One configured provider with its descriptor and fully resolved pipelines.
pub struct ProviderHandle {
    pub config: ProviderConfig,
    pub descriptor: &'static ProviderDescriptor,
    pipelines: HashMap<(Channel, OperationKind), ResolvedPipeline>,
}

impl ProviderHandle {
    pub fn build(
        config: ProviderConfig,
        registry: &TransformerRegistry,
    ) -> Result<Self, ConfigError> {
        let descriptor = descriptor(config.kind);
        let overrides = config.transformers.as_ref();
        let mut pipelines = HashMap::new();
        let mut errors = Vec::new();

        for (channel, op) in descriptor.operations() {
            let Some(spec) = descriptor.operation(channel, op) else {
                continue;
            };
            let mut request = Vec::new();
            for t in effective_stage(overrides, Stage::Request, spec.default_request) {
                match registry.resolve_request(&t) {
                    Ok(instance) => request.push((t.name.clone(), instance)),
                    Err(err) => errors.push(format!("provider '{}': {err}", config.name)),
                }
            }
            let mut response = Vec::new();
            for t in effective_stage(overrides, Stage::Response, spec.default_response) {
                match registry.resolve_response(&t) {
                    Ok(instance) => response.push((t.name.clone(), instance)),
                    Err(err) => errors.push(format!("provider '{}': {err}", config.name)),
                }
            }
            let mut stream = Vec::new();
            for t in effective_stage(overrides, Stage::Stream, spec.default_stream) {
                match registry.resolve_stream(&t) {
                    Ok(instance) => stream.push((t.name.clone(), instance)),
                    Err(err) => errors.push(format!("provider '{}': {err}", config.name)),
                }
            }
            pipelines.insert(
                (channel, op),
                ResolvedPipeline {
                    request,
                    response,
                    stream,
                },
            );
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        Ok(Self {
            config,
            descriptor,
            pipelines,
        })
    }

    pub fn pipeline(&self, channel: Channel, op: OperationKind) -> Option<&ResolvedPipeline> {
        self.pipelines.get(&(channel, op))
    }
}

/// Everything one request needs, snapshotted at ingress. Rebuilt as a whole
/// on reload; never mutated in place.
pub struct ServiceContainer {
    pub config: UserConfig,
    pub providers: HashMap<String, Arc<ProviderHandle>>,
    pub aliases: HashMap<String, ModelBinding>,
    pub inspector: RequestInspector,
    pub fallback: Option<Arc<ProviderHandle>>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub loaded_at: time::OffsetDateTime,
}

impl ServiceContainer {
    pub fn build(
        config: UserConfig,
        registry: &TransformerRegistry,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Result<Self, ConfigError> {
        config.validate(registry)?;

        let mut providers = HashMap::new();
        for provider_config in &config.providers {
            let handle = ProviderHandle::build(provider_config.clone(), registry)?;
            providers.insert(provider_config.name.clone(), Arc::new(handle));
        }

        // Cyclic alias → provider references resolve into flat tables here;
        // lookups afterwards are plain map reads.
        let mut aliases = HashMap::new();
        for model in &config.models {
            aliases.insert(
                model.alias.clone(),
                ModelBinding {
                    provider: model.provider.clone(),
                    model_id: model.id.clone(),
                },
            );
        }

        let fallback = Some(Arc::new(ProviderHandle::build(
            fallback_provider_config(),
            registry,
        )?));

        Ok(Self {
            config,
            providers,
            aliases,
            inspector: RequestInspector::default(),
            fallback,
            upstream,
            loaded_at: time::OffsetDateTime::now_utc(),
        })
    }

    pub fn provider_handle(&self, name: &str) -> Option<&Arc<ProviderHandle>> {
        if let Some(handle) = self.providers.get(name) {
            return Some(handle);
        }
        self.fallback.as_ref().filter(|f| f.config.name == name)
    }

    pub fn provider_client(&self, name: &str) -> Option<ProviderClient> {
        self.provider_handle(name)
            .map(|handle| ProviderClient::new(handle.clone(), self.upstream.clone()))
    }

    pub fn status(&self) -> JsonValue {
        let mut providers: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        providers.sort_unstable();
        let mut aliases: Vec<&str> = self.aliases.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        json!({
            "loaded_at": self
                .loaded_at
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            "providers": providers,
            "models": aliases,
            "routing": self.config.routing,
        })
    }
}

/// The compiled-in Anthropic fallback, built from the environment.
fn fallback_provider_config() -> ProviderConfig {
    let base_url = std::env::var("MPROXY_FALLBACK_URL")
        .ok()
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| "https://api.anthropic.com".to_string());
    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("ANTHROPIC_API_KEY not set; the fallback provider cannot authenticate");
    }
    ProviderConfig {
        name: FALLBACK_PROVIDER_NAME.to_string(),
        kind: ProviderKind::Anthropic,
        base_url,
        api_key,
        timeout: None,
        transformers: None,
    }
}

pub type UpstreamFactory =
    Arc<dyn Fn() -> Result<Arc<dyn UpstreamClient>, String> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ReloadSummary {
    pub providers: usize,
    pub models: usize,
}

/// Process-wide state: the hot-swappable container plus everything needed to
/// rebuild it. Readers snapshot the container once per request and keep the
/// snapshot for the request's lifetime.
pub struct AppState {
    container: ArcSwap<ServiceContainer>,
    registry: Arc<TransformerRegistry>,
    user_config_path: PathBuf,
    upstream_factory: UpstreamFactory,
    reload_lock: tokio::sync::Mutex<()>,
    drain: Duration,
    pub dumper: Dumper,
    /// `None` disables SSE keep-alive pings (tests).
    pub ping_interval: Option<Duration>,
}

impl AppState {
    pub fn bootstrap(
        user_config_path: PathBuf,
        registry: Arc<TransformerRegistry>,
        dumper: Dumper,
    ) -> Result<Arc<Self>, ConfigError> {
        let factory: UpstreamFactory = Arc::new(|| {
            WreqUpstreamClient::new()
                .map(|client| Arc::new(client) as Arc<dyn UpstreamClient>)
                .map_err(|err| err.to_string())
        });
        Self::bootstrap_with(
            user_config_path,
            registry,
            factory,
            dumper,
            DEFAULT_DRAIN,
            Some(PING_INTERVAL),
        )
    }

    pub fn bootstrap_with(
        user_config_path: PathBuf,
        registry: Arc<TransformerRegistry>,
        upstream_factory: UpstreamFactory,
        dumper: Dumper,
        drain: Duration,
        ping_interval: Option<Duration>,
    ) -> Result<Arc<Self>, ConfigError> {
        let container = build_container(&user_config_path, &registry, &upstream_factory)?;
        Ok(Arc::new(Self {
            container: ArcSwap::from_pointee(container),
            registry,
            user_config_path,
            upstream_factory,
            reload_lock: tokio::sync::Mutex::new(()),
            drain,
            dumper,
            ping_interval,
        }))
    }

    pub fn snapshot(&self) -> Arc<ServiceContainer> {
        self.container.load_full()
    }

    pub fn registry(&self) -> &TransformerRegistry {
        &self.registry
    }

    pub fn validate(&self, config: &UserConfig) -> Result<(), ConfigError> {
        config.validate(&self.registry)
    }

    /// Reload procedure: read → parse → validate → build, then one atomic
    /// pointer swap. Failure anywhere before the swap leaves the previous
    /// container serving; the old container (with its HTTP clients) is
    /// dropped after the drain interval.
    pub async fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let _guard = self.reload_lock.lock().await;
        let container =
            build_container(&self.user_config_path, &self.registry, &self.upstream_factory)?;
        let summary = ReloadSummary {
            providers: container.providers.len(),
            models: container.aliases.len(),
        };
        let old = self.container.swap(Arc::new(container));
        let drain = self.drain;
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            drop(old);
        });
        Ok(summary)
    }
}

fn build_container(
    path: &PathBuf,
    registry: &TransformerRegistry,
    upstream_factory: &UpstreamFactory,
) -> Result<ServiceContainer, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Parse(format!("cannot read {}: {err}", path.display())))?;
    let config = yaml::load_user_config(&text)?;
    let upstream = upstream_factory()
        .map_err(|err| ConfigError::Parse(format!("failed to build upstream client: {err}")))?;
    ServiceContainer::build(config, registry, upstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse};
    use std::future::Future;
    use std::pin::Pin;

    struct NullUpstream;

    impl UpstreamClient for NullUpstream {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
        {
            Box::pin(async {
                Ok(UpstreamHttpResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: bytes::Bytes::from_static(b"{}"),
                })
            })
        }
    }

    fn upstream_factory() -> UpstreamFactory {
        Arc::new(|| Ok(Arc::new(NullUpstream) as Arc<dyn UpstreamClient>))
    }

    const VALID: &str = r#"
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
"#;

    const INVALID: &str = r#"
providers: []
models:
  - alias: sonnet
    id: gpt-4.1
    provider: ghost
routing:
  default: sonnet
"#;

    fn write_config(text: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("mproxy-user-{}.yaml", uuid::Uuid::now_v7()));
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn container_builds_flat_alias_table() {
        let config = yaml::load_user_config(VALID).unwrap();
        let registry = TransformerRegistry::with_builtins();
        let container =
            ServiceContainer::build(config, &registry, Arc::new(NullUpstream)).unwrap();
        assert_eq!(
            container.aliases.get("sonnet"),
            Some(&ModelBinding {
                provider: "openai-main".to_string(),
                model_id: "gpt-4.1".to_string(),
            })
        );
        assert!(container.provider_client("openai-main").is_some());
        assert!(container.provider_client(FALLBACK_PROVIDER_NAME).is_some());
        assert!(container.provider_client("ghost").is_none());
    }

    #[test]
    fn validate_success_iff_container_builds() {
        let registry = TransformerRegistry::with_builtins();
        let good = yaml::load_user_config(VALID).unwrap();
        assert!(good.validate(&registry).is_ok());
        assert!(ServiceContainer::build(good, &registry, Arc::new(NullUpstream)).is_ok());

        let bad = yaml::load_user_config(INVALID).unwrap();
        assert!(bad.validate(&registry).is_err());
        assert!(ServiceContainer::build(bad, &registry, Arc::new(NullUpstream)).is_err());
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_container() {
        let path = write_config(VALID);
        let state = AppState::bootstrap_with(
            path.clone(),
            Arc::new(TransformerRegistry::with_builtins()),
            upstream_factory(),
            Dumper::disabled(),
            Duration::from_millis(1),
            None,
        )
        .unwrap();
        let before = state.snapshot();

        std::fs::write(&path, INVALID).unwrap();
        let err = state.reload().await.unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let after = state.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn successful_reload_swaps_container() {
        let path = write_config(VALID);
        let state = AppState::bootstrap_with(
            path.clone(),
            Arc::new(TransformerRegistry::with_builtins()),
            upstream_factory(),
            Dumper::disabled(),
            Duration::from_millis(1),
            None,
        )
        .unwrap();
        let before = state.snapshot();

        let updated = VALID.replace("gpt-4.1", "gpt-4.1-mini");
        std::fs::write(&path, updated).unwrap();
        let summary = state.reload().await.unwrap();
        assert_eq!(summary.providers, 1);

        let after = state.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.aliases.get("sonnet").unwrap().model_id, "gpt-4.1-mini");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bootstrap_fails_on_missing_config_file() {
        let missing = std::env::temp_dir().join("mproxy-does-not-exist.yaml");
        let result = AppState::bootstrap_with(
            missing,
            Arc::new(TransformerRegistry::with_builtins()),
            upstream_factory(),
            Dumper::disabled(),
            Duration::from_millis(1),
            None,
        );
        assert!(result.is_err());
    }
}
