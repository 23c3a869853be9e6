pub mod client;
pub mod context;
pub mod count_tokens;
pub mod dump;
pub mod error;
pub mod exchange;
pub mod router;
pub mod sse_synth;
pub mod state;

pub use client::{
    HttpMethod, ProviderClient, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind, WreqUpstreamClient,
};
pub use context::RequestContext;
pub use error::ProxyError;
pub use exchange::{Channel, ExchangeRequest, ExchangeResponse, ExchangeStreamChunk, Operation};
pub use router::{ClassifierSignals, RequestInspector, RoutingKey, RoutingResult};
pub use state::{AppState, ModelBinding, ProviderHandle, ServiceContainer};
