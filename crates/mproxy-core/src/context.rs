use std::time::Instant;

use crate::exchange::Channel;

/// Explicit per-request context threaded through the pipeline; the ingress
/// handler creates it and every component takes it as an argument. Nothing
/// here lives in task-locals.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub channel: Channel,
    pub original_model: String,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(channel: Channel, original_model: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::now_v7().to_string(),
            channel,
            original_model: original_model.into(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}
