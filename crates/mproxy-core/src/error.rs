use mproxy_protocol::ErrorBody;
use serde_json::Value as JsonValue;

/// Terminal request failure, already shaped for the ingress dialect.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub status: u16,
    pub body: ErrorBody,
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            body: ErrorBody::new("invalid_request_error", message),
        }
    }

    pub fn model_not_found(alias: &str) -> Self {
        Self {
            status: 404,
            body: ErrorBody::new(
                "model_not_found",
                format!("no provider is configured for model '{alias}'"),
            ),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self {
            status: 501,
            body: ErrorBody::new("not_supported_error", message),
        }
    }

    pub fn transformer_failed(name: &str, message: impl std::fmt::Display) -> Self {
        Self {
            status: 500,
            body: ErrorBody::new("transformer_failed", format!("{name}: {message}")),
        }
    }

    /// Upstream non-2xx, mapped onto the Anthropic error taxonomy.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::for_status(status, message),
        }
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self {
            status: 504,
            body: ErrorBody::new("overloaded_error", message),
        }
    }

    pub fn upstream_unreachable(message: impl Into<String>) -> Self {
        Self {
            status: 502,
            body: ErrorBody::new("api_error", message),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            body: ErrorBody::new("api_error", message),
        }
    }

    pub fn error_type(&self) -> &str {
        &self.body.error.r#type
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(&self.body).unwrap_or_else(|_| {
            serde_json::json!({"type": "error", "error": {"type": "api_error", "message": "error"}})
        })
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.status, self.body.error.r#type, self.body.error.message
        )
    }
}

impl std::error::Error for ProxyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_map_to_anthropic_types() {
        assert_eq!(ProxyError::upstream(429, "x").error_type(), "rate_limit_error");
        assert_eq!(ProxyError::upstream(401, "x").error_type(), "authentication_error");
        assert_eq!(ProxyError::upstream(503, "x").error_type(), "api_error");
        assert_eq!(ProxyError::upstream_timeout("x").error_type(), "overloaded_error");
    }

    #[test]
    fn json_body_has_wire_shape() {
        let err = ProxyError::transformer_failed("builtin.openai.ChatRequest", "bad payload");
        let json = err.to_json();
        assert_eq!(json["error"]["type"], "transformer_failed");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("builtin.openai.ChatRequest"));
    }
}
