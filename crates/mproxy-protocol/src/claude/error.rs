use serde::{Deserialize, Serialize};

/// Anthropic-style error envelope: `{"type":"error","error":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type", default = "error_marker")]
    pub r#type: String,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: String,
}

fn error_marker() -> String {
    "error".to_string()
}

impl ErrorBody {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            r#type: error_marker(),
            error: ErrorDetail {
                r#type: error_type.into(),
                message: message.into(),
            },
        }
    }

    pub fn for_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(anthropic_error_type(status), message)
    }
}

/// Upstream HTTP status to Anthropic error type.
pub fn anthropic_error_type(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        s if s >= 500 => "api_error",
        _ => "invalid_request_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_anthropic_table() {
        assert_eq!(anthropic_error_type(400), "invalid_request_error");
        assert_eq!(anthropic_error_type(401), "authentication_error");
        assert_eq!(anthropic_error_type(403), "permission_error");
        assert_eq!(anthropic_error_type(404), "not_found_error");
        assert_eq!(anthropic_error_type(429), "rate_limit_error");
        assert_eq!(anthropic_error_type(500), "api_error");
        assert_eq!(anthropic_error_type(503), "api_error");
    }

    #[test]
    fn body_serializes_to_wire_shape() {
        let body = ErrorBody::for_status(429, "slow down");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["message"], "slow down");
    }
}
