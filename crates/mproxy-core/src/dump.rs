use std::path::PathBuf;

use serde_json::{Value as JsonValue, json};

use mproxy_common::DumpConfig;
use mproxy_transform::Headers;

use crate::context::RequestContext;

const REDACTED: &str = "[redacted]";

/// On-disk dump sink for pipeline debugging. Every write is best-effort:
/// a full disk must not fail live traffic.
#[derive(Debug, Clone, Default)]
pub struct Dumper {
    config: DumpConfig,
}

impl Dumper {
    pub fn new(config: DumpConfig) -> Self {
        Self { config }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn write_ingress(&self, cx: &RequestContext, headers: &Headers, payload: &JsonValue) {
        if self.config.ingress {
            self.write(cx, "ingress", &with_headers(headers, payload));
        }
    }

    pub fn write_transformed(&self, cx: &RequestContext, headers: &Headers, payload: &JsonValue) {
        if self.config.transformed {
            self.write(cx, "transformed", &with_headers(headers, payload));
        }
    }

    pub fn write_response(&self, cx: &RequestContext, body: &JsonValue) {
        if self.config.response {
            self.write(cx, "response", body);
        }
    }

    fn write(&self, cx: &RequestContext, stage: &str, value: &JsonValue) {
        let Some(dir) = &self.config.dir else {
            return;
        };
        let mut path = PathBuf::from(dir);
        if std::fs::create_dir_all(&path).is_err() {
            return;
        }
        path.push(format!("{}.{stage}.json", cx.correlation_id));
        let Ok(text) = serde_json::to_vec_pretty(value) else {
            return;
        };
        if let Err(err) = std::fs::write(&path, text) {
            tracing::warn!(stage, error = %err, "failed to write dump file");
        }
    }
}

fn with_headers(headers: &Headers, payload: &JsonValue) -> JsonValue {
    json!({
        "headers": sanitize_headers(headers),
        "payload": payload,
    })
}

fn sanitize_headers(headers: &Headers) -> JsonValue {
    let sanitized: Vec<JsonValue> = headers
        .iter()
        .map(|(name, value)| {
            let value = if is_sensitive(name) { REDACTED } else { value };
            json!([name, value])
        })
        .collect();
    JsonValue::Array(sanitized)
}

fn is_sensitive(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "authorization" | "x-api-key" | "x-goog-api-key" | "cookie" | "proxy-authorization"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Channel;

    #[test]
    fn sensitive_headers_are_redacted() {
        let headers: Headers = vec![
            ("Authorization".to_string(), "Bearer secret".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized[0][1], REDACTED);
        assert_eq!(sanitized[1][1], "application/json");
    }

    #[test]
    fn disabled_dumper_writes_nothing() {
        let dumper = Dumper::disabled();
        let cx = RequestContext::new(Channel::Claude, "m");
        // No dir configured: must be a no-op rather than an error.
        dumper.write_ingress(&cx, &Headers::new(), &json!({"model": "m"}));
    }

    #[test]
    fn stages_write_to_configured_directory() {
        let dir = std::env::temp_dir().join(format!("mproxy-dump-{}", uuid::Uuid::now_v7()));
        let dumper = Dumper::new(DumpConfig {
            dir: Some(dir.display().to_string()),
            ingress: true,
            transformed: false,
            response: true,
        });
        let cx = RequestContext::new(Channel::Claude, "m");
        dumper.write_ingress(&cx, &Headers::new(), &json!({"model": "m"}));
        dumper.write_transformed(&cx, &Headers::new(), &json!({"model": "m"}));
        dumper.write_response(&cx, &json!({"ok": true}));

        let entries: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|name| name.ends_with(".ingress.json")));
        assert!(entries.iter().any(|name| name.ends_with(".response.json")));
        std::fs::remove_dir_all(&dir).ok();
    }
}
