use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{Headers, RequestTransformer, TransformContext, TransformError, header_set};

/// Adds one header built from `prefix + value + suffix`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AddHeader {
    pub key: String,
    pub value: String,
    pub prefix: String,
    pub suffix: String,
}

impl RequestTransformer for AddHeader {
    fn transform(
        &self,
        _payload: &mut JsonValue,
        headers: &mut Headers,
        _ctx: &mut TransformContext,
    ) -> Result<(), TransformError> {
        let value = format!("{}{}{}", self.prefix, self.value, self.suffix);
        header_set(headers, self.key.clone(), value);
        Ok(())
    }
}

/// Overrides the descriptor's operation suffix with a fixed path.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UrlPath {
    pub path: String,
}

impl RequestTransformer for UrlPath {
    fn transform(
        &self,
        _payload: &mut JsonValue,
        _headers: &mut Headers,
        ctx: &mut TransformContext,
    ) -> Result<(), TransformError> {
        let base = ctx.base_url.trim_end_matches('/');
        let path = if self.path.is_empty() || self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        ctx.url_override = Some(format!("{base}{path}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_header_applies_prefix_and_suffix() {
        let t = AddHeader {
            key: "authorization".into(),
            value: "abc".into(),
            prefix: "Bearer ".into(),
            suffix: String::new(),
        };
        let mut payload = json!({});
        let mut headers = Headers::new();
        let mut ctx = TransformContext::default();
        t.transform(&mut payload, &mut headers, &mut ctx).unwrap();
        assert_eq!(headers, vec![("authorization".to_string(), "Bearer abc".to_string())]);
    }

    #[test]
    fn url_path_strips_trailing_slash_and_prepends_missing_one() {
        let t = UrlPath {
            path: "v1/chat/completions".into(),
        };
        let mut payload = json!({});
        let mut headers = Headers::new();
        let mut ctx = TransformContext {
            base_url: "https://api.example.com/".into(),
            ..TransformContext::default()
        };
        t.transform(&mut payload, &mut headers, &mut ctx).unwrap();
        assert_eq!(
            ctx.url_override.as_deref(),
            Some("https://api.example.com/v1/chat/completions")
        );
    }
}
