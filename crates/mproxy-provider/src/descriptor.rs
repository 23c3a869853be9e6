use serde::{Deserialize, Serialize};

/// Ingress dialect family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Claude,
    Codex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Messages,
    CountTokens,
    Responses,
}

/// Upstream wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "openai-responses")]
    OpenAIResponses,
    #[serde(rename = "gemini")]
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAI => "openai",
            ProviderKind::OpenAIResponses => "openai-responses",
            ProviderKind::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_tools: bool,
    pub supports_thinking: bool,
    pub supports_builtin_web_search: bool,
    pub supports_count_tokens: bool,
    pub accepts_system_as_top_level: bool,
}

/// One (channel, operation) cell of a descriptor: the URL suffix plus the
/// shape-correctness baseline for each transformer stage.
#[derive(Debug, Clone, Copy)]
pub struct OperationSpec {
    pub suffix: &'static str,
    pub default_request: &'static [&'static str],
    pub default_response: &'static [&'static str],
    pub default_stream: &'static [&'static str],
}

/// Static per-kind template. Never contains absolute URLs; the upstream URL
/// is the provider's configured base_url plus the operation suffix.
#[derive(Debug, Clone, Copy)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub capabilities: Capabilities,
    operations: &'static [(Channel, OperationKind, OperationSpec)],
}

impl ProviderDescriptor {
    pub fn operation(&self, channel: Channel, op: OperationKind) -> Option<&'static OperationSpec> {
        self.operations
            .iter()
            .find(|(c, o, _)| *c == channel && *o == op)
            .map(|(_, _, spec)| spec)
    }

    pub fn supports(&self, channel: Channel, op: OperationKind) -> bool {
        self.operation(channel, op).is_some()
    }

    pub fn operations(&self) -> impl Iterator<Item = (Channel, OperationKind)> + '_ {
        self.operations.iter().map(|(c, o, _)| (*c, *o))
    }
}

static ANTHROPIC: ProviderDescriptor = ProviderDescriptor {
    kind: ProviderKind::Anthropic,
    capabilities: Capabilities {
        supports_tools: true,
        supports_thinking: true,
        supports_builtin_web_search: true,
        supports_count_tokens: true,
        accepts_system_as_top_level: true,
    },
    operations: &[
        (
            Channel::Claude,
            OperationKind::Messages,
            OperationSpec {
                suffix: "/v1/messages",
                default_request: &[
                    "builtin.anthropic.HeaderInject",
                    "builtin.anthropic.SystemCleaner",
                    "builtin.anthropic.CacheBreakpoints",
                ],
                default_response: &["builtin.anthropic.Passthrough"],
                default_stream: &[],
            },
        ),
        (
            Channel::Claude,
            OperationKind::CountTokens,
            OperationSpec {
                suffix: "/v1/messages/count_tokens",
                default_request: &["builtin.anthropic.HeaderInject"],
                default_response: &["builtin.anthropic.Passthrough"],
                default_stream: &[],
            },
        ),
    ],
};

static OPENAI: ProviderDescriptor = ProviderDescriptor {
    kind: ProviderKind::OpenAI,
    capabilities: Capabilities {
        supports_tools: true,
        supports_thinking: true,
        supports_builtin_web_search: true,
        supports_count_tokens: false,
        accepts_system_as_top_level: false,
    },
    operations: &[(
        Channel::Claude,
        OperationKind::Messages,
        OperationSpec {
            suffix: "/v1/chat/completions",
            default_request: &["builtin.openai.BearerAuth", "builtin.openai.ChatRequest"],
            default_response: &["builtin.openai.ChatResponse"],
            default_stream: &[],
        },
    )],
};

static OPENAI_RESPONSES: ProviderDescriptor = ProviderDescriptor {
    kind: ProviderKind::OpenAIResponses,
    capabilities: Capabilities {
        supports_tools: true,
        supports_thinking: true,
        supports_builtin_web_search: true,
        supports_count_tokens: false,
        accepts_system_as_top_level: false,
    },
    operations: &[
        (
            Channel::Claude,
            OperationKind::Messages,
            OperationSpec {
                suffix: "/v1/responses",
                default_request: &[
                    "builtin.openai.BearerAuth",
                    "builtin.responses.Request",
                ],
                default_response: &["builtin.responses.Response"],
                default_stream: &[],
            },
        ),
        (
            Channel::Codex,
            OperationKind::Responses,
            OperationSpec {
                suffix: "/v1/responses",
                default_request: &["builtin.openai.BearerAuth"],
                default_response: &[],
                default_stream: &[],
            },
        ),
    ],
};

static GEMINI: ProviderDescriptor = ProviderDescriptor {
    kind: ProviderKind::Gemini,
    capabilities: Capabilities {
        supports_tools: true,
        supports_thinking: false,
        supports_builtin_web_search: false,
        supports_count_tokens: true,
        accepts_system_as_top_level: true,
    },
    operations: &[
        (
            Channel::Claude,
            OperationKind::Messages,
            OperationSpec {
                suffix: "/v1beta/models/{model}:generateContent",
                default_request: &[
                    "builtin.gemini.QueryKeyAuth",
                    "builtin.gemini.GenerateContentRequest",
                ],
                default_response: &["builtin.gemini.GenerateContentResponse"],
                default_stream: &[],
            },
        ),
        (
            Channel::Claude,
            OperationKind::CountTokens,
            OperationSpec {
                suffix: "/v1beta/models/{model}:countTokens",
                default_request: &[
                    "builtin.gemini.QueryKeyAuth",
                    "builtin.gemini.CountTokensRequest",
                ],
                default_response: &["builtin.gemini.CountTokensResponse"],
                default_stream: &[],
            },
        ),
    ],
};

pub fn descriptor(kind: ProviderKind) -> &'static ProviderDescriptor {
    match kind {
        ProviderKind::Anthropic => &ANTHROPIC,
        ProviderKind::OpenAI => &OPENAI,
        ProviderKind::OpenAIResponses => &OPENAI_RESPONSES,
        ProviderKind::Gemini => &GEMINI,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_claude_messages_operation() {
        for kind in [
            ProviderKind::Anthropic,
            ProviderKind::OpenAI,
            ProviderKind::OpenAIResponses,
            ProviderKind::Gemini,
        ] {
            let spec = descriptor(kind)
                .operation(Channel::Claude, OperationKind::Messages)
                .unwrap();
            assert!(!spec.suffix.is_empty());
            assert!(!spec.default_request.is_empty());
        }
    }

    #[test]
    fn count_tokens_follows_capability_flag() {
        for kind in [
            ProviderKind::Anthropic,
            ProviderKind::OpenAI,
            ProviderKind::OpenAIResponses,
            ProviderKind::Gemini,
        ] {
            let d = descriptor(kind);
            assert_eq!(
                d.supports(Channel::Claude, OperationKind::CountTokens),
                d.capabilities.supports_count_tokens,
            );
        }
    }

    #[test]
    fn only_responses_kind_serves_the_codex_channel() {
        assert!(descriptor(ProviderKind::OpenAIResponses)
            .supports(Channel::Codex, OperationKind::Responses));
        assert!(!descriptor(ProviderKind::Anthropic).supports(Channel::Codex, OperationKind::Responses));
        assert!(!descriptor(ProviderKind::OpenAI).supports(Channel::Codex, OperationKind::Responses));
    }

    #[test]
    fn kind_names_round_trip_through_serde() {
        for (kind, name) in [
            (ProviderKind::Anthropic, "\"anthropic\""),
            (ProviderKind::OpenAI, "\"openai\""),
            (ProviderKind::OpenAIResponses, "\"openai-responses\""),
            (ProviderKind::Gemini, "\"gemini\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), name);
            assert_eq!(
                serde_json::from_str::<ProviderKind>(name).unwrap(),
                kind
            );
        }
    }
}
