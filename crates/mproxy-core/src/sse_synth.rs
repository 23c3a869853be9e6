use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio_stream::wrappers::ReceiverStream;

use mproxy_protocol::claude::messages::{
    ContentBlock, Message, TextBlock, ThinkingBlock, ThinkingBlockType, ToolUseBlock,
};
use mproxy_protocol::claude::stream::{ContentBlockDelta, MessageDeltaBody, StreamEvent};
use mproxy_protocol::sse::SseEvent;
use mproxy_protocol::{ErrorBody, ErrorDetail};

pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Finalized message → canonical event sequence. Pure: the same message
/// always yields the same events.
pub fn synthesize_events(message: &Message) -> Vec<StreamEvent> {
    let mut events = Vec::with_capacity(message.content.len() * 3 + 3);

    let mut start_message = message.clone();
    start_message.content = Vec::new();
    start_message.stop_reason = None;
    start_message.stop_sequence = None;
    events.push(StreamEvent::MessageStart {
        message: start_message,
    });

    for (index, block) in message.content.iter().enumerate() {
        let index = index as u32;
        let (start_block, deltas) = streamify_block(block);
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: start_block,
        });
        for delta in deltas {
            events.push(StreamEvent::ContentBlockDelta { index, delta });
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    events.push(StreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason: message.stop_reason.clone(),
            stop_sequence: message.stop_sequence.clone(),
        },
        usage: message.usage.clone(),
    });
    events.push(StreamEvent::MessageStop);
    events
}

/// Each block opens empty and delivers its payload as a single delta.
fn streamify_block(block: &ContentBlock) -> (ContentBlock, Vec<ContentBlockDelta>) {
    match block {
        ContentBlock::Text(text) => {
            let start = ContentBlock::Text(TextBlock {
                text: String::new(),
                r#type: text.r#type,
                extra: serde_json::Map::new(),
            });
            let deltas = if text.text.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlockDelta::TextDelta {
                    text: text.text.clone(),
                }]
            };
            (start, deltas)
        }
        ContentBlock::Thinking(thinking) => {
            let start = ContentBlock::Thinking(ThinkingBlock {
                signature: String::new(),
                thinking: String::new(),
                r#type: ThinkingBlockType::Thinking,
            });
            let mut deltas = vec![ContentBlockDelta::ThinkingDelta {
                thinking: thinking.thinking.clone(),
            }];
            if !thinking.signature.is_empty() {
                deltas.push(ContentBlockDelta::SignatureDelta {
                    signature: thinking.signature.clone(),
                });
            }
            (start, deltas)
        }
        ContentBlock::ToolUse(tool) => {
            let start = ContentBlock::ToolUse(ToolUseBlock {
                id: tool.id.clone(),
                input: serde_json::json!({}),
                name: tool.name.clone(),
                r#type: tool.r#type,
            });
            let partial_json =
                serde_json::to_string(&tool.input).unwrap_or_else(|_| "{}".to_string());
            (
                start,
                vec![ContentBlockDelta::InputJsonDelta { partial_json }],
            )
        }
        ContentBlock::Other(value) => (ContentBlock::Other(value.clone()), Vec::new()),
    }
}

fn frame(event: &StreamEvent) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::named(event.event_name(), data)
}

pub fn ping_frame() -> Bytes {
    SseEvent::named("ping", r#"{"type":"ping"}"#).to_bytes()
}

pub fn error_frame(detail: ErrorDetail) -> Bytes {
    let body = ErrorBody {
        r#type: "error".to_string(),
        error: detail,
    };
    let data = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    SseEvent::named("error", data).to_bytes()
}

/// Byte frames for a finalized Anthropic-shaped body. An unparseable body
/// yields a single `error` frame and nothing else.
pub fn frames_for_body(body: &JsonValue) -> Vec<Bytes> {
    match serde_json::from_value::<Message>(body.clone()) {
        Ok(message) => synthesize_events(&message)
            .iter()
            .map(|event| frame(event).to_bytes())
            .collect(),
        Err(err) => vec![error_frame(ErrorDetail {
            r#type: "api_error".to_string(),
            message: format!("response could not be streamed: {err}"),
        })],
    }
}

/// Spawns the egress writer. Ping frames keep intermediaries alive while the
/// peer is slow; `ping_interval: None` disables them (tests). A closed
/// receiver stops emission immediately, terminal frame or not.
pub fn spawn_stream(body: JsonValue, ping_interval: Option<Duration>) -> ReceiverStream<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let frames = frames_for_body(&body);
        let mut ticker = ping_interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        for bytes in frames {
            match &mut ticker {
                None => {
                    if tx.send(bytes).await.is_err() {
                        return;
                    }
                }
                Some(ticker) => {
                    let mut pending = Some(bytes);
                    while let Some(frame_bytes) = pending.take() {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if tx.send(ping_frame()).await.is_err() {
                                    return;
                                }
                                pending = Some(frame_bytes);
                            }
                            permit = tx.reserve() => match permit {
                                Ok(permit) => permit.send(frame_bytes),
                                Err(_) => return,
                            },
                        }
                    }
                }
            }
        }
    });
    ReceiverStream::new(rx)
}
