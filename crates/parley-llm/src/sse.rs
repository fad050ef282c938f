use serde::Deserialize;
use serde_json::Value;

use parley_core::errors::ProviderError;
use parley_core::ids::ToolCallId;
use parley_core::stream::ProviderDelta;
use parley_core::tokens::TokenUsage;
use parley_core::transcript::StopReason;

/// Translate one Anthropic SSE event into provider deltas.
///
/// Decoding is stateless: block bookkeeping happens in the assembler, keyed
/// by the `index` every content event carries.
pub fn decode_event(event_type: &str, data: &str) -> Vec<ProviderDelta> {
    let mut deltas = Vec::new();

    match event_type {
        "message_start" => match serde_json::from_str::<MessageStartEvent>(data) {
            Ok(msg) => deltas.push(ProviderDelta::MessageStart {
                usage: msg.message.usage.map(UsagePayload::into_usage).unwrap_or_default(),
            }),
            Err(e) => deltas.push(malformed("message_start", &e)),
        },

        "content_block_start" => match serde_json::from_str::<ContentBlockStartEvent>(data) {
            Ok(block) => {
                let index = block.index;
                let field = |name: &str| {
                    block
                        .content_block
                        .get(name)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                match block.content_block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        let text = field("text");
                        if !text.is_empty() {
                            deltas.push(ProviderDelta::TextDelta { index, text });
                        }
                    }
                    Some("thinking") => {
                        let text = field("thinking");
                        if !text.is_empty() {
                            deltas.push(ProviderDelta::ThinkingDelta { index, text });
                        }
                    }
                    Some("tool_use") => {
                        deltas.push(ProviderDelta::ToolCallStart {
                            index,
                            call_id: ToolCallId::from_raw(field("id")),
                            tool_name: field("name"),
                        });
                    }
                    _ => {}
                }
            }
            Err(e) => deltas.push(malformed("content_block_start", &e)),
        },

        "content_block_delta" => match serde_json::from_str::<ContentBlockDeltaEvent>(data) {
            Ok(delta) => {
                let index = delta.index;
                let field = |name: &str| {
                    delta
                        .delta
                        .get(name)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                match delta.delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => deltas.push(ProviderDelta::TextDelta {
                        index,
                        text: field("text"),
                    }),
                    Some("thinking_delta") => deltas.push(ProviderDelta::ThinkingDelta {
                        index,
                        text: field("thinking"),
                    }),
                    Some("signature_delta") => deltas.push(ProviderDelta::SignatureDelta {
                        index,
                        signature: field("signature"),
                    }),
                    Some("input_json_delta") => deltas.push(ProviderDelta::ToolArgsDelta {
                        index,
                        partial_json: field("partial_json"),
                    }),
                    _ => {}
                }
            }
            Err(e) => deltas.push(malformed("content_block_delta", &e)),
        },

        "content_block_stop" => match serde_json::from_str::<ContentBlockStopEvent>(data) {
            Ok(stop) => deltas.push(ProviderDelta::BlockStop { index: stop.index }),
            Err(e) => deltas.push(malformed("content_block_stop", &e)),
        },

        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<MessageDeltaEvent>(data) {
                deltas.push(ProviderDelta::MessageDelta {
                    stop_reason: delta
                        .delta
                        .and_then(|d| d.stop_reason)
                        .as_deref()
                        .and_then(StopReason::parse),
                    output_tokens: delta.usage.and_then(|u| u.output_tokens),
                });
            }
        }

        "message_stop" => deltas.push(ProviderDelta::MessageStop),

        "error" => {
            let error = match serde_json::from_str::<ErrorEvent>(data) {
                Ok(err) => classify_error(&err.error),
                Err(_) => ProviderError::StreamInterrupted(data.to_string()),
            };
            deltas.push(ProviderDelta::Error { error });
        }

        _ => {} // ping, etc.
    }

    deltas
}

fn malformed(event_type: &str, err: &serde_json::Error) -> ProviderDelta {
    ProviderDelta::Error {
        error: ProviderError::MalformedStream(format!("{event_type}: {err}")),
    }
}

fn classify_error(err: &ErrorPayload) -> ProviderError {
    ProviderError::from_error_type(&err.error_type, err.message.clone())
}

/// Parse raw SSE text into (event_type, data) pairs. Multi-line `data:`
/// fields are joined with newlines.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data.strip_prefix(' ').unwrap_or(data));
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((std::mem::take(&mut current_event), std::mem::take(&mut current_data)));
        } else if line.is_empty() {
            current_data.clear();
        }
    }

    // Handle trailing event without blank line
    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}

// --- Deserialization types for Anthropic SSE events ---

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

impl UsagePayload {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
            cache_read_tokens: self.cache_read_input_tokens.unwrap_or(0),
            cache_creation_tokens: self.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

#[derive(Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: Value,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: Value,
}

#[derive(Deserialize)]
struct ContentBlockStopEvent {
    index: usize,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
