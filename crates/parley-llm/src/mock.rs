use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use parley_core::errors::ProviderError;
use parley_core::ids::ToolCallId;
use parley_core::provider::{ModelProvider, ModelRequest, ProviderStream};
use parley_core::stream::ProviderDelta;
use parley_core::tokens::TokenUsage;
use parley_core::transcript::StopReason;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of provider deltas.
    Stream(Vec<ProviderDelta>),
    /// Return an error from `stream_turn` itself.
    Error(ProviderError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield the deltas, then never finish.
    Hang(Vec<ProviderDelta>),
}

impl MockResponse {
    /// A complete text-only turn.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![
            ProviderDelta::MessageStart { usage: TokenUsage::new(10, 1) },
            ProviderDelta::TextDelta { index: 0, text: text.to_string() },
            ProviderDelta::BlockStop { index: 0 },
            ProviderDelta::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                output_tokens: Some(5),
            },
            ProviderDelta::MessageStop,
        ])
    }

    /// A turn containing a single tool call. The argument JSON is delivered in
    /// two fragments.
    pub fn tool_use(call_id: &str, tool_name: &str, arguments: Value) -> Self {
        Self::tool_uses(&[(call_id, tool_name, arguments)])
    }

    /// A turn with a short text preamble followed by one or more tool calls.
    pub fn tool_uses(calls: &[(&str, &str, Value)]) -> Self {
        let mut deltas = vec![
            ProviderDelta::MessageStart { usage: TokenUsage::new(10, 1) },
            ProviderDelta::TextDelta { index: 0, text: "Running a tool.".into() },
            ProviderDelta::BlockStop { index: 0 },
        ];
        for (i, (call_id, tool_name, arguments)) in calls.iter().enumerate() {
            let index = i + 1;
            let json = arguments.to_string();
            let mut mid = json.len() / 2;
            while !json.is_char_boundary(mid) {
                mid -= 1;
            }
            deltas.push(ProviderDelta::ToolCallStart {
                index,
                call_id: ToolCallId::from_raw(*call_id),
                tool_name: tool_name.to_string(),
            });
            deltas.push(ProviderDelta::ToolArgsDelta { index, partial_json: json[..mid].to_string() });
            deltas.push(ProviderDelta::ToolArgsDelta { index, partial_json: json[mid..].to_string() });
            deltas.push(ProviderDelta::BlockStop { index });
        }
        deltas.push(ProviderDelta::MessageDelta {
            stop_reason: Some(StopReason::ToolUse),
            output_tokens: Some(5),
        });
        deltas.push(ProviderDelta::MessageStop);
        Self::Stream(deltas)
    }

    /// Emit some text, then stall forever (for disconnect and cancellation tests).
    pub fn text_then_hang(text: &str) -> Self {
        Self::Hang(vec![
            ProviderDelta::MessageStart { usage: TokenUsage::new(10, 1) },
            ProviderDelta::TextDelta { index: 0, text: text.to_string() },
        ])
    }

    /// A stream whose first frame after message start is an error.
    pub fn stream_error(error: ProviderError) -> Self {
        Self::Stream(vec![
            ProviderDelta::MessageStart { usage: TokenUsage::default() },
            ProviderDelta::Error { error },
        ])
    }

    /// A stream that fails after some text has been emitted.
    pub fn text_then_error(text: &str, error: ProviderError) -> Self {
        Self::Stream(vec![
            ProviderDelta::MessageStart { usage: TokenUsage::new(10, 1) },
            ProviderDelta::TextDelta { index: 0, text: text.to_string() },
            ProviderDelta::Error { error },
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// Override the usage reported by a scripted stream.
    pub fn with_usage(self, input_tokens: u32, output_tokens: u32) -> Self {
        let rewrite = |deltas: Vec<ProviderDelta>| -> Vec<ProviderDelta> {
            deltas
                .into_iter()
                .map(|d| match d {
                    ProviderDelta::MessageStart { .. } => ProviderDelta::MessageStart {
                        usage: TokenUsage::new(input_tokens, 0),
                    },
                    ProviderDelta::MessageDelta { stop_reason, .. } => ProviderDelta::MessageDelta {
                        stop_reason,
                        output_tokens: Some(output_tokens),
                    },
                    other => other,
                })
                .collect()
        };
        match self {
            Self::Stream(deltas) => Self::Stream(rewrite(deltas)),
            Self::Hang(deltas) => Self::Hang(rewrite(deltas)),
            Self::Delay(d, inner) => Self::Delay(d, Box::new(inner.with_usage(input_tokens, output_tokens))),
            other => other,
        }
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every request it receives.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Queue another response behind the scripted ones.
    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream_turn(&self, request: &ModelRequest) -> Result<ProviderStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let Some(response) = self.responses.lock().pop_front() else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };
        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
async fn resolve_response(response: MockResponse) -> Result<ProviderStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(deltas) => return Ok(Box::pin(stream::iter(deltas))),
            MockResponse::Hang(deltas) => {
                return Ok(Box::pin(stream::iter(deltas).chain(stream::pending())));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
