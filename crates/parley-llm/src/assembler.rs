use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;
use serde_json::{Map, Value};

use parley_core::errors::ProviderError;
use parley_core::ids::ToolCallId;
use parley_core::stream::{ProviderDelta, StreamEvent};
use parley_core::tokens::TokenUsage;
use parley_core::transcript::{AssistantTurn, Segment, StopReason, ToolCallSegment};

enum Block {
    Text(String),
    Thinking {
        text: String,
        signature: Option<String>,
    },
    ToolCall {
        call_id: ToolCallId,
        tool_name: String,
        json: String,
        arguments: Option<Value>,
    },
}

/// Folds provider deltas into ordered [`StreamEvent`]s.
///
/// Text and thinking are forwarded as they arrive. Tool-call argument JSON is
/// buffered per block index and released exactly once, when the block stops
/// (or at message stop for blocks the provider never closed).
#[derive(Default)]
pub struct StreamAssembler {
    blocks: BTreeMap<usize, Block>,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, delta: ProviderDelta) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        if let Err(error) = self.apply(delta, &mut out) {
            self.finished = true;
            out.push(StreamEvent::StreamError { error });
        }
        out
    }

    /// Called when the provider stream ends. A stream that stops without a
    /// message stop is truncated.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(StreamEvent::StreamError {
            error: ProviderError::StreamInterrupted("stream ended before message_stop".into()),
        })
    }

    fn apply(&mut self, delta: ProviderDelta, out: &mut Vec<StreamEvent>) -> Result<(), ProviderError> {
        match delta {
            ProviderDelta::MessageStart { usage } => {
                self.usage = usage;
            }

            ProviderDelta::TextDelta { index, text } => {
                match self.blocks.entry(index).or_insert_with(|| Block::Text(String::new())) {
                    Block::Text(buf) => buf.push_str(&text),
                    _ => return Err(mismatch(index, "text")),
                }
                if !text.is_empty() {
                    out.push(StreamEvent::TextDelta { text });
                }
            }

            ProviderDelta::ThinkingDelta { index, text } => {
                let block = self.blocks.entry(index).or_insert_with(|| Block::Thinking {
                    text: String::new(),
                    signature: None,
                });
                match block {
                    Block::Thinking { text: buf, .. } => buf.push_str(&text),
                    _ => return Err(mismatch(index, "thinking")),
                }
                if !text.is_empty() {
                    out.push(StreamEvent::ThinkingDelta { text });
                }
            }

            ProviderDelta::SignatureDelta { index, signature: sig } => {
                if let Some(Block::Thinking { signature, .. }) = self.blocks.get_mut(&index) {
                    signature.get_or_insert_with(String::new).push_str(&sig);
                }
            }

            ProviderDelta::ToolCallStart { index, call_id, tool_name } => {
                if self.blocks.contains_key(&index) {
                    return Err(ProviderError::MalformedStream(format!(
                        "tool call started on occupied block {index}"
                    )));
                }
                if call_id.as_str().is_empty() || tool_name.is_empty() {
                    return Err(ProviderError::MalformedStream(format!(
                        "tool call at block {index} has no id or name"
                    )));
                }
                out.push(StreamEvent::ToolCallAnnounced {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                });
                self.blocks.insert(
                    index,
                    Block::ToolCall {
                        call_id,
                        tool_name,
                        json: String::new(),
                        arguments: None,
                    },
                );
            }

            ProviderDelta::ToolArgsDelta { index, partial_json } => match self.blocks.get_mut(&index) {
                Some(Block::ToolCall { json, arguments: None, .. }) => json.push_str(&partial_json),
                _ => return Err(mismatch(index, "tool arguments")),
            },

            ProviderDelta::BlockStop { index } => {
                if let Some(event) = self.complete_tool_call(index)? {
                    out.push(event);
                }
            }

            ProviderDelta::MessageDelta { stop_reason, output_tokens } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if let Some(n) = output_tokens {
                    self.usage.output_tokens = n;
                }
            }

            ProviderDelta::MessageStop => {
                let open: Vec<usize> = self.blocks.keys().copied().collect();
                for index in open {
                    if let Some(event) = self.complete_tool_call(index)? {
                        out.push(event);
                    }
                }
                self.finished = true;
                out.push(StreamEvent::TurnComplete { turn: self.build_turn() });
            }

            ProviderDelta::Error { error } => return Err(error),
        }
        Ok(())
    }

    /// Parse the buffered arguments of the tool call at `index`, if it has
    /// not been completed yet.
    fn complete_tool_call(&mut self, index: usize) -> Result<Option<StreamEvent>, ProviderError> {
        let Some(Block::ToolCall {
            call_id,
            tool_name,
            json,
            arguments,
        }) = self.blocks.get_mut(&index)
        else {
            return Ok(None);
        };
        if arguments.is_some() {
            return Ok(None);
        }
        let parsed = parse_arguments(json).map_err(|reason| {
            ProviderError::MalformedStream(format!("tool call {call_id}: {reason}"))
        })?;
        *arguments = Some(parsed.clone());
        Ok(Some(StreamEvent::ToolCallArgsComplete {
            call: ToolCallSegment {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                arguments: parsed,
            },
        }))
    }

    fn build_turn(&mut self) -> AssistantTurn {
        let mut segments = Vec::new();
        for block in std::mem::take(&mut self.blocks).into_values() {
            match block {
                Block::Text(text) if !text.is_empty() => segments.push(Segment::Text { text }),
                Block::Text(_) => {}
                Block::Thinking { text, signature } => {
                    segments.push(Segment::Thinking { text, signature });
                }
                Block::ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                    ..
                } => segments.push(Segment::ToolCall(ToolCallSegment {
                    call_id,
                    tool_name,
                    arguments: arguments.unwrap_or_else(|| Value::Object(Map::new())),
                })),
            }
        }

        let has_calls = segments.iter().any(|s| matches!(s, Segment::ToolCall(_)));
        let stop_reason = self.stop_reason.take().unwrap_or(if has_calls {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });

        let mut turn = AssistantTurn::new(segments);
        turn.stop_reason = Some(stop_reason);
        turn.usage = self.usage.clone();
        turn
    }
}

fn parse_arguments(json: &str) -> Result<Value, String> {
    if json.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_str::<Value>(json) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(other) => Err(format!("arguments are not a JSON object: {other}")),
        Err(e) => Err(format!("incomplete arguments: {e}")),
    }
}

fn mismatch(index: usize, what: &str) -> ProviderError {
    ProviderError::MalformedStream(format!("unexpected {what} delta for block {index}"))
}

pin_project! {
    /// Stream adapter running a [`StreamAssembler`] over provider deltas.
    pub struct AssembledStream<S> {
        #[pin]
        inner: S,
        assembler: StreamAssembler,
        pending: VecDeque<StreamEvent>,
    }
}

impl<S> AssembledStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            assembler: StreamAssembler::new(),
            pending: VecDeque::new(),
        }
    }
}

impl<S: Stream<Item = ProviderDelta>> Stream for AssembledStream<S> {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if this.assembler.is_finished() {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(delta)) => this.pending.extend(this.assembler.push(delta)),
                Poll::Ready(None) => match this.assembler.finish() {
                    Some(event) => this.pending.push_back(event),
                    None => return Poll::Ready(None),
                },
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn tool_start(index: usize, id: &str) -> ProviderDelta {
        ProviderDelta::ToolCallStart {
            index,
            call_id: ToolCallId::from_raw(id),
            tool_name: "bash".into(),
        }
    }

    fn args(index: usize, s: &str) -> ProviderDelta {
        ProviderDelta::ToolArgsDelta { index, partial_json: s.into() }
    }

    async fn collect(deltas: Vec<ProviderDelta>) -> Vec<StreamEvent> {
        AssembledStream::new(futures::stream::iter(deltas)).collect().await
    }

    #[tokio::test]
    async fn text_is_flushed_per_chunk() {
        let events = collect(vec![
            ProviderDelta::MessageStart { usage: TokenUsage::new(10, 1) },
            ProviderDelta::TextDelta { index: 0, text: "Hel".into() },
            ProviderDelta::TextDelta { index: 0, text: "lo".into() },
            ProviderDelta::BlockStop { index: 0 },
            ProviderDelta::MessageDelta { stop_reason: Some(StopReason::EndTurn), output_tokens: Some(5) },
            ProviderDelta::MessageStop,
        ])
        .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::TextDelta { text: "Hel".into() });
        assert_eq!(events[1], StreamEvent::TextDelta { text: "lo".into() });
        let StreamEvent::TurnComplete { turn } = &events[2] else {
            panic!("expected TurnComplete, got {:?}", events[2]);
        };
        assert_eq!(turn.visible_text(), "Hello");
        assert_eq!(turn.usage, TokenUsage::new(10, 5));
        assert_eq!(turn.stop_reason, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn tool_args_buffered_until_block_stop() {
        let events = collect(vec![
            ProviderDelta::TextDelta { index: 0, text: "Listing.".into() },
            tool_start(1, "c1"),
            args(1, r#"{"comm"#),
            args(1, r#"and": "ls"}"#),
            ProviderDelta::BlockStop { index: 1 },
            ProviderDelta::MessageStop,
        ])
        .await;

        assert!(matches!(events[0], StreamEvent::TextDelta { .. }));
        assert!(matches!(events[1], StreamEvent::ToolCallAnnounced { .. }));
        assert_eq!(
            events[2],
            StreamEvent::ToolCallArgsComplete {
                call: ToolCallSegment {
                    call_id: ToolCallId::from_raw("c1"),
                    tool_name: "bash".into(),
                    arguments: json!({"command": "ls"}),
                }
            }
        );
        let StreamEvent::TurnComplete { turn } = &events[3] else {
            panic!("expected TurnComplete");
        };
        assert_eq!(turn.tool_calls().count(), 1);
        assert_eq!(turn.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn args_complete_emitted_once_when_block_never_stops() {
        let events = collect(vec![
            tool_start(0, "c1"),
            args(0, r#"{"command": "pwd"}"#),
            ProviderDelta::MessageStop,
        ])
        .await;
        let completes = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolCallArgsComplete { .. }))
            .count();
        assert_eq!(completes, 1);
    }

    #[tokio::test]
    async fn empty_args_become_empty_object() {
        let events = collect(vec![tool_start(0, "c1"), ProviderDelta::BlockStop { index: 0 }]).await;
        assert!(matches!(
            &events[1],
            StreamEvent::ToolCallArgsComplete { call } if call.arguments == json!({})
        ));
    }

    #[tokio::test]
    async fn truncated_args_are_malformed() {
        let events = collect(vec![
            tool_start(0, "c1"),
            args(0, r#"{"command": "l"#),
            ProviderDelta::BlockStop { index: 0 },
            ProviderDelta::MessageStop,
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            StreamEvent::StreamError { error: ProviderError::MalformedStream(_) }
        ));
    }

    #[tokio::test]
    async fn non_object_args_are_malformed() {
        let events = collect(vec![tool_start(0, "c1"), args(0, "[1,2]"), ProviderDelta::MessageStop]).await;
        assert!(matches!(events.last(), Some(StreamEvent::StreamError { .. })));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::ToolCallArgsComplete { .. })));
    }

    #[tokio::test]
    async fn stream_without_stop_is_interrupted() {
        let events = collect(vec![ProviderDelta::TextDelta { index: 0, text: "par".into() }]).await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::StreamError {
                error: ProviderError::StreamInterrupted("stream ended before message_stop".into())
            })
        );
    }

    #[tokio::test]
    async fn nothing_after_error() {
        let events = collect(vec![
            ProviderDelta::TextDelta { index: 0, text: "a".into() },
            ProviderDelta::Error { error: ProviderError::Overloaded },
            ProviderDelta::TextDelta { index: 0, text: "b".into() },
            ProviderDelta::MessageStop,
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::StreamError { error: ProviderError::Overloaded });
    }

    #[test]
    fn segments_follow_block_index() {
        let mut asm = StreamAssembler::new();
        asm.push(ProviderDelta::ThinkingDelta { index: 0, text: "think".into() });
        asm.push(ProviderDelta::SignatureDelta { index: 0, signature: "sig".into() });
        asm.push(ProviderDelta::TextDelta { index: 1, text: "answer".into() });
        let out = asm.push(ProviderDelta::MessageStop);
        let StreamEvent::TurnComplete { turn } = &out[0] else {
            panic!("expected TurnComplete");
        };
        assert_eq!(
            turn.segments,
            vec![
                Segment::Thinking { text: "think".into(), signature: Some("sig".into()) },
                Segment::Text { text: "answer".into() },
            ]
        );
    }

    #[test]
    fn duplicate_tool_start_is_malformed() {
        let mut asm = StreamAssembler::new();
        asm.push(tool_start(0, "c1"));
        let out = asm.push(tool_start(0, "c2"));
        assert!(matches!(&out[0], StreamEvent::StreamError { .. }));
        assert!(asm.is_finished());
        assert!(asm.finish().is_none());
    }
}
