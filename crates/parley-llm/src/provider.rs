use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use parley_core::errors::ProviderError;
use parley_core::provider::{ModelProvider, ModelRequest, ProviderStream};
use parley_core::stream::ProviderDelta;

use crate::converter;
use crate::sse;

pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Anthropic Messages API over server-sent events.
pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
    model: String,
    api_url: String,
    idle_timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: Option<&str>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            idle_timeout: SSE_IDLE_TIMEOUT,
        })
    }

    /// Point the provider at a different endpoint (proxies, tests).
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model, turns = request.turns.len()))]
    async fn stream_turn(&self, request: &ModelRequest) -> Result<ProviderStream, ProviderError> {
        let body = converter::build_request_body(request, &self.model);

        let resp = self
            .client
            .post(&self.api_url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("accept", "text/event-stream")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(CONNECT_TIMEOUT)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let hint = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            debug!(status, "provider returned error status");
            return Err(match ProviderError::from_status(status, body) {
                ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after: hint },
                other => other,
            });
        }

        Ok(Box::pin(SseStream::with_idle_timeout(resp.bytes_stream(), self.idle_timeout)))
    }
}

/// Wraps a byte stream from reqwest and yields provider deltas.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits an error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
    pending: VecDeque<ProviderDelta>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }

    /// Decode every complete event (terminated by a blank line) in the buffer.
    fn drain_events(&mut self, flush: bool) {
        loop {
            let end = find_event_end(&self.buffer);
            let chunk: Vec<u8> = match end {
                Some(pos) => self.buffer.drain(..pos).collect(),
                None if flush && !self.buffer.is_empty() => std::mem::take(&mut self.buffer),
                None => return,
            };
            let text = String::from_utf8_lossy(&chunk).replace("\r\n", "\n");
            for (event_type, data) in sse::parse_sse_lines(&text) {
                self.pending.extend(sse::decode_event(&event_type, &data));
            }
        }
    }
}

/// Index just past the first blank-line terminator, if any.
fn find_event_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl Stream for SseStream {
    type Item = ProviderDelta;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Poll::Ready(Some(delta));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_events(false);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(ProviderDelta::Error {
                        error: ProviderError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    self.drain_events(true);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(ProviderDelta::Error {
                            error: ProviderError::Timeout(self.idle_duration),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parley_core::provider::StreamOptions;
    use parley_core::transcript::{Turn, UserTurn};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEXT_STREAM: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi there\"}}\n\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

    fn request() -> ModelRequest {
        ModelRequest {
            system_prompt: None,
            turns: vec![Turn::User(UserTurn::new("hello"))],
            tools: Vec::new(),
            options: StreamOptions::default(),
        }
    }

    fn provider(server: &MockServer) -> AnthropicProvider {
        AnthropicProvider::new(SecretString::from("test-key".to_string()), None)
            .unwrap()
            .with_api_url(format!("{}/v1/messages", server.uri()))
    }

    #[test]
    fn provider_properties() {
        let p = AnthropicProvider::new(SecretString::from("k".to_string()), Some("claude-opus-4-1-20250805")).unwrap();
        assert_eq!(p.name(), "anthropic");
        assert_eq!(p.model(), "claude-opus-4-1-20250805");
        let p = AnthropicProvider::new(SecretString::from("k".to_string()), None).unwrap();
        assert_eq!(p.model(), DEFAULT_MODEL);
    }

    #[tokio::test]
    async fn streams_deltas_from_sse_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_raw(TEXT_STREAM, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = provider(&server).stream_turn(&request()).await.unwrap();
        let deltas: Vec<ProviderDelta> = stream.collect().await;
        assert!(matches!(deltas[0], ProviderDelta::MessageStart { .. }));
        assert!(deltas.contains(&ProviderDelta::TextDelta { index: 0, text: "Hi there".into() }));
        assert_eq!(deltas.last(), Some(&ProviderDelta::MessageStop));
    }

    #[tokio::test]
    async fn status_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .mount(&server)
            .await;

        let err = provider(&server).stream_turn(&request()).await.err().expect("expected error");
        assert_eq!(err, ProviderError::RateLimited { retry_after: Some(Duration::from_secs(12)) });
    }

    #[tokio::test]
    async fn auth_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .mount(&server)
            .await;

        let err = provider(&server).stream_turn(&request()).await.err().expect("expected error");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn events_split_across_chunks() {
        let half = TEXT_STREAM.len() / 2;
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from(&TEXT_STREAM.as_bytes()[..half])),
            Ok(Bytes::from(&TEXT_STREAM.as_bytes()[half..])),
        ];
        let stream = SseStream::with_idle_timeout(futures::stream::iter(chunks), SSE_IDLE_TIMEOUT);
        let deltas: Vec<ProviderDelta> = stream.collect().await;
        assert_eq!(deltas.len(), 5);
    }

    #[tokio::test]
    async fn crlf_terminated_events() {
        let body = TEXT_STREAM.replace('\n', "\r\n");
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![Ok(Bytes::from(body))];
        let stream = SseStream::with_idle_timeout(futures::stream::iter(chunks), SSE_IDLE_TIMEOUT);
        let deltas: Vec<ProviderDelta> = stream.collect().await;
        assert_eq!(deltas.last(), Some(&ProviderDelta::MessageStop));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_when_no_data() {
        let byte_stream = futures::stream::pending::<Result<Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseStream::with_idle_timeout(byte_stream, Duration::from_secs(5)));

        let delta = stream.next().await;
        assert_eq!(
            delta,
            Some(ProviderDelta::Error { error: ProviderError::Timeout(Duration::from_secs(5)) })
        );
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn timeouts() {
        assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(30));
        assert_eq!(SSE_IDLE_TIMEOUT, Duration::from_secs(90));
    }
}
