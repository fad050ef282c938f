use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use rand::Rng;
use tracing::{debug, warn};

use parley_core::errors::ProviderError;
use parley_core::provider::{ModelClient, ModelProvider, ModelRequest, ProviderStream, TurnStream};
use parley_core::stream::ProviderDelta;

use crate::assembler::AssembledStream;

/// Backoff settings for [`RetryingModelClient`].
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
        }
    }
}

/// Wraps a [`ModelProvider`] with bounded retry and stream assembly.
///
/// - Retries transient errors with exponential backoff + jitter
/// - Respects `retry_after` hints from rate limit responses
/// - A transient error that arrives on the stream before any content delta
///   counts as a failed call and is retried the same way
/// - Once content has been observed the stream is committed; later failures
///   surface as `StreamError` and are never retried here
pub struct RetryingModelClient<P: ModelProvider> {
    inner: P,
    config: RetryConfig,
    total_retries: Arc<AtomicU64>,
}

impl<P: ModelProvider> RetryingModelClient<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Delay before retry number `retry` (0-based).
    fn retry_delay(&self, retry: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(retry.min(30) as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    async fn attempt(&self, request: &ModelRequest) -> Result<TurnStream, ProviderError> {
        let mut stream = self.inner.stream_turn(request).await?;
        let buffered = prime(&mut stream).await?;
        Ok(Box::pin(AssembledStream::new(stream::iter(buffered).chain(stream))))
    }
}

/// Read ahead until the first content delta. Anything before it is buffered
/// for replay; an error before it fails the attempt.
async fn prime(stream: &mut ProviderStream) -> Result<Vec<ProviderDelta>, ProviderError> {
    let mut buffered = Vec::new();
    while let Some(delta) = stream.next().await {
        match delta {
            ProviderDelta::Error { error } => return Err(error),
            d if d.is_content() || d == ProviderDelta::MessageStop => {
                buffered.push(d);
                return Ok(buffered);
            }
            d => buffered.push(d),
        }
    }
    Err(ProviderError::StreamInterrupted("stream ended before any output".into()))
}

#[async_trait]
impl<P: ModelProvider> ModelClient for RetryingModelClient<P> {
    async fn stream_turn(&self, request: &ModelRequest) -> Result<TurnStream, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let error = match self.attempt(request).await {
                Ok(stream) => {
                    debug!(attempt, provider = self.inner.name(), "model stream opened");
                    return Ok(stream);
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                return Err(error);
            }
            if attempt >= self.config.max_attempts {
                warn!(attempts = attempt, error = %error, "retries exhausted");
                return Err(error);
            }

            let delay = self.retry_delay(attempt - 1, error.suggested_delay());
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after error"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, MockResponse};
    use parley_core::provider::StreamOptions;
    use parley_core::stream::StreamEvent;
    use parley_core::tokens::TokenUsage;

    fn request() -> ModelRequest {
        ModelRequest {
            system_prompt: None,
            turns: Vec::new(),
            tools: Vec::new(),
            options: StreamOptions::default(),
        }
    }

    fn server_error() -> ProviderError {
        ProviderError::ServerError { status: 500, body: "internal".into() }
    }

    async fn drain(stream: TurnStream) -> Vec<StreamEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let client = RetryingModelClient::with_defaults(MockProvider::new(vec![MockResponse::text("hello")]));
        let events = drain(client.stream_turn(&request()).await.unwrap()).await;
        assert!(matches!(events.last(), Some(StreamEvent::TurnComplete { .. })));
        assert_eq!(client.total_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() {
        let client = RetryingModelClient::with_defaults(MockProvider::new(vec![
            MockResponse::Error(server_error()),
            MockResponse::Error(ProviderError::Overloaded),
            MockResponse::text("recovered").with_usage(40, 7),
        ]));
        let events = drain(client.stream_turn(&request()).await.unwrap()).await;
        assert_eq!(client.total_retries(), 2);
        assert_eq!(client.inner().call_count(), 3);

        let turns: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TurnComplete { turn } => Some(turn),
                _ => None,
            })
            .collect();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].usage, TokenUsage::new(40, 7));
    }

    #[tokio::test(start_paused = true)]
    async fn error_before_content_is_retried() {
        let client = RetryingModelClient::with_defaults(MockProvider::new(vec![
            MockResponse::stream_error(ProviderError::Overloaded),
            MockResponse::text("ok"),
        ]));
        let events = drain(client.stream_turn(&request()).await.unwrap()).await;
        assert_eq!(client.total_retries(), 1);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::StreamError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_is_retried() {
        let client = RetryingModelClient::with_defaults(MockProvider::new(vec![
            MockResponse::Stream(Vec::new()),
            MockResponse::text("ok"),
        ]));
        assert!(client.stream_turn(&request()).await.is_ok());
        assert_eq!(client.total_retries(), 1);
    }

    #[tokio::test]
    async fn fatal_error_not_retried() {
        let client = RetryingModelClient::with_defaults(MockProvider::new(vec![
            MockResponse::Error(ProviderError::AuthenticationFailed("bad key".into())),
            MockResponse::text("should not reach"),
        ]));
        let err = client.stream_turn(&request()).await.err().expect("expected error");
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
        assert_eq!(client.total_retries(), 0);
        assert_eq!(client.inner().call_count(), 1);
    }

    #[tokio::test]
    async fn fatal_first_frame_not_retried() {
        let client = RetryingModelClient::with_defaults(MockProvider::new(vec![
            MockResponse::stream_error(ProviderError::InvalidRequest("bad".into())),
            MockResponse::text("should not reach"),
        ]));
        assert!(client.stream_turn(&request()).await.is_err());
        assert_eq!(client.inner().call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_exhausted() {
        let responses = (0..6).map(|_| MockResponse::Error(server_error())).collect();
        let client = RetryingModelClient::with_defaults(MockProvider::new(responses));
        let err = client.stream_turn(&request()).await.err().expect("expected error");
        assert!(err.is_transient());
        assert_eq!(client.inner().call_count(), 5);
        assert_eq!(client.total_retries(), 4);
    }

    #[tokio::test]
    async fn failure_after_content_is_not_retried() {
        let client = RetryingModelClient::with_defaults(MockProvider::new(vec![
            MockResponse::text_then_error("partial", ProviderError::Network("reset".into())),
            MockResponse::text("should not reach"),
        ]));
        let events = drain(client.stream_turn(&request()).await.unwrap()).await;
        assert_eq!(events[0], StreamEvent::TextDelta { text: "partial".into() });
        assert!(matches!(events[1], StreamEvent::StreamError { .. }));
        assert_eq!(client.inner().call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_is_respected() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let client = RetryingModelClient::new(
            MockProvider::new(vec![
                MockResponse::Error(ProviderError::RateLimited {
                    retry_after: Some(Duration::from_secs(7)),
                }),
                MockResponse::text("ok"),
            ]),
            config,
        );
        let start = tokio::time::Instant::now();
        client.stream_turn(&request()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[test]
    fn retry_delay_exponential_backoff() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let client = RetryingModelClient::new(MockProvider::new(vec![]), config);
        assert_eq!(client.retry_delay(0, None).as_millis(), 100);
        assert_eq!(client.retry_delay(1, None).as_millis(), 200);
        assert_eq!(client.retry_delay(2, None).as_millis(), 400);
    }

    #[test]
    fn retry_delay_capped_at_max() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..Default::default()
        };
        let client = RetryingModelClient::new(MockProvider::new(vec![]), config);
        assert_eq!(client.retry_delay(10, None), Duration::from_secs(60));
    }

    #[test]
    fn retry_delay_jitter_stays_in_range() {
        let client = RetryingModelClient::with_defaults(MockProvider::new(vec![]));
        for _ in 0..100 {
            let ms = client.retry_delay(0, None).as_millis();
            assert!((3200..=4800).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay, Duration::from_secs(4));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert!((config.jitter_factor - 0.2).abs() < f64::EPSILON);
    }
}
