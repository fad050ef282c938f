use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::ProviderError;
use crate::stream::{ProviderDelta, StreamEvent};
use crate::tools::ToolDefinition;
use crate::transcript::Turn;

pub const DEFAULT_MAX_TOKENS: u32 = 64_000;
pub const DEFAULT_THINKING_BUDGET: u32 = 10_000;

/// Options controlling generation behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub thinking: ThinkingConfig,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            thinking: ThinkingConfig::Budget {
                tokens: DEFAULT_THINKING_BUDGET,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingConfig {
    Disabled,
    Budget { tokens: u32 },
}

/// Everything a provider needs to produce the next assistant turn.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: Option<String>,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDefinition>,
    pub options: StreamOptions,
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = ProviderDelta> + Send>>;
pub type TurnStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A concrete inference backend speaking its native delta protocol.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream_turn(&self, request: &ModelRequest) -> Result<ProviderStream, ProviderError>;
}

#[async_trait]
impl<P: ModelProvider + ?Sized> ModelProvider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn model(&self) -> &str {
        (**self).model()
    }

    async fn stream_turn(&self, request: &ModelRequest) -> Result<ProviderStream, ProviderError> {
        (**self).stream_turn(request).await
    }
}

/// What the session engine talks to: assembled events with retry applied.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_turn(&self, request: &ModelRequest) -> Result<TurnStream, ProviderError>;
}
