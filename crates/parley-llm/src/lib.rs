pub mod assembler;
pub mod converter;
pub mod provider;
pub mod retrying;
pub mod sse;

pub mod mock;

pub use assembler::{AssembledStream, StreamAssembler};
pub use mock::{MockProvider, MockResponse};
pub use provider::AnthropicProvider;
pub use retrying::{RetryConfig, RetryingModelClient};
