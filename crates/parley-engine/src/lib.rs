pub mod actor;
pub mod engine;
pub mod error;
pub mod registry;
pub mod tools;
pub mod truncate;

pub use actor::SessionHandle;
pub use engine::{EngineConfig, EngineDeps, EngineSnapshot, SessionEngine, SessionState};
pub use error::EngineError;
pub use registry::SessionRegistry;
pub use tools::{create_default_registry, ToolRegistry};
