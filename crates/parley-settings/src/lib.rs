//! # parley-settings
//!
//! Layered configuration: compiled defaults, then `~/.parley/settings.json`
//! (deep-merged), then `PARLEY_*` environment variables.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
