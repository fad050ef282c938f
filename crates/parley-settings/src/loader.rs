//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ParleySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PARLEY_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ParleySettings;

/// `~/.parley`, or `/tmp/.parley` when `HOME` is unset.
pub fn parley_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

pub fn settings_path() -> PathBuf {
    parley_home().join("settings.json")
}

/// Load from the default path with env overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides. A missing file means defaults;
/// malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursive merge: objects merge per key, everything else is replaced by
/// `source`, and nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut ParleySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from any variable source. Invalid values are logged and
/// ignored.
pub fn apply_overrides(settings: &mut ParleySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("PARLEY_PORT") {
        match parse_u64_range(&v, 1, u64::from(u16::MAX)) {
            Some(port) => settings.server.port = port as u16,
            None => warn!(key = "PARLEY_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = read("PARLEY_AUTO_CONFIRM") {
        match parse_bool(&v) {
            Some(b) => settings.session.auto_confirm = b,
            None => warn!(key = "PARLEY_AUTO_CONFIRM", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("PARLEY_DB_PATH") {
        settings.storage.database_path = Some(PathBuf::from(v));
    }
    if let Some(v) = read("PARLEY_IDLE_TIMEOUT_SECS") {
        match parse_u64_range(&v, 1, 7 * 24 * 3600) {
            Some(secs) => settings.session.idle_timeout_secs = secs,
            None => warn!(key = "PARLEY_IDLE_TIMEOUT_SECS", value = %v, "invalid integer env var, ignoring"),
        }
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
