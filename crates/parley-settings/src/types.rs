use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object, stored as camelCase JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub retry: RetrySettings,
    pub session: SessionSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(SettingsError::InvalidValue("server.port must be non-zero".into()));
        }
        if self.server.heartbeat_secs == 0 {
            return Err(SettingsError::InvalidValue("server.heartbeatSecs must be non-zero".into()));
        }
        if self.server.client_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.clientTimeoutSecs must be non-zero".into(),
            ));
        }
        if self.model.max_tokens == 0 {
            return Err(SettingsError::InvalidValue("model.maxTokens must be non-zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SettingsError::InvalidValue("retry.maxAttempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(SettingsError::InvalidValue("retry.jitterFactor must be within 0..=1".into()));
        }
        if self.session.eviction_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "session.evictionIntervalSecs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per client before it is treated as dead.
    pub max_send_queue: usize,
    pub heartbeat_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_secs: 30,
            client_timeout_secs: 90,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: u32,
    /// Extended thinking budget; 0 disables thinking.
    pub thinking_budget: u32,
    pub system_prompt: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub base_url: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 64_000,
            thinking_budget: 10_000,
            system_prompt: None,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 4_000,
            max_delay_ms: 60_000,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub auto_confirm: bool,
    pub idle_timeout_secs: u64,
    pub eviction_interval_secs: u64,
    pub tool_timeout_secs: Option<u64>,
    pub max_auto_rounds: u32,
    pub working_directory: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_confirm: false,
            idle_timeout_secs: 1_800,
            eviction_interval_secs: 60,
            tool_timeout_secs: None,
            max_auto_rounds: 25,
            working_directory: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Defaults to `~/.parley/database/sessions.db`.
    pub database_path: Option<PathBuf>,
}

impl StorageSettings {
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| crate::loader::parley_home().join("database").join("sessions.db"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = ParleySettings::default();
        assert_eq!(settings.server.port, 9091);
        assert_eq!(settings.server.max_send_queue, 256);
        assert_eq!(settings.model.max_tokens, 64_000);
        assert_eq!(settings.model.thinking_budget, 10_000);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.session.max_auto_rounds, 25);
        assert!(!settings.session.auto_confirm);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(ParleySettings::default()).unwrap();
        assert_eq!(json["server"]["maxSendQueue"], 256);
        assert_eq!(json["model"]["apiKeyEnv"], "ANTHROPIC_API_KEY");
        assert_eq!(json["session"]["idleTimeoutSecs"], 1800);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: ParleySettings = serde_json::from_str(r#"{"server": {"port": 7000}}"#).unwrap();
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.retry, RetrySettings::default());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = ParleySettings::default();
        settings.retry.jitter_factor = 1.5;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));

        let mut settings = ParleySettings::default();
        settings.retry.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_heartbeat_and_timeout() {
        let mut settings = ParleySettings::default();
        settings.server.heartbeat_secs = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(m)) if m.contains("heartbeatSecs")));

        let mut settings = ParleySettings::default();
        settings.server.client_timeout_secs = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(m)) if m.contains("clientTimeoutSecs")));

        assert!(ParleySettings::default().validate().is_ok());
    }

    #[test]
    fn explicit_database_path_wins() {
        let storage = StorageSettings {
            database_path: Some(PathBuf::from("/tmp/x.db")),
        };
        assert_eq!(storage.resolved_database_path(), PathBuf::from("/tmp/x.db"));
        assert!(StorageSettings::default()
            .resolved_database_path()
            .ends_with("database/sessions.db"));
    }
}
