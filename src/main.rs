use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use parley_core::events::SessionEvent;
use parley_core::provider::{StreamOptions, ThinkingConfig};
use parley_engine::{create_default_registry, EngineConfig, EngineDeps, SessionRegistry};
use parley_llm::{AnthropicProvider, RetryConfig, RetryingModelClient};
use parley_server::ServerConfig;
use parley_settings::ParleySettings;
use parley_store::{Database, MemorySessionStore, SessionStore, SqliteSessionStore};
use parley_telemetry::{init_telemetry, TelemetryConfig};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Session server for a tool-using chat agent")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    db_path: Option<PathBuf>,
    /// Start new sessions with auto-confirm on
    #[arg(long)]
    auto_confirm: bool,
    #[arg(long)]
    log_level: Option<String>,
    /// Keep sessions in memory only
    #[arg(long)]
    memory: bool,
}

impl Cli {
    fn apply(&self, settings: &mut ParleySettings) {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(model) = &self.model {
            settings.model.model = model.clone();
        }
        if let Some(path) = &self.db_path {
            settings.storage.database_path = Some(path.clone());
        }
        if self.auto_confirm {
            settings.session.auto_confirm = true;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => parley_settings::load_settings_from_path(path),
        None => parley_settings::load_settings(),
    }
    .context("failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("invalid settings")?;

    init_telemetry(&TelemetryConfig::from_settings(&settings.logging))
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting parley");

    let store = open_store(&settings, cli.memory)?;
    let model = build_model_client(&settings)?;

    let (events, _) = broadcast::channel::<SessionEvent>(EVENT_CHANNEL_CAPACITY);
    let deps = EngineDeps {
        model,
        tools: Arc::new(create_default_registry()),
        store,
        events,
        config: Arc::new(engine_config(&settings)?),
    };
    let sessions = Arc::new(SessionRegistry::new(deps));

    let shutdown = CancellationToken::new();
    let eviction = sessions.start_eviction_task(
        Duration::from_secs(settings.session.eviction_interval_secs),
        Duration::from_secs(settings.session.idle_timeout_secs),
        shutdown.clone(),
    );

    let server_config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_send_queue: settings.server.max_send_queue,
        heartbeat: Duration::from_secs(settings.server.heartbeat_secs),
        client_timeout: Duration::from_secs(settings.server.client_timeout_secs),
    };
    let server = parley_server::start(server_config, Arc::clone(&sessions))
        .await
        .context("failed to start server")?;
    tracing::info!(port = server.port, "parley ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    shutdown.cancel();
    server.shutdown().await;
    let _ = eviction.await;
    let stopped = sessions.shutdown_all().await;
    tracing::info!(sessions = stopped, "all sessions flushed");
    Ok(())
}

fn open_store(settings: &ParleySettings, memory: bool) -> anyhow::Result<Arc<dyn SessionStore>> {
    if memory {
        tracing::info!("using in-memory session store");
        return Ok(Arc::new(MemorySessionStore::new()));
    }
    let path = settings.storage.resolved_database_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let db = Database::open(&path).with_context(|| format!("failed to open database at {}", path.display()))?;
    tracing::info!(path = %path.display(), "database opened");
    Ok(Arc::new(SqliteSessionStore::new(db)))
}

fn build_model_client(settings: &ParleySettings) -> anyhow::Result<Arc<RetryingModelClient<AnthropicProvider>>> {
    let key_var = &settings.model.api_key_env;
    let api_key = match std::env::var(key_var) {
        Ok(key) if !key.trim().is_empty() => SecretString::from(key),
        _ => bail!("no API key found; set {key_var}"),
    };
    let mut provider = AnthropicProvider::new(api_key, Some(&settings.model.model))?;
    if let Some(url) = &settings.model.base_url {
        provider = provider.with_api_url(url.clone());
    }
    let retry = &settings.retry;
    let config = RetryConfig {
        max_attempts: retry.max_attempts,
        base_delay: Duration::from_millis(retry.base_delay_ms),
        max_delay: Duration::from_millis(retry.max_delay_ms),
        jitter_factor: retry.jitter_factor,
    };
    Ok(Arc::new(RetryingModelClient::new(provider, config)))
}

fn engine_config(settings: &ParleySettings) -> anyhow::Result<EngineConfig> {
    let working_directory = match &settings.session.working_directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let thinking = match settings.model.thinking_budget {
        0 => ThinkingConfig::Disabled,
        tokens => ThinkingConfig::Budget { tokens },
    };
    Ok(EngineConfig {
        system_prompt: settings.model.system_prompt.clone(),
        stream_options: StreamOptions {
            max_tokens: settings.model.max_tokens,
            temperature: None,
            thinking,
        },
        working_directory,
        auto_confirm: settings.session.auto_confirm,
        max_auto_rounds: settings.session.max_auto_rounds,
        tool_timeout: settings.session.tool_timeout_secs.map(Duration::from_secs),
    })
}
