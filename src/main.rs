mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn, Level};

use parley_core::provider::{NoopMemoryProvider, StaticPromptProvider};
use parley_engine::{AgentRegistry, AgentServices, ConfiguredAgent};
use parley_llm::{OpenAiClient, ToolHubClient};
use parley_server::{ClientRegistry, SessionOrchestrator};
use parley_store::{AgentProfileRepo, Database, SqliteContextStore};
use parley_telemetry::{init_telemetry, parse_level, TelemetryConfig};

use crate::settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "parley", about = "Streaming agent service over WebSocket")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    /// e.g. "debug" or "warn"; RUST_LOG still takes precedence.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Keep sessions and profiles in memory only.
    #[arg(long)]
    in_memory: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        if self.in_memory {
            settings.store.in_memory = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = settings::load(cli.config.as_deref()).context("failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("invalid settings")?;

    let log_level = parse_level(&settings.logging.level);
    init_telemetry(&TelemetryConfig {
        log_level: log_level.unwrap_or(Level::INFO),
        module_levels: Vec::new(),
        json: settings.logging.json,
    });
    if log_level.is_none() {
        warn!(level = %settings.logging.level, "unknown log level, using info");
    }

    info!("starting parley");

    let db = open_database(&settings)?;
    let profiles = AgentProfileRepo::new(db.clone());
    let services = AgentServices {
        llm: Arc::new(OpenAiClient::new(settings.llm_config()).context("failed to build LLM client")?),
        tools: Arc::new(
            ToolHubClient::new(settings.tool_hub_config()).context("failed to build tool hub client")?,
        ),
        prompts: Arc::new(StaticPromptProvider),
        memory: Arc::new(NoopMemoryProvider),
        store: Arc::new(SqliteContextStore::new(db)),
    };
    let agent_config = settings.agent_config();

    let profile = settings.default_profile();
    profiles
        .upsert(&profile)
        .context("failed to seed default agent profile")?;
    let registry = Arc::new(AgentRegistry::new());
    registry.register_agent(Arc::new(ConfiguredAgent::new(
        profile.clone(),
        services.clone(),
        agent_config.clone(),
    )));
    info!(agent_id = %profile.agent_id, "default agent registered");

    let clients = Arc::new(ClientRegistry::new(settings.server.max_send_queue));
    let orchestrator = Arc::new(SessionOrchestrator::new(
        registry,
        profiles,
        services,
        agent_config,
        clients.clone(),
    ));

    let handle = parley_server::start(settings.server_config(), orchestrator, clients)
        .await
        .with_context(|| format!("failed to bind {}:{}", settings.server.host, settings.server.port))?;

    info!(port = handle.port, path = %settings.server.path, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn open_database(settings: &Settings) -> anyhow::Result<Database> {
    if settings.store.in_memory {
        return Database::in_memory().context("failed to open in-memory database");
    }
    let path = Path::new(&settings.store.database_path);
    Database::open(path).with_context(|| format!("failed to open database at {}", path.display()))
}
