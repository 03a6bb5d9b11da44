use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use braid_core::producer::Producer;
use braid_core::settings::{self, BraidSettings};
use braid_engine::tools::create_default_registry;
use braid_engine::{
    HttpProducer, SubAgentRegistry, SubAgentSpec, ToolFilter, ToolRegistry, ToolThreadCache,
};
use braid_server::{AppState, ServerConfig};
use braid_store::Database;
use braid_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "braid", version, about = "Resumable multi-agent generation server")]
struct Cli {
    /// Settings file (defaults to ~/.braid/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => settings::load_settings_from_path(path),
        None => settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let _telemetry = init_telemetry(TelemetryConfig::from_level_name(
        &settings.logging.level,
        settings.logging.json,
    ));
    tracing::info!("starting braid");

    let db_path = settings.server.resolved_db_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    let producer: Arc<dyn Producer> = match HttpProducer::from_settings(&settings.producer)? {
        Some(producer) => Arc::new(producer),
        None => {
            bail!("producer.endpoint is not configured (set it in settings or BRAID_PRODUCER_URL)")
        }
    };

    let threads = ToolThreadCache::from_settings(&settings.thread_cache);
    let tools = Arc::new(create_default_registry(&settings.tools, &threads));
    let agents = build_agents(&settings, &tools)?;
    tracing::info!(
        agents = ?agents.names(),
        tools = tools.count(),
        model = producer.model_ref(),
        "engine configured"
    );

    let state = AppState::assemble(db, &settings, producer, tools, agents, threads);
    let handle = braid_server::start(ServerConfig::from_settings(&settings), state)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "braid server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    handle.shutdown();
    handle.wait().await;
    Ok(())
}

/// One sub-agent per `delegation.agents` entry, each with its own producer.
fn build_agents(
    settings: &BraidSettings,
    tools: &Arc<ToolRegistry>,
) -> anyhow::Result<SubAgentRegistry> {
    let mut registry = SubAgentRegistry::new();
    for agent in &settings.delegation.agents {
        let Some(endpoint) = agent
            .endpoint
            .clone()
            .or_else(|| settings.producer.endpoint.clone())
        else {
            bail!("agent '{}' has no endpoint", agent.name);
        };
        let model = agent.model.clone().unwrap_or_else(|| settings.producer.model.clone());
        let producer = HttpProducer::new(endpoint, model, settings.producer.idle_timeout())
            .with_context(|| format!("failed to build producer for agent '{}'", agent.name))?;
        registry.register(SubAgentSpec {
            name: agent.name.clone(),
            description: agent.description.clone(),
            producer: Arc::new(producer),
            tools: Arc::new(tools.clone_for_subagent(&ToolFilter::for_agent(agent))),
        });
    }
    Ok(registry)
}
