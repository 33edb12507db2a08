use agent_orchestrator_core::agents::AgentRegistry;
use agent_orchestrator_core::api::ApiServer;
use agent_orchestrator_core::broadcaster::Broadcaster;
use agent_orchestrator_core::config::{self, AppSettings};
use agent_orchestrator_core::events::EventBus;
use agent_orchestrator_core::memory::MemoryStore;
use agent_orchestrator_core::monitoring::{self, HealthReporter};
use agent_orchestrator_core::orchestrator::Orchestrator;
use agent_orchestrator_core::scorer::RlScorer;
use agent_orchestrator_core::tasks::TaskManager;
use agent_orchestrator_core::workspace::WorkspaceExecutor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = AppSettings::load()?;
    monitoring::init_tracing(&settings.log_level);
    info!("starting agent orchestrator core");

    let agent_definitions_path =
        std::env::var("AGENT_DEFINITIONS_PATH").unwrap_or_else(|_| "agents.json".to_string());
    let definitions = config::load_agent_definitions(&PathBuf::from(&agent_definitions_path))?;
    let env_snapshot = config::snapshot_env(&definitions);

    let events = Arc::new(EventBus::new());
    let agents = Arc::new(AgentRegistry::new(events.clone()));
    agents.load(definitions, &env_snapshot).await;

    let tasks = Arc::new(TaskManager::new(events.clone()));
    let scorer = Arc::new(RlScorer::new());
    let memory = Arc::new(MemoryStore::load(&settings.memory_dir).await?);
    let workspace = Arc::new(WorkspaceExecutor::new(settings.workspace_root.clone(), events.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        agents.clone(),
        tasks.clone(),
        scorer.clone(),
        memory.clone(),
        workspace,
        events.clone(),
    ));
    orchestrator.clone().run();

    let broadcaster = Arc::new(Broadcaster::new(
        agents.clone(),
        tasks.clone(),
        scorer,
        memory,
        events,
    ));
    tokio::spawn(broadcaster.clone().run());
    tokio::spawn(broadcaster.watch_events());

    let health = Arc::new(HealthReporter::new(agents.clone(), tasks.clone()));
    let api = ApiServer::new(
        settings.host,
        settings.port,
        settings.allowed_origins,
        agents,
        tasks,
        orchestrator,
        health,
    );
    api.run().await?;

    Ok(())
}
