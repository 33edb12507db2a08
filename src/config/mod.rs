use crate::models::{AgentDefinition, ProviderKind};
use crate::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use tracing::{info, warn};

/// Typed, validated view of process configuration. Reading the
/// environment and `.env` file is the external loading mechanism; this
/// struct and its validation are the part of configuration that lives
/// in the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub host: String,
    pub port: u16,
    pub workspace_root: String,
    pub memory_dir: String,
    pub max_concurrent_working_agents: usize,
    pub dispatch_tick_ms: u64,
    pub recharge_tick_secs: u64,
    pub log_level: String,
    pub allowed_origins: Vec<String>,
}

impl AppSettings {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => info!("loaded .env file from {:?}", path),
            Err(e) => warn!("no .env file loaded: {}", e),
        }

        let host = env::var("ORCHESTRATOR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port: u16 = env::var("ORCHESTRATOR_PORT")
            .unwrap_or_else(|_| "4173".to_string())
            .parse()
            .map_err(|_| {
                OrchestratorError::Config("ORCHESTRATOR_PORT must be a valid port number".into())
            })?;

        let workspace_root =
            env::var("WORKSPACE_ROOT").unwrap_or_else(|_| "workspace".to_string());
        if workspace_root.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "WORKSPACE_ROOT cannot be empty".into(),
            ));
        }

        let memory_dir = env::var("MEMORY_DIR").unwrap_or_else(|_| "memory".to_string());

        let max_concurrent_working_agents: usize = env::var("MAX_CONCURRENT_WORKING_AGENTS")
            .unwrap_or_else(|_| crate::constants::MAX_CONCURRENT_WORKING_AGENTS.to_string())
            .parse()
            .map_err(|_| {
                OrchestratorError::Config(
                    "MAX_CONCURRENT_WORKING_AGENTS must be a positive integer".into(),
                )
            })?;
        if max_concurrent_working_agents == 0 {
            return Err(OrchestratorError::Config(
                "MAX_CONCURRENT_WORKING_AGENTS must be at least 1".into(),
            ));
        }

        let dispatch_tick_ms: u64 = env::var("DISPATCH_TICK_MS")
            .unwrap_or_else(|_| crate::constants::DISPATCH_TICK_INTERVAL.as_millis().to_string())
            .parse()
            .map_err(|_| OrchestratorError::Config("DISPATCH_TICK_MS must be an integer".into()))?;
        if dispatch_tick_ms == 0 {
            return Err(OrchestratorError::Config(
                "DISPATCH_TICK_MS must be positive".into(),
            ));
        }

        let recharge_tick_secs: u64 = env::var("RECHARGE_TICK_SECS")
            .unwrap_or_else(|_| crate::constants::RECHARGE_TICK_INTERVAL.as_secs().to_string())
            .parse()
            .map_err(|_| {
                OrchestratorError::Config("RECHARGE_TICK_SECS must be an integer".into())
            })?;
        if recharge_tick_secs == 0 {
            return Err(OrchestratorError::Config(
                "RECHARGE_TICK_SECS must be positive".into(),
            ));
        }

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(AppSettings {
            host,
            port,
            workspace_root,
            memory_dir,
            max_concurrent_working_agents,
            dispatch_tick_ms,
            recharge_tick_secs,
            log_level,
            allowed_origins,
        })
    }
}

/// Parses and validates the agent-definition array named in the
/// external interfaces (§6). The source-file shape is irrelevant to
/// the core; callers deserialize a JSON value (or whatever the host
/// wires in) into `Vec<AgentDefinition>` and pass it here.
pub fn validate_agent_definitions(defs: &[AgentDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for def in defs {
        if !seen.insert(def.id.clone()) {
            return Err(OrchestratorError::Config(format!(
                "duplicate agent id: {}",
                def.id
            )));
        }
        if def.model_id.trim().is_empty() {
            return Err(OrchestratorError::Config(format!(
                "agent {} has an empty model id",
                def.id
            )));
        }
        if matches!(def.provider_kind, ProviderKind::OpenAiCompatible) && def.endpoint.is_none() {
            return Err(OrchestratorError::Config(format!(
                "agent {} is openai-compatible but declares no endpoint",
                def.id
            )));
        }
    }
    Ok(())
}

/// Loads and validates the agent-definition array from a JSON file on
/// disk (the external interfaces in §6 leave the source format to the
/// host; JSON is what this crate's own fixtures and tests use).
pub fn load_agent_definitions(path: &std::path::Path) -> Result<Vec<AgentDefinition>> {
    let raw = std::fs::read_to_string(path)?;
    let defs: Vec<AgentDefinition> = serde_json::from_str(&raw)?;
    validate_agent_definitions(&defs)?;
    Ok(defs)
}

/// Credential resolution is a pure function of the definition and an
/// environment snapshot — the adapter never reads the environment
/// itself (§9).
pub fn resolve_credential(
    def: &AgentDefinition,
    env_snapshot: &std::collections::HashMap<String, String>,
) -> Option<String> {
    let var = def.credential_env_var.as_ref()?;
    env_snapshot.get(var).cloned().filter(|v| !v.is_empty())
}

/// Snapshots the subset of the process environment declared by agent
/// definitions, so `resolve_credential` stays a pure function instead
/// of reaching into `std::env` itself.
pub fn snapshot_env(defs: &[AgentDefinition]) -> std::collections::HashMap<String, String> {
    defs.iter()
        .filter_map(|d| d.credential_env_var.as_ref())
        .filter_map(|var| env::var(var).ok().map(|v| (var.clone(), v)))
        .collect()
}
