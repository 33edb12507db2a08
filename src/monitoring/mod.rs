//! Observability (§4.13): tracing initialization plus a lightweight
//! health/metrics surface for the command surface's `/system/*`
//! routes. Not a scored RL input — ambient scaffolding only.

use crate::agents::AgentRegistry;
use crate::models::AgentStatus;
use crate::tasks::TaskManager;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide `tracing` subscriber. Call once from
/// `main`; the default level comes from `AppSettings::log_level`
/// unless `RUST_LOG` is set in the environment.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub pending_tasks: usize,
    pub active_tasks: usize,
    pub agents_working: usize,
    pub agents_idle: usize,
    pub agents_cooldown: usize,
    pub agents_offline: usize,
    pub agents_error: usize,
}

/// Aggregates process uptime and the Agent Registry/Task Manager's
/// current counts into the health surface's response shape.
pub struct HealthReporter {
    started_at: Instant,
    agents: Arc<AgentRegistry>,
    tasks: Arc<TaskManager>,
}

impl HealthReporter {
    pub fn new(agents: Arc<AgentRegistry>, tasks: Arc<TaskManager>) -> Self {
        Self {
            started_at: Instant::now(),
            agents,
            tasks,
        }
    }

    pub async fn report(&self) -> SystemHealth {
        let agent_states = self.agents.list().await;
        let tasks = self.tasks.list().await;

        let mut working = 0;
        let mut idle = 0;
        let mut cooldown = 0;
        let mut offline = 0;
        let mut error = 0;
        for state in &agent_states {
            match state.status {
                AgentStatus::Working => working += 1,
                AgentStatus::Idle => idle += 1,
                AgentStatus::Cooldown => cooldown += 1,
                AgentStatus::Offline => offline += 1,
                AgentStatus::Error => error += 1,
            }
        }

        let pending_tasks = tasks
            .iter()
            .filter(|t| t.status == crate::models::TaskStatus::Pending)
            .count();
        let active_tasks = tasks
            .iter()
            .filter(|t| t.status == crate::models::TaskStatus::Active)
            .count();

        let status = if error > 0 && error >= agent_states.len() {
            HealthStatus::Unhealthy
        } else if error > 0 || offline == agent_states.len() && !agent_states.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SystemHealth {
            status,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            pending_tasks,
            active_tasks,
            agents_working: working,
            agents_idle: idle,
            agents_cooldown: cooldown,
            agents_offline: offline,
            agents_error: error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{AgentDefinition, ProviderKind};

    fn def(id: &str) -> AgentDefinition {
        AgentDefinition {
            id: id.to_string(),
            display_name: id.to_string(),
            provider_kind: ProviderKind::Anthropic,
            endpoint: None,
            credential_env_var: None,
            model_id: "m".to_string(),
            avatar_tag: None,
            role_tag: "developer".to_string(),
            max_tokens: None,
            energy_recharge_rate: None,
            streaming: false,
        }
    }

    #[tokio::test]
    async fn reports_healthy_with_idle_agents() {
        let events = Arc::new(EventBus::new());
        let agents = Arc::new(AgentRegistry::new(events.clone()));
        agents.load(vec![def("a")], &Default::default()).await;
        let tasks = Arc::new(TaskManager::new(events));
        let reporter = HealthReporter::new(agents, tasks);
        let health = reporter.report().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.agents_idle, 1);
    }

    #[tokio::test]
    async fn reports_degraded_when_all_agents_offline() {
        let events = Arc::new(EventBus::new());
        let agents = Arc::new(AgentRegistry::new(events.clone()));
        let mut offline_def = def("a");
        offline_def.credential_env_var = Some("MISSING".to_string());
        agents.load(vec![offline_def], &Default::default()).await;
        let tasks = Arc::new(TaskManager::new(events));
        let reporter = HealthReporter::new(agents, tasks);
        let health = reporter.report().await;
        assert_eq!(health.status, HealthStatus::Degraded);
    }
}
