//! Agent Registry (§4.4): holds the canonical `AgentState` map, turns
//! `AgentDefinition`s into runtime state at load/hot-reload time, and
//! publishes `agent:*` events on every mutation.

use crate::constants::EXPLORATION_BONUS_OBSERVATION_THRESHOLD;
use crate::events::{Event, EventBus};
use crate::models::{AgentDefinition, AgentState, AgentStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Exclusive owner of `AgentState` mutations (§3 "Ownership"). Every
/// other component reads a cloned snapshot via `get`/`list`.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentState>>,
    events: Arc<EventBus>,
}

impl AgentRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Builds the registry from a fresh definition list, resolving
    /// credentials once via the supplied pure function (the adapter
    /// never reads the environment itself, §9).
    pub async fn load(
        &self,
        definitions: Vec<AgentDefinition>,
        env_snapshot: &HashMap<String, String>,
    ) {
        let mut agents = self.agents.write().await;
        agents.clear();
        for def in definitions {
            let credential = crate::config::resolve_credential(&def, env_snapshot);
            let id = def.id.clone();
            let state = AgentState::from_definition(def, credential);
            self.events.publish(Event::AgentStatusChanged {
                agent_id: id.clone(),
                status: state.status,
            });
            agents.insert(id, state);
        }
    }

    /// Hot-reload (§4.4): adds state for new ids, removes state for
    /// ids no longer present (refusing removal of an agent mid-task),
    /// and refreshes only the static fields of ids that persist —
    /// runtime counters (energy, xp, level, tasksCompleted) are left
    /// untouched.
    pub async fn reload(
        &self,
        definitions: Vec<AgentDefinition>,
        env_snapshot: &HashMap<String, String>,
    ) {
        let mut agents = self.agents.write().await;
        let incoming: HashMap<String, AgentDefinition> =
            definitions.into_iter().map(|d| (d.id.clone(), d)).collect();

        let to_remove: Vec<String> = agents
            .iter()
            .filter(|(id, state)| !incoming.contains_key(*id) && state.current_task_id.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for id in to_remove {
            agents.remove(&id);
            self.events.publish(Event::AgentStatusChanged {
                agent_id: id,
                status: AgentStatus::Offline,
            });
        }

        for (id, def) in incoming {
            let credential = crate::config::resolve_credential(&def, env_snapshot);
            match agents.get_mut(&id) {
                Some(existing) => {
                    let offline = def.credential_env_var.is_some() && credential.is_none();
                    existing.definition = def;
                    existing.credential = credential;
                    if offline {
                        existing.status = AgentStatus::Offline;
                    } else if existing.status == AgentStatus::Offline {
                        existing.status = AgentStatus::Idle;
                    }
                }
                None => {
                    let state = AgentState::from_definition(def, credential);
                    self.events.publish(Event::AgentStatusChanged {
                        agent_id: id.clone(),
                        status: state.status,
                    });
                    agents.insert(id, state);
                }
            }
        }
    }

    pub async fn add(&self, definition: AgentDefinition, credential: Option<String>) {
        let id = definition.id.clone();
        let state = AgentState::from_definition(definition, credential);
        let status = state.status;
        self.agents.write().await.insert(id.clone(), state);
        self.events
            .publish(Event::AgentStatusChanged { agent_id: id, status });
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut agents = self.agents.write().await;
        if let Some(state) = agents.get(id) {
            if state.current_task_id.is_some() {
                return false;
            }
        }
        agents.remove(id).is_some()
    }

    pub async fn get(&self, id: &str) -> Option<AgentState> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<AgentState> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Idle, non-bridge, credential resolvable — the dispatch
    /// eligibility predicate the selector reads.
    pub async fn callable(&self) -> Vec<AgentState> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.is_callable())
            .cloned()
            .collect()
    }

    pub async fn set_status(&self, id: &str, status: AgentStatus) {
        let mut agents = self.agents.write().await;
        if let Some(state) = agents.get_mut(id) {
            state.status = status;
        }
        self.events.publish(Event::AgentStatusChanged {
            agent_id: id.to_string(),
            status,
        });
    }

    /// Marks an agent working on a task, enforcing the invariant that
    /// `current_task_id.is_some() <=> status == Working` (§3).
    pub async fn start_task(&self, id: &str, task_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(state) = agents.get_mut(id) {
            state.status = AgentStatus::Working;
            state.current_task_id = Some(task_id.to_string());
        }
        self.events.publish(Event::AgentWorking {
            agent_id: id.to_string(),
            task_id: task_id.to_string(),
        });
    }

    /// Debits energy and credits tokens/xp/level/tasksCompleted at
    /// task completion (drain happens at completion, not mid-call,
    /// per the Agent invariants in §3), then clears the working gate.
    pub async fn finish_task(&self, id: &str, tokens: u64) -> Option<(u64, u32)> {
        let mut agents = self.agents.write().await;
        let state = agents.get_mut(id)?;
        let energy_cost = drain_cost(tokens);
        state.energy = state.energy.saturating_sub(energy_cost);
        state.total_tokens_used += tokens;
        state.tasks_completed += 1;
        let xp_gain = 20 + (tokens / 100).min(30);
        state.xp += xp_gain;
        state.level = (state.xp / crate::models::XP_PER_LEVEL) as u32 + 1;
        state.current_task_id = None;
        state.status = AgentStatus::Idle;
        let (xp, level) = (state.xp, state.level);
        drop(agents);
        self.events.publish(Event::AgentCompleted {
            agent_id: id.to_string(),
            task_id: String::new(),
        });
        Some((xp, level))
    }

    /// Rate-limit failure path: cooldown with `cooldownUntil = now + duration`.
    pub async fn set_cooldown(&self, id: &str, duration: std::time::Duration) {
        let mut agents = self.agents.write().await;
        if let Some(state) = agents.get_mut(id) {
            state.status = AgentStatus::Cooldown;
            state.cooldown_until = Some(Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default());
            state.current_task_id = None;
        }
        self.events.publish(Event::AgentStatusChanged {
            agent_id: id.to_string(),
            status: AgentStatus::Cooldown,
        });
    }

    /// Transport failure path: idle, or `error` status after repeated
    /// occurrences.
    pub async fn fail_task(&self, id: &str, message: &str, repeated_error_threshold: u32) {
        let mut agents = self.agents.write().await;
        if let Some(state) = agents.get_mut(id) {
            state.error_count += 1;
            state.current_task_id = None;
            state.status = if state.error_count >= repeated_error_threshold {
                AgentStatus::Error
            } else {
                AgentStatus::Idle
            };
        }
        self.events.publish(Event::AgentError {
            agent_id: id.to_string(),
            task_id: None,
            message: message.to_string(),
        });
    }

    /// Recharge tick (§4.9): each non-offline agent gains
    /// `max(5, rechargeRate)` energy up to `maxEnergy`; expired
    /// cooldowns clear back to idle.
    pub async fn recharge_all(&self) {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        for (id, state) in agents.iter_mut() {
            if state.status == AgentStatus::Offline {
                continue;
            }
            let rate = state.recharge_rate().max(5);
            state.energy = (state.energy + rate).min(state.max_energy);
            if state.status == AgentStatus::Cooldown {
                if let Some(until) = state.cooldown_until {
                    if until <= now {
                        state.status = AgentStatus::Idle;
                        state.cooldown_until = None;
                        self.events.publish(Event::AgentStatusChanged {
                            agent_id: id.clone(),
                            status: AgentStatus::Idle,
                        });
                    }
                }
            }
        }
    }
}

fn drain_cost(tokens: u64) -> u32 {
    if tokens == 0 {
        return 0;
    }
    (tokens.div_ceil(1000) as u32).min(5)
}

/// Exploration bonus applies below this many total observations.
pub fn exploration_bonus_applies(total_observations: u32) -> bool {
    total_observations < EXPLORATION_BONUS_OBSERVATION_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;

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
    async fn load_marks_offline_when_credential_unresolved() {
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(bus);
        let mut d = def("a");
        d.credential_env_var = Some("MISSING_VAR".to_string());
        registry.load(vec![d], &HashMap::new()).await;
        let state = registry.get("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Offline);
        assert!(!state.is_callable());
    }

    #[tokio::test]
    async fn start_and_finish_task_round_trip() {
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(bus);
        registry.load(vec![def("a")], &HashMap::new()).await;
        registry.start_task("a", "TASK-0001").await;
        let state = registry.get("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Working);
        assert_eq!(state.current_task_id.as_deref(), Some("TASK-0001"));

        let (xp, level) = registry.finish_task("a", 350).await.unwrap();
        assert_eq!(xp, 20 + 3);
        assert_eq!(level, 1);
        let state = registry.get("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert!(state.current_task_id.is_none());
        assert_eq!(state.energy, 100 - 1);
    }

    #[tokio::test]
    async fn zero_tokens_drains_no_energy_and_grants_base_xp() {
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(bus);
        registry.load(vec![def("a")], &HashMap::new()).await;
        registry.start_task("a", "TASK-0001").await;
        let (xp, _) = registry.finish_task("a", 0).await.unwrap();
        assert_eq!(xp, 20);
        let state = registry.get("a").await.unwrap();
        assert_eq!(state.energy, 100);
    }

    #[tokio::test]
    async fn recharge_clears_expired_cooldown() {
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(bus);
        registry.load(vec![def("a")], &HashMap::new()).await;
        registry.set_cooldown("a", std::time::Duration::from_millis(0)).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.recharge_all().await;
        let state = registry.get("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert!(state.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn hot_reload_preserves_runtime_counters_for_surviving_ids() {
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(bus);
        registry.load(vec![def("a"), def("b")], &HashMap::new()).await;
        registry.start_task("a", "TASK-0001").await;
        registry.finish_task("a", 1000).await;

        let mut updated = def("a");
        updated.display_name = "A Renamed".to_string();
        registry.reload(vec![updated], &HashMap::new()).await;

        let a = registry.get("a").await.unwrap();
        assert_eq!(a.definition.display_name, "A Renamed");
        assert_eq!(a.xp, 25);
        assert!(registry.get("b").await.is_none());
    }

    #[tokio::test]
    async fn hot_reload_refuses_to_remove_agent_mid_task() {
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(bus);
        registry.load(vec![def("a")], &HashMap::new()).await;
        registry.start_task("a", "TASK-0001").await;
        registry.reload(vec![], &HashMap::new()).await;
        assert!(registry.get("a").await.is_some());
    }

    #[test]
    fn drain_cost_caps_at_five() {
        assert_eq!(drain_cost(0), 0);
        assert_eq!(drain_cost(500), 1);
        assert_eq!(drain_cost(6000), 5);
        assert_eq!(drain_cost(50_000), 5);
    }
}
