//! Orchestrator (§4.9): the dispatch tick, the agent selector, the
//! per-task execution pipeline, and the recharge tick. Ties together
//! every other component without owning their state directly.

use crate::agents::AgentRegistry;
use crate::backend::{self, BackendRequest, PromptContext};
use crate::constants::{
    DISPATCH_TICK_INTERVAL, EXPLORATION_BONUS, MAX_CONCURRENT_WORKING_AGENTS,
    RECENT_FAILURE_PENALTY, RECHARGE_TICK_INTERVAL, SELECTOR_TOP_N,
};
use crate::events::{Event, EventBus};
use crate::memory::{MemoryDocument, MemoryStore};
use crate::models::{
    AgentState, CreatedBy, PreferredAgent, Priority, Risk, Task, TaskResult, TaskStatus,
};
use crate::parser;
use crate::scorer::{self, RlScorer, ScoringInput};
use crate::tasks::TaskManager;
use crate::workspace::WorkspaceExecutor;
use crate::{OrchestratorError, Result};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const REPEATED_ERROR_THRESHOLD: u32 = 3;

pub struct Orchestrator {
    agents: Arc<AgentRegistry>,
    tasks: Arc<TaskManager>,
    scorer: Arc<RlScorer>,
    memory: Arc<MemoryStore>,
    workspace: Arc<WorkspaceExecutor>,
    events: Arc<EventBus>,
    in_flight: AtomicUsize,
}

impl Orchestrator {
    pub fn new(
        agents: Arc<AgentRegistry>,
        tasks: Arc<TaskManager>,
        scorer: Arc<RlScorer>,
        memory: Arc<MemoryStore>,
        workspace: Arc<WorkspaceExecutor>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            agents,
            tasks,
            scorer,
            memory,
            workspace,
            events,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Spawns the dispatch and recharge ticks as independent tokio
    /// tasks. Either can be delayed or skipped without corrupting
    /// state (§4.9).
    pub fn run(self: Arc<Self>) {
        let dispatch_self = self.clone();
        tokio::spawn(async move { dispatch_self.dispatch_loop().await });
        let recharge_self = self.clone();
        tokio::spawn(async move { recharge_self.recharge_loop().await });
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(DISPATCH_TICK_INTERVAL);
        loop {
            ticker.tick().await;
            self.dispatch_tick().await;
        }
    }

    async fn recharge_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RECHARGE_TICK_INTERVAL);
        loop {
            ticker.tick().await;
            self.agents.recharge_all().await;
        }
    }

    /// One dispatch tick: never blocks on task execution (§4.9, §5).
    async fn dispatch_tick(self: &Arc<Self>) {
        let working = self.in_flight.load(Ordering::SeqCst);
        if working >= MAX_CONCURRENT_WORKING_AGENTS {
            return;
        }
        let mut slots = MAX_CONCURRENT_WORKING_AGENTS - working;
        let pending = self.tasks.pending_ordered().await;

        for task in pending {
            if slots == 0 {
                break;
            }
            let callable = self.agents.callable().await;
            let Some(agent_id) = self.select_agent(&task, &callable).await else {
                continue;
            };

            if self.tasks.assign(&task.id, &agent_id).await.is_err() {
                continue;
            }
            self.agents.start_task(&agent_id, &task.id).await;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            slots -= 1;

            let this = self.clone();
            let assigned_task = task.clone();
            tokio::spawn(async move {
                this.clone().execute_task(assigned_task, agent_id).await;
                this.in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    /// Agent selection (§4.9): preferred-id fast path, else RL-scored
    /// weighted random among the top 3 candidates.
    async fn select_agent(&self, task: &Task, callable: &[AgentState]) -> Option<String> {
        if let PreferredAgent::Id(id) = &task.preferred_agent_id {
            if callable.iter().any(|a| &a.definition.id == id) {
                return Some(id.clone());
            }
            return None;
        }

        let tags = scorer::classify(&task.title, &task.description);
        let mut scored = Vec::with_capacity(callable.len());
        for agent in callable {
            let mut type_scores = Vec::with_capacity(tags.len());
            for tag in &tags {
                type_scores.push(self.scorer.agent_category_score(&agent.definition.id, tag).await);
            }
            let type_score = type_scores.iter().sum::<f64>() / type_scores.len().max(1) as f64;

            let observations = self.scorer.total_observations(&agent.definition.id).await;
            let exploration = if crate::agents::exploration_bonus_applies(observations) {
                EXPLORATION_BONUS
            } else {
                0.0
            };
            let recent_failures = self.scorer.recent_failure_count(&agent.definition.id).await;
            let score = type_score + exploration - (recent_failures as f64 * RECENT_FAILURE_PENALTY);
            scored.push((agent.definition.id.clone(), score));
        }

        if scored.is_empty() {
            return None;
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(SELECTOR_TOP_N);

        let weights: Vec<f64> = scored.iter().map(|(_, s)| s.max(1.0)).collect();
        let total: f64 = weights.iter().sum();
        let mut pick = rand::thread_rng().gen_range(0.0..total);
        for ((id, _), weight) in scored.iter().zip(weights.iter()) {
            if pick < *weight {
                return Some(id.clone());
            }
            pick -= weight;
        }
        scored.first().map(|(id, _)| id.clone())
    }

    /// The per-task execution pipeline (§4.9).
    async fn execute_task(self: Arc<Self>, task: Task, agent_id: String) {
        let Some(agent) = self.agents.get(&agent_id).await else {
            warn!(task_id = %task.id, agent_id, "agent vanished before execution");
            return;
        };

        let tags = scorer::classify(&task.title, &task.description);
        let overall_score = self.scorer.overall_score(&agent_id).await;
        let recent_failures = self.scorer.recent_failure_count(&agent_id).await;
        let recent_history = self.memory.task_history().await;

        let system_prompt = backend::compose_system_prompt(&PromptContext {
            agent_display_name: &agent.definition.display_name,
            role_tag: &agent.definition.role_tag,
            task_description: &task.description,
            overall_score,
            recent_failures,
            recent_history: &recent_history,
        });

        let req = BackendRequest {
            provider_kind: agent.definition.provider_kind,
            endpoint: agent.definition.endpoint.as_deref(),
            model_id: &agent.definition.model_id,
            credential: agent.credential.as_deref(),
            system_prompt: &system_prompt,
            user_prompt: &task.description,
            max_tokens: agent.definition.max_tokens,
            streaming: agent.definition.streaming,
        };

        self.events.publish(Event::AgentWorking {
            agent_id: agent_id.clone(),
            task_id: task.id.clone(),
        });

        match backend::call(&req).await {
            Ok(response) => self.on_success(task, agent_id, response, tags).await,
            Err(err) => self.on_failure(task, agent_id, err, tags).await,
        }
    }

    async fn on_success(
        self: &Arc<Self>,
        task: Task,
        agent_id: String,
        response: crate::backend::BackendResponse,
        tags: Vec<String>,
    ) {
        let parsed = parser::parse(&response.text);
        let (xp, level) = self
            .agents
            .finish_task(&agent_id, response.tokens)
            .await
            .unwrap_or((0, 0));

        let agent = self.agents.get(&agent_id).await;
        let agent_display_name = agent
            .as_ref()
            .map(|a| a.definition.display_name.clone())
            .unwrap_or_else(|| agent_id.clone());

        let has_files = !parsed.files.is_empty();
        let review = has_files && task.risk == Risk::High;

        let (written_files, command_outcomes) = if has_files && task.risk == Risk::Low {
            let written = self.workspace.write_files(&task.id, &parsed.files).await.unwrap_or_else(|e| {
                warn!(task_id = %task.id, "workspace write failed: {e}");
                Vec::new()
            });
            let outcomes = if !parsed.commands.is_empty() {
                self.workspace.run_commands(&task.id, &parsed.commands).await.unwrap_or_else(|e| {
                    warn!(task_id = %task.id, "workspace exec failed: {e}");
                    Vec::new()
                })
            } else {
                Vec::new()
            };
            (written, outcomes)
        } else {
            (Vec::new(), Vec::new())
        };

        let perf_score = scorer::score(&ScoringInput {
            files: &parsed.files,
            commands: &parsed.commands,
            outcomes: &command_outcomes,
            raw_text: &response.text,
            tokens: response.tokens,
            status: if review { TaskStatus::Review } else { TaskStatus::Completed },
        });
        self.scorer
            .record_performance(&agent_id, &tags, perf_score, &task.id)
            .await;
        self.persist_performance_log(&task.id).await;
        self.events.publish(Event::RlScored {
            agent_id: agent_id.clone(),
            task_id: task.id.clone(),
            score: perf_score,
        });

        let result = TaskResult {
            success: true,
            explanation: parsed.explanation.clone(),
            raw_text: response.text.clone(),
            tokens_used: response.tokens,
            agent_display_name: agent_display_name.clone(),
            model_id: response.model.clone(),
            file_intents: parsed.files.clone(),
            command_intents: parsed.commands.clone(),
            executed_commands: command_outcomes,
            perf_score,
            task_types: tags.clone(),
        };
        self.attach_result(&task.id, result.clone()).await;

        let _ = self.tasks.complete_or_review(&task.id, review, tags.clone()).await;

        let entry = MemoryDocument::truncated_entry(
            task.id.clone(),
            task.title.clone(),
            agent_id.clone(),
            agent_display_name,
            response.model.clone(),
            &parsed.explanation,
            written_files,
            response.tokens,
            true,
        );
        if let Err(e) = self.memory.record_task(entry).await {
            error!(task_id = %task.id, "failed to persist memory entry: {e}");
        }

        if task.depth < crate::models::MAX_TASK_DEPTH {
            for subtask in &parsed.subtasks {
                let created_by = CreatedBy::Agent(agent_id.clone());
                if let Err(e) = self
                    .tasks
                    .create(
                        subtask.title.clone(),
                        subtask.description.clone(),
                        Priority::Medium,
                        created_by,
                        Some(task.id.clone()),
                        task.depth + 1,
                        subtask.agent.clone(),
                        Vec::new(),
                    )
                    .await
                {
                    warn!(task_id = %task.id, "failed to spawn subtask: {e}");
                }
            }
        } else if !parsed.subtasks.is_empty() {
            warn!(task_id = %task.id, dropped = parsed.subtasks.len(), "subtasks dropped at max depth");
        }

        self.events.publish(Event::AgentXpGained {
            agent_id: agent_id.clone(),
            xp,
            level,
        });
        self.events.publish(Event::AgentCompleted {
            agent_id,
            task_id: task.id,
        });
    }

    async fn on_failure(self: &Arc<Self>, task: Task, agent_id: String, err: OrchestratorError, tags: Vec<String>) {
        let perf_score = scorer::failure_score(&err);
        self.scorer
            .record_performance(&agent_id, &tags, perf_score, &task.id)
            .await;
        self.persist_performance_log(&task.id).await;

        match &err {
            OrchestratorError::RateLimited { retry_after, .. } => {
                let cooldown = retry_after.unwrap_or(crate::constants::DEFAULT_COOLDOWN);
                self.agents.set_cooldown(&agent_id, cooldown).await;
            }
            _ => {
                self.agents.fail_task(&agent_id, &err.to_string(), REPEATED_ERROR_THRESHOLD).await;
            }
        }

        let _ = self.tasks.fail(&task.id, &err.to_string()).await;

        let entry = MemoryDocument::truncated_entry(
            task.id.clone(),
            task.title.clone(),
            agent_id.clone(),
            agent_id.clone(),
            String::new(),
            &err.to_string(),
            Vec::new(),
            0,
            false,
        );
        if let Err(e) = self.memory.record_task(entry).await {
            error!(task_id = %task.id, "failed to persist memory entry: {e}");
        }

        self.events.publish(Event::AgentError {
            agent_id,
            task_id: Some(task.id),
            message: err.to_string(),
        });
    }

    /// Approval path for a review-state task: applies the pending
    /// files/commands *before* the transition, so a failed write never
    /// leaves a task marked completed/approved with nothing on disk
    /// (§4.9, §4.8 — mirrors the auto-apply order in `on_success`).
    pub async fn approve_task(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Review {
            return Err(OrchestratorError::InvalidTransition(format!(
                "{task_id} is {:?}, expected review",
                task.status
            )));
        }
        if let Some(result) = &task.result {
            let written = self.workspace.write_files(task_id, &result.file_intents).await?;
            if !result.command_intents.is_empty() {
                self.workspace.run_commands(task_id, &result.command_intents).await?;
            }
            if !written.is_empty() {
                info!(task_id, count = written.len(), "approved task wrote files");
            }
        }
        self.tasks.approve(task_id).await?;
        Ok(())
    }

    pub async fn reject_task(&self, task_id: &str) -> Result<()> {
        self.tasks.reject(task_id).await
    }

    async fn attach_result(&self, task_id: &str, result: TaskResult) {
        // Task Manager owns `Task` mutation; a light setter keeps that
        // invariant instead of reaching into its map here.
        if let Err(e) = self.tasks.attach_result(task_id, result).await {
            warn!(task_id, "failed to attach result: {e}");
        }
    }

    /// Mirrors the live scorer state into the Memory Store alongside
    /// every task-history write (§3, §4.2) — without this the
    /// persisted document's `performanceLog` never reflects real scores.
    async fn persist_performance_log(&self, task_id: &str) {
        if let Err(e) = self.memory.save_performance_log(self.scorer.snapshot().await).await {
            error!(task_id, "failed to persist performance log: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{AgentDefinition, ProviderKind};

    fn def(id: &str, provider: ProviderKind) -> AgentDefinition {
        AgentDefinition {
            id: id.to_string(),
            display_name: id.to_string(),
            provider_kind: provider,
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

    async fn harness() -> (Arc<Orchestrator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let agents = Arc::new(AgentRegistry::new(events.clone()));
        let tasks = Arc::new(TaskManager::new(events.clone()));
        let scorer = Arc::new(RlScorer::new());
        let memory = Arc::new(MemoryStore::load(dir.path()).await.unwrap());
        let workspace = Arc::new(WorkspaceExecutor::new(dir.path().join("ws"), events.clone()));
        let orch = Arc::new(Orchestrator::new(agents, tasks, scorer, memory, workspace, events));
        (orch, dir)
    }

    #[tokio::test]
    async fn select_agent_prefers_concrete_id_when_callable() {
        let (orch, _dir) = harness().await;
        orch.agents
            .load(vec![def("a", ProviderKind::Anthropic), def("b", ProviderKind::Anthropic)], &Default::default())
            .await;
        let task = Task::new(
            "TASK-001".into(),
            "t".into(),
            "d".into(),
            Priority::Medium,
            Risk::Low,
            CreatedBy::User,
            None,
            0,
            PreferredAgent::Id("b".into()),
            vec![],
        );
        let callable = orch.agents.callable().await;
        let chosen = orch.select_agent(&task, &callable).await;
        assert_eq!(chosen.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn select_agent_returns_none_when_preferred_is_not_callable() {
        let (orch, _dir) = harness().await;
        orch.agents.load(vec![def("a", ProviderKind::Anthropic)], &Default::default()).await;
        let task = Task::new(
            "TASK-001".into(),
            "t".into(),
            "d".into(),
            Priority::Medium,
            Risk::Low,
            CreatedBy::User,
            None,
            0,
            PreferredAgent::Id("missing".into()),
            vec![],
        );
        let callable = orch.agents.callable().await;
        assert!(orch.select_agent(&task, &callable).await.is_none());
    }

    #[tokio::test]
    async fn select_agent_auto_picks_among_callable_candidates() {
        let (orch, _dir) = harness().await;
        orch.agents
            .load(vec![def("a", ProviderKind::Anthropic), def("b", ProviderKind::Anthropic)], &Default::default())
            .await;
        let task = Task::new(
            "TASK-001".into(),
            "write python tests".into(),
            "d".into(),
            Priority::Medium,
            Risk::Low,
            CreatedBy::User,
            None,
            0,
            PreferredAgent::Auto,
            vec![],
        );
        let callable = orch.agents.callable().await;
        let chosen = orch.select_agent(&task, &callable).await;
        assert!(chosen == Some("a".to_string()) || chosen == Some("b".to_string()));
    }

    #[tokio::test]
    async fn dispatch_tick_respects_concurrency_cap() {
        let (orch, _dir) = harness().await;
        orch.agents.load(vec![def("a", ProviderKind::Anthropic)], &Default::default()).await;
        orch.in_flight.store(MAX_CONCURRENT_WORKING_AGENTS, Ordering::SeqCst);
        orch.tasks
            .create("t".into(), "d".into(), Priority::Medium, CreatedBy::User, None, 0, PreferredAgent::Auto, vec![])
            .await
            .unwrap();
        orch.dispatch_tick().await;
        let pending = orch.tasks.pending_ordered().await;
        assert_eq!(pending.len(), 1, "no task should be dispatched above the concurrency cap");
    }
}
