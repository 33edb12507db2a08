//! Broadcaster (§4.10): on every core event, assembles a full state
//! snapshot and fans it out to subscribers, throttled to at most one
//! delivery per 300 ms with trailing-edge coalescing.

use crate::agents::AgentRegistry;
use crate::constants::{BROADCAST_THROTTLE, LIGHT_TASK_EXPLANATION_CHARS};
use crate::memory::MemoryStore;
use crate::models::{
    ActivityEntry, AgentState, CommandIntent, CommandOutcome, CreatedBy, PreferredAgent, Priority,
    Risk, Task, TaskHistoryEntry, TaskStatus,
};
use crate::scorer::RlScorer;
use crate::tasks::TaskManager;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

/// A task with the large/sensitive fields of its result stripped,
/// suitable for the `state:full` wire payload (§4.10).
#[derive(Debug, Clone, serde::Serialize)]
pub struct LightTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub risk: Risk,
    pub priority: Priority,
    pub assigned_agent_id: Option<String>,
    pub created_by: CreatedBy,
    pub parent_task_id: Option<String>,
    pub depth: u8,
    pub preferred_agent_id: PreferredAgent,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<LightTaskResult>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LightTaskResult {
    pub success: bool,
    pub explanation: String,
    pub tokens_used: u64,
    pub agent_display_name: String,
    pub model_id: String,
    pub file_paths: Vec<String>,
    pub command_intents: Vec<CommandIntent>,
    pub executed_commands: Vec<CommandOutcome>,
    pub perf_score: u8,
    pub task_types: Vec<String>,
}

fn project_task(task: &Task) -> LightTask {
    LightTask {
        id: task.id.clone(),
        title: task.title.clone(),
        description: task.description.clone(),
        status: task.status,
        risk: task.risk,
        priority: task.priority,
        assigned_agent_id: task.assigned_agent_id.clone(),
        created_by: task.created_by.clone(),
        parent_task_id: task.parent_task_id.clone(),
        depth: task.depth,
        preferred_agent_id: task.preferred_agent_id.clone(),
        tags: task.tags.clone(),
        created_at: task.created_at,
        started_at: task.started_at,
        completed_at: task.completed_at,
        result: task.result.as_ref().map(|r| LightTaskResult {
            success: r.success,
            explanation: r.explanation.chars().take(LIGHT_TASK_EXPLANATION_CHARS).collect(),
            tokens_used: r.tokens_used,
            agent_display_name: r.agent_display_name.clone(),
            model_id: r.model_id.clone(),
            file_paths: r.file_intents.iter().map(|f| f.path.clone()).collect(),
            command_intents: r.command_intents.clone(),
            executed_commands: r.executed_commands.clone(),
            perf_score: r.perf_score,
            task_types: r.task_types.clone(),
        }),
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StateSnapshot {
    pub agents: Vec<AgentState>,
    pub tasks: Vec<LightTask>,
    pub performance: HashMap<String, HashMap<String, crate::models::PerformanceLog>>,
    pub recent_memory: Vec<TaskHistoryEntry>,
    pub activity: Vec<ActivityEntry>,
    pub archived_task_count: u32,
}

pub struct Broadcaster {
    agents: Arc<AgentRegistry>,
    tasks: Arc<TaskManager>,
    scorer: Arc<RlScorer>,
    memory: Arc<MemoryStore>,
    events: Arc<crate::events::EventBus>,
    sender: broadcast::Sender<StateSnapshot>,
    notify: Arc<Notify>,
}

impl Broadcaster {
    pub fn new(
        agents: Arc<AgentRegistry>,
        tasks: Arc<TaskManager>,
        scorer: Arc<RlScorer>,
        memory: Arc<MemoryStore>,
        events: Arc<crate::events::EventBus>,
    ) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            agents,
            tasks,
            scorer,
            memory,
            events,
            sender,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.sender.subscribe()
    }

    async fn build_snapshot(&self) -> StateSnapshot {
        let tasks = self.tasks.list().await.iter().map(project_task).collect();
        StateSnapshot {
            agents: self.agents.list().await,
            tasks,
            performance: self.scorer.snapshot().await,
            recent_memory: self.memory.task_history().await,
            activity: self.events.recent_activity(crate::models::MAX_ACTIVITY_ENTRIES),
            archived_task_count: self.tasks.archived_count(),
        }
    }

    async fn publish_snapshot(&self) {
        let snapshot = self.build_snapshot().await;
        debug!(agents = snapshot.agents.len(), tasks = snapshot.tasks.len(), "broadcasting snapshot");
        let _ = self.sender.send(snapshot);
    }

    /// Drives the throttled snapshot loop. Every published core event
    /// wakes this via `notify`; bursts inside the 300 ms window
    /// collapse into one trailing delivery because additional
    /// `notify_one` calls during the sleep just keep the single
    /// pending permit set.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            self.publish_snapshot().await;
            tokio::time::sleep(BROADCAST_THROTTLE).await;
        }
    }

    /// Subscribes to the event bus and requests a snapshot on every
    /// event. Runs alongside `run` as an independent tokio task.
    pub async fn watch_events(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(_) => self.notify.notify_one(),
                Err(broadcast::error::RecvError::Lagged(_)) => self.notify.notify_one(),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    async fn harness_with_memory() -> (Arc<Broadcaster>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let agents = Arc::new(AgentRegistry::new(events.clone()));
        let tasks = Arc::new(TaskManager::new(events.clone()));
        let scorer = Arc::new(RlScorer::new());
        let memory = Arc::new(MemoryStore::load(dir.path()).await.unwrap());
        (
            Arc::new(Broadcaster::new(agents, tasks, scorer, memory, events)),
            dir,
        )
    }

    #[tokio::test]
    async fn snapshot_contains_created_task() {
        let (broadcaster, _dir) = harness_with_memory().await;
        broadcaster
            .tasks
            .create(
                "t".into(),
                "d".into(),
                Priority::Medium,
                CreatedBy::User,
                None,
                0,
                PreferredAgent::Auto,
                vec![],
            )
            .await
            .unwrap();
        let snapshot = broadcaster.build_snapshot().await;
        assert_eq!(snapshot.tasks.len(), 1);
    }

    #[tokio::test]
    async fn run_and_watch_coalesce_bursts_into_throttled_deliveries() {
        let (broadcaster, _dir) = harness_with_memory().await;
        let mut rx = broadcaster.subscribe();
        let runner = tokio::spawn(broadcaster.clone().run());
        let watcher = tokio::spawn(broadcaster.clone().watch_events());

        for i in 0..5 {
            broadcaster.events.publish(crate::events::Event::TaskCreated {
                task_id: format!("TASK-{i:04}"),
            });
        }

        let first = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("snapshot within 1s")
            .unwrap();
        assert_eq!(first.tasks.len(), 0);

        runner.abort();
        watcher.abort();
    }
}
