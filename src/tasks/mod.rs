//! Task Manager (§4.8): task lifecycle state machine, monotone id
//! counter, and the priority-ordered pending queue. Exclusive owner of
//! `Task` mutations (§3 "Ownership").

use crate::events::{Event, EventBus};
use crate::models::{CreatedBy, PreferredAgent, Priority, Risk, Task, TaskResult, TaskStatus, MAX_TASK_DEPTH};
use crate::{OrchestratorError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

const MAX_LIVE_TERMINAL_TASKS: usize = 30;

const LOW_RISK_PATH_PATTERNS: &[&str] = &[".md", ".test.", "_test.", ".spec.", "readme", ".d.ts"];
const LOW_RISK_TITLE_KEYWORDS: &[&str] = &["doc", "test", "readme"];

/// Auto-detects risk from file paths and title keywords (§4.8).
pub fn detect_risk(title: &str, file_paths: &[String]) -> Risk {
    let title_lower = title.to_lowercase();
    let title_hit = LOW_RISK_TITLE_KEYWORDS.iter().any(|kw| title_lower.contains(kw));
    let path_hit = file_paths.iter().any(|p| {
        let lower = p.to_lowercase();
        LOW_RISK_PATH_PATTERNS.iter().any(|pat| lower.contains(pat))
    });
    if title_hit || path_hit {
        Risk::Low
    } else {
        Risk::High
    }
}

pub struct TaskManager {
    tasks: RwLock<HashMap<String, Task>>,
    /// Insertion sequence, used as the queue's secondary sort key so
    /// equal-priority tasks stay FIFO.
    order: RwLock<HashMap<String, u64>>,
    next_id: AtomicU64,
    insertion_seq: AtomicU64,
    archived_count: AtomicU32,
    auto_approve_all: std::sync::atomic::AtomicBool,
    events: Arc<EventBus>,
}

impl TaskManager {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            order: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            insertion_seq: AtomicU64::new(0),
            archived_count: AtomicU32::new(0),
            auto_approve_all: std::sync::atomic::AtomicBool::new(false),
            events,
        }
    }

    pub fn set_auto_approve_all(&self, value: bool) {
        self.auto_approve_all.store(value, Ordering::SeqCst);
    }

    pub fn auto_approve_all(&self) -> bool {
        self.auto_approve_all.load(Ordering::SeqCst)
    }

    fn next_task_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("TASK-{n:03}")
    }

    /// Creates a task with monotone id and auto-detected risk (or
    /// forced low under the auto-approve-all flag), enqueuing it
    /// `pending`. Used for both user-submitted and orchestrator-spawned
    /// subtasks (§4.8).
    pub async fn create(
        &self,
        title: String,
        description: String,
        priority: Priority,
        created_by: CreatedBy,
        parent_task_id: Option<String>,
        depth: u8,
        preferred_agent_id: PreferredAgent,
        file_paths: Vec<String>,
    ) -> Result<Task> {
        if depth > MAX_TASK_DEPTH {
            return Err(OrchestratorError::Validation(format!(
                "task depth {depth} exceeds the cap of {MAX_TASK_DEPTH}"
            )));
        }
        let risk = if self.auto_approve_all() {
            Risk::Low
        } else {
            detect_risk(&title, &file_paths)
        };
        let id = self.next_task_id();
        let task = Task::new(
            id.clone(),
            title,
            description,
            priority,
            risk,
            created_by,
            parent_task_id,
            depth,
            preferred_agent_id,
            file_paths,
        );

        let seq = self.insertion_seq.fetch_add(1, Ordering::SeqCst);
        self.tasks.write().await.insert(id.clone(), task.clone());
        self.order.write().await.insert(id.clone(), seq);
        self.events.publish(Event::TaskCreated { task_id: id });
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// Attaches the backend/parser result to a task, ahead of the
    /// status transition that follows it in the execution pipeline
    /// (§4.9 step 4).
    pub async fn attach_result(&self, id: &str, result: TaskResult) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        task.result = Some(result);
        Ok(())
    }

    pub async fn list(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Pending tasks sorted by priority (critical first) then
    /// insertion order.
    pub async fn pending_ordered(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let order = self.order.read().await;
        let mut pending: Vec<&Task> = tasks.values().filter(|t| t.status == TaskStatus::Pending).collect();
        pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| order.get(&a.id).cmp(&order.get(&b.id)))
        });
        pending.into_iter().cloned().collect()
    }

    /// pending -> active (assignment). Sets `assignedAgentId` and
    /// `startedAt` together, per the Task invariant in §3.
    pub async fn assign(&self, id: &str, agent_id: &str) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(OrchestratorError::InvalidTransition(format!(
                "{id} is {:?}, expected pending",
                task.status
            )));
        }
        task.status = TaskStatus::Active;
        task.assigned_agent_id = Some(agent_id.to_string());
        task.started_at = Some(chrono::Utc::now());
        let snapshot = task.clone();
        drop(tasks);
        self.events.publish(Event::TaskDispatched {
            task_id: id.to_string(),
            agent_id: agent_id.to_string(),
        });
        Ok(snapshot)
    }

    /// pending -> cancelled (reject before pickup).
    pub async fn cancel_pending(&self, id: &str) -> Result<()> {
        self.transition_to(id, TaskStatus::Pending, TaskStatus::Cancelled, true).await?;
        self.events.publish(Event::TaskRejected { task_id: id.to_string() });
        Ok(())
    }

    /// active -> completed (auto-apply) or active -> review (high risk).
    pub async fn complete_or_review(&self, id: &str, review: bool, tags: Vec<String>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Active {
            return Err(OrchestratorError::InvalidTransition(format!(
                "{id} is {:?}, expected active",
                task.status
            )));
        }
        task.tags = tags;
        task.status = if review { TaskStatus::Review } else { TaskStatus::Completed };
        if !review {
            task.completed_at = Some(chrono::Utc::now());
        }
        drop(tasks);
        self.evict_terminal_overflow().await;
        if review {
            self.events.publish(Event::TaskReview { task_id: id.to_string() });
        } else {
            self.events.publish(Event::TaskCompleted { task_id: id.to_string() });
        }
        Ok(())
    }

    /// active -> failed (exception).
    pub async fn fail(&self, id: &str, message: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        task.status = TaskStatus::Failed;
        task.completed_at = Some(chrono::Utc::now());
        drop(tasks);
        self.evict_terminal_overflow().await;
        self.events.publish(Event::TaskFailed {
            task_id: id.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    /// review -> completed (approval: side-effects applied by the
    /// caller before/around this call).
    pub async fn approve(&self, id: &str) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Review {
            return Err(OrchestratorError::InvalidTransition(format!(
                "{id} is {:?}, expected review",
                task.status
            )));
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(chrono::Utc::now());
        let snapshot = task.clone();
        drop(tasks);
        self.evict_terminal_overflow().await;
        self.events.publish(Event::TaskApproved { task_id: id.to_string() });
        Ok(snapshot)
    }

    /// review -> cancelled (rejection: no side effects).
    pub async fn reject(&self, id: &str) -> Result<()> {
        self.transition_to(id, TaskStatus::Review, TaskStatus::Cancelled, true).await?;
        self.events.publish(Event::TaskRejected { task_id: id.to_string() });
        Ok(())
    }

    async fn transition_to(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        set_completed_at: bool,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if task.status != from {
            return Err(OrchestratorError::InvalidTransition(format!(
                "{id} is {:?}, expected {from:?}",
                task.status
            )));
        }
        task.status = to;
        if set_completed_at {
            task.completed_at = Some(chrono::Utc::now());
        }
        drop(tasks);
        self.evict_terminal_overflow().await;
        Ok(())
    }

    /// Evicts terminal tasks beyond the 30th from the live view,
    /// retaining an archived counter for aggregate stats (§4.8).
    async fn evict_terminal_overflow(&self) {
        let mut tasks = self.tasks.write().await;
        let mut terminal: Vec<(String, chrono::DateTime<chrono::Utc>)> = tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled))
            .map(|t| (t.id.clone(), t.completed_at.unwrap_or(t.created_at)))
            .collect();
        if terminal.len() <= MAX_LIVE_TERMINAL_TASKS {
            return;
        }
        terminal.sort_by_key(|(_, ts)| *ts);
        let overflow = terminal.len() - MAX_LIVE_TERMINAL_TASKS;
        let mut order = self.order.write().await;
        for (id, _) in terminal.into_iter().take(overflow) {
            tasks.remove(&id);
            order.remove(&id);
            self.archived_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn archived_count(&self) -> u32 {
        self.archived_count.load(Ordering::SeqCst)
    }
}
