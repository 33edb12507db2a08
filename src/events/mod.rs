//! In-process publish/subscribe decoupling producers (registry, task
//! manager, orchestrator, executor) from consumers (broadcaster,
//! memory auditor). See `models::ActivityEntry` for the persisted
//! shape of each event.

use crate::models::{AgentStatus, ActivityEntry, MAX_ACTIVITY_ENTRIES};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Typed events flowing through the bus. Consumers match on this
/// rather than a wildcard/stringly-typed channel (§9 "wildcard
/// listeners").
#[derive(Debug, Clone)]
pub enum Event {
    AgentStatusChanged {
        agent_id: String,
        status: AgentStatus,
    },
    AgentWorking {
        agent_id: String,
        task_id: String,
    },
    AgentXpGained {
        agent_id: String,
        xp: u64,
        level: u32,
    },
    AgentCompleted {
        agent_id: String,
        task_id: String,
    },
    AgentError {
        agent_id: String,
        task_id: Option<String>,
        message: String,
    },
    TaskCreated {
        task_id: String,
    },
    TaskDispatched {
        task_id: String,
        agent_id: String,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        message: String,
    },
    TaskReview {
        task_id: String,
    },
    TaskApproved {
        task_id: String,
    },
    TaskRejected {
        task_id: String,
    },
    FileWritten {
        task_id: String,
        path: String,
    },
    FileRejected {
        task_id: String,
        path: String,
    },
    ExecDone {
        task_id: String,
        cmd: String,
        success: bool,
    },
    RlScored {
        agent_id: String,
        task_id: String,
        score: u8,
    },
}

impl Event {
    pub fn tag(&self) -> &'static str {
        match self {
            Event::AgentStatusChanged { .. } => "agent:status",
            Event::AgentWorking { .. } => "agent:working",
            Event::AgentXpGained { .. } => "agent:xp-gained",
            Event::AgentCompleted { .. } => "agent:completed",
            Event::AgentError { .. } => "agent:error",
            Event::TaskCreated { .. } => "task:created",
            Event::TaskDispatched { .. } => "task:dispatched",
            Event::TaskCompleted { .. } => "task:completed",
            Event::TaskFailed { .. } => "task:failed",
            Event::TaskReview { .. } => "task:review",
            Event::TaskApproved { .. } => "task:approved",
            Event::TaskRejected { .. } => "task:rejected",
            Event::FileWritten { .. } => "exec:file-written",
            Event::FileRejected { .. } => "exec:file-rejected",
            Event::ExecDone { .. } => "exec:done",
            Event::RlScored { .. } => "rl:scored",
        }
    }

    fn agent_id(&self) -> String {
        match self {
            Event::AgentStatusChanged { agent_id, .. }
            | Event::AgentWorking { agent_id, .. }
            | Event::AgentXpGained { agent_id, .. }
            | Event::AgentCompleted { agent_id, .. }
            | Event::RlScored { agent_id, .. } => agent_id.clone(),
            Event::AgentError { agent_id, .. } => agent_id.clone(),
            _ => "system".to_string(),
        }
    }

    fn message(&self) -> String {
        match self {
            Event::AgentStatusChanged { status, .. } => format!("status -> {status:?}"),
            Event::AgentWorking { task_id, .. } => format!("started {task_id}"),
            Event::AgentXpGained { xp, level, .. } => format!("xp={xp} level={level}"),
            Event::AgentCompleted { task_id, .. } => format!("completed {task_id}"),
            Event::AgentError { message, .. } => message.clone(),
            Event::TaskCreated { task_id } => format!("{task_id} created"),
            Event::TaskDispatched { task_id, agent_id } => {
                format!("{task_id} dispatched to {agent_id}")
            }
            Event::TaskCompleted { task_id } => format!("{task_id} completed"),
            Event::TaskFailed { task_id, message } => format!("{task_id} failed: {message}"),
            Event::TaskReview { task_id } => format!("{task_id} awaiting review"),
            Event::TaskApproved { task_id } => format!("{task_id} approved"),
            Event::TaskRejected { task_id } => format!("{task_id} rejected"),
            Event::FileWritten { path, .. } => format!("wrote {path}"),
            Event::FileRejected { path, .. } => format!("rejected path {path}"),
            Event::ExecDone { cmd, success, .. } => format!("`{cmd}` success={success}"),
            Event::RlScored { task_id, score, .. } => format!("{task_id} scored {score}"),
        }
    }
}

struct Ring {
    entries: VecDeque<ActivityEntry>,
    next_id: u64,
}

/// Bounded activity ring plus a best-effort broadcast fanout.
///
/// Delivery is synchronous from the publisher's thread; a slow
/// subscriber drops messages (via `tokio::sync::broadcast`'s lagged
/// semantics) rather than back-pressuring the publisher.
pub struct EventBus {
    ring: Mutex<Ring>,
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(MAX_ACTIVITY_ENTRIES),
                next_id: 1,
            }),
            sender,
        }
    }

    pub fn publish(&self, event: Event) {
        let tag = event.tag();
        let agent_id = event.agent_id();
        let message = event.message();
        debug!(event = tag, agent = %agent_id, "event published");

        {
            let mut ring = self.ring.lock().expect("event ring lock poisoned");
            let id = ring.next_id;
            ring.next_id += 1;
            ring.entries.push_back(ActivityEntry {
                id,
                timestamp: Utc::now(),
                agent_id,
                event_tag: tag.to_string(),
                message,
            });
            if ring.entries.len() > MAX_ACTIVITY_ENTRIES {
                ring.entries.pop_front();
            }
        }

        // No receivers is not an error: subscribers attach lazily.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn recent_activity(&self, n: usize) -> Vec<ActivityEntry> {
        let ring = self.ring.lock().expect("event ring lock poisoned");
        let len = ring.entries.len();
        let skip = len.saturating_sub(n);
        ring.entries.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_caps_at_max_entries() {
        let bus = EventBus::new();
        for i in 0..(MAX_ACTIVITY_ENTRIES + 20) {
            bus.publish(Event::TaskCreated {
                task_id: format!("TASK-{i:04}"),
            });
        }
        assert_eq!(bus.recent_activity(usize::MAX).len(), MAX_ACTIVITY_ENTRIES);
    }

    #[test]
    fn recent_activity_returns_most_recent_last() {
        let bus = EventBus::new();
        bus.publish(Event::TaskCreated {
            task_id: "TASK-0001".to_string(),
        });
        bus.publish(Event::TaskCreated {
            task_id: "TASK-0002".to_string(),
        });
        let recent = bus.recent_activity(1);
        assert_eq!(recent.len(), 1);
        assert!(recent[0].message.contains("TASK-0002"));
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::TaskCreated {
            task_id: "TASK-0001".to_string(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.tag(), "task:created");
    }
}
