use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider kind for a configured agent, per the closed variant set
/// named in the agent configuration surface. Distinct from
/// `backend::BackendKind`, which additionally folds in whether a given
/// `OpenAiCompatible` agent requires streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenAiCompatible,
    Gemini,
    Anthropic,
    CursorBridge,
    CopilotBridge,
}

impl ProviderKind {
    /// Bridge providers are not executable from the core; any attempt
    /// to dispatch to them is rejected before any I/O (`OutOfScope`).
    pub fn is_bridge(self) -> bool {
        matches!(self, ProviderKind::CursorBridge | ProviderKind::CopilotBridge)
    }
}

/// Static configuration for one agent, as deserialized from the
/// agent-definition source named in the external interfaces. The
/// registry turns each of these into an `AgentState` at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub display_name: String,
    pub provider_kind: ProviderKind,
    pub endpoint: Option<String>,
    pub credential_env_var: Option<String>,
    pub model_id: String,
    pub avatar_tag: Option<String>,
    pub role_tag: String,
    pub max_tokens: Option<u32>,
    pub energy_recharge_rate: Option<u32>,
    /// True for OpenAI-compatible hosts where non-streaming responses
    /// must be considered hung (the NVIDIA NIM case). Ignored for
    /// non-OpenAI-compatible provider kinds.
    #[serde(default)]
    pub streaming: bool,
}

/// Runtime status of an agent, independent of its static definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Cooldown,
    Offline,
    Error,
}

/// An agent as the registry holds it: static definition plus the
/// mutable runtime counters. Only the Agent Registry mutates this
/// struct; every other component reads a cloned snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub definition: AgentDefinition,
    pub status: AgentStatus,
    pub energy: u32,
    pub max_energy: u32,
    pub xp: u64,
    pub level: u32,
    pub current_task_id: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub total_tokens_used: u64,
    pub error_count: u32,
    pub tasks_completed: u64,
    /// Resolved credential, if any. Populated by a pure function of
    /// (definition, environment snapshot); never re-read from the
    /// environment by the backend adapter.
    #[serde(skip)]
    pub credential: Option<String>,
}

pub const DEFAULT_MAX_ENERGY: u32 = 100;
pub const DEFAULT_ENERGY_RECHARGE_RATE: u32 = 5;
pub const XP_PER_LEVEL: u64 = 300;

impl AgentState {
    pub fn from_definition(definition: AgentDefinition, credential: Option<String>) -> Self {
        let offline = definition.credential_env_var.is_some() && credential.is_none();
        Self {
            status: if offline {
                AgentStatus::Offline
            } else {
                AgentStatus::Idle
            },
            energy: DEFAULT_MAX_ENERGY,
            max_energy: DEFAULT_MAX_ENERGY,
            xp: 0,
            level: 1,
            current_task_id: None,
            cooldown_until: None,
            total_tokens_used: 0,
            error_count: 0,
            tasks_completed: 0,
            credential,
            definition,
        }
    }

    pub fn recharge_rate(&self) -> u32 {
        self.definition
            .energy_recharge_rate
            .unwrap_or(DEFAULT_ENERGY_RECHARGE_RATE)
    }

    /// Idle, not a bridge provider, and credential resolvable (or not
    /// required) — the dispatch-eligibility predicate used by the
    /// orchestrator's agent selector.
    pub fn is_callable(&self) -> bool {
        self.status == AgentStatus::Idle
            && !self.definition.provider_kind.is_bridge()
            && (self.definition.credential_env_var.is_none() || self.credential.is_some())
    }
}

/// Priority ordering is declaration order: `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Review,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreatedBy {
    User,
    Agent(String),
    Trigger(String),
}

/// An agent id, or the sentinel `"auto"` meaning "let the selector
/// choose". Distinguishing this from a bare `Option<String>` keeps the
/// "auto" string out of match arms scattered across the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredAgent {
    Auto,
    Id(String),
}

impl PreferredAgent {
    pub fn from_str_field(s: &str) -> Self {
        if s.eq_ignore_ascii_case("auto") {
            PreferredAgent::Auto
        } else {
            PreferredAgent::Id(s.to_string())
        }
    }
}

pub const MAX_TASK_DEPTH: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
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
    pub file_paths: Vec<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
}

/// A file the model asked to have written, before the workspace
/// executor has acted on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileIntent {
    pub path: String,
    pub content: String,
}

/// A command the model asked to have run, before the workspace
/// executor has acted on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandIntent {
    pub cwd: String,
    pub cmd: String,
}

/// The recorded outcome of actually running a `CommandIntent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOutcome {
    pub cwd: String,
    pub cmd: String,
    pub success: bool,
    pub output: String,
}

/// A subtask block the model emitted, prior to becoming a real `Task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskIntent {
    pub title: String,
    pub agent: PreferredAgent,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub success: bool,
    pub explanation: String,
    pub raw_text: String,
    pub tokens_used: u64,
    pub agent_display_name: String,
    pub model_id: String,
    pub file_intents: Vec<FileIntent>,
    pub command_intents: Vec<CommandIntent>,
    pub executed_commands: Vec<CommandOutcome>,
    pub perf_score: u8,
    pub task_types: Vec<String>,
}

impl Task {
    pub fn new(
        id: String,
        title: String,
        description: String,
        priority: Priority,
        risk: Risk,
        created_by: CreatedBy,
        parent_task_id: Option<String>,
        depth: u8,
        preferred_agent_id: PreferredAgent,
        file_paths: Vec<String>,
    ) -> Self {
        Self {
            id,
            title,
            description,
            status: TaskStatus::Pending,
            risk,
            priority,
            assigned_agent_id: None,
            created_by,
            parent_task_id,
            depth,
            preferred_agent_id,
            file_paths,
            tags: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

/// One entry in an agent's rolling per-category performance list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub score: u8,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
}

pub const MAX_PERFORMANCE_RECORDS: usize = 20;

/// Rolling per-(agent, category) performance window. `avg` is always
/// the arithmetic mean of `scores`, recomputed on every append.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceLog {
    pub scores: Vec<PerformanceRecord>,
    pub avg: f64,
    pub count: usize,
}

impl PerformanceLog {
    pub fn record(&mut self, score: u8, task_id: String, timestamp: DateTime<Utc>) {
        self.scores.push(PerformanceRecord {
            score,
            task_id,
            timestamp,
        });
        if self.scores.len() > MAX_PERFORMANCE_RECORDS {
            let overflow = self.scores.len() - MAX_PERFORMANCE_RECORDS;
            self.scores.drain(0..overflow);
        }
        self.count = self.scores.len();
        self.avg = if self.scores.is_empty() {
            0.0
        } else {
            let sum: u32 = self.scores.iter().map(|r| r.score as u32).sum();
            (sum as f64 / self.scores.len() as f64).round()
        };
    }
}

pub const MAX_TASK_HISTORY: usize = 50;

/// A durable, trimmed record of one completed/failed task, kept by the
/// Memory Store independent of the live `Task` (which may itself be
/// evicted from the orchestrator's in-memory view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub title: String,
    pub agent_id: String,
    pub agent_display_name: String,
    pub model_id: String,
    pub explanation: String,
    pub file_paths: Vec<String>,
    pub tokens: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

pub const MAX_ACTIVITY_ENTRIES: usize = 100;

/// One entry in the bounded activity ring the Event Bus keeps for
/// `recentActivity(n)` and the broadcaster's activity tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub event_tag: String,
    pub message: String,
}
