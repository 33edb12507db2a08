//! Memory Store (§4.2): a JSON document (task history + per-agent
//! performance log) and an append-only markdown audit trail, both
//! under a conventional directory. Writes are eventually durable but
//! not transactional; the JSON document is rewritten write-temp-then-
//! rename so a crash mid-write never leaves a partially written file.

use crate::models::{PerformanceLog, TaskHistoryEntry, MAX_TASK_HISTORY};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The JSON document persisted under the memory directory. `facts` and
/// `decisions` are free-form notes a future host surface may populate;
/// the core only ever reads/writes `task_history` and
/// `performance_log` through this store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDocument {
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub task_history: HashMap<String, TaskHistoryEntry>,
    #[serde(default)]
    pub agent_stats: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub performance_log: HashMap<String, HashMap<String, PerformanceLog>>,
}

pub struct MemoryStore {
    dir: PathBuf,
    document: Mutex<MemoryDocument>,
}

const JSON_FILE: &str = "memory.json";
const AUDIT_FILE: &str = "audit.log.md";

impl MemoryStore {
    /// Loads the store from `dir`, tolerating missing or partially
    /// empty files by returning defaults.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let json_path = dir.join(JSON_FILE);
        let document = match tokio::fs::read_to_string(&json_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("memory.json malformed ({e}), starting from defaults");
                MemoryDocument::default()
            }),
            Err(_) => MemoryDocument::default(),
        };

        Ok(Self {
            dir,
            document: Mutex::new(document),
        })
    }

    /// Snapshot of the task history, most-recent last.
    pub async fn task_history(&self) -> Vec<TaskHistoryEntry> {
        let doc = self.document.lock().await;
        let mut entries: Vec<TaskHistoryEntry> = doc.task_history.values().cloned().collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    pub async fn performance_log(&self) -> HashMap<String, HashMap<String, PerformanceLog>> {
        self.document.lock().await.performance_log.clone()
    }

    /// Records a completed/failed task's history entry and appends the
    /// audit-log line. Enforces the 50-entry cap by dropping the
    /// oldest-by-timestamp on every save.
    pub async fn record_task(&self, entry: TaskHistoryEntry) -> Result<()> {
        let mut doc = self.document.lock().await;
        doc.task_history.insert(entry.task_id.clone(), entry.clone());

        if doc.task_history.len() > MAX_TASK_HISTORY {
            let mut by_time: Vec<(String, chrono::DateTime<Utc>)> = doc
                .task_history
                .iter()
                .map(|(id, e)| (id.clone(), e.timestamp))
                .collect();
            by_time.sort_by_key(|(_, ts)| *ts);
            let overflow = doc.task_history.len() - MAX_TASK_HISTORY;
            for (id, _) in by_time.into_iter().take(overflow) {
                doc.task_history.remove(&id);
            }
        }

        self.write_document(&doc).await?;
        self.append_audit_line(&entry).await?;
        debug!(task_id = %entry.task_id, "memory store recorded task");
        Ok(())
    }

    /// Replaces the stored performance log snapshot (the RL Scorer
    /// remains the source of truth in-process; the store only
    /// persists it).
    pub async fn save_performance_log(
        &self,
        log: HashMap<String, HashMap<String, PerformanceLog>>,
    ) -> Result<()> {
        let mut doc = self.document.lock().await;
        doc.performance_log = log;
        self.write_document(&doc).await
    }

    async fn write_document(&self, doc: &MemoryDocument) -> Result<()> {
        let json_path = self.dir.join(JSON_FILE);
        let tmp_path = self.dir.join(format!("{JSON_FILE}.tmp"));
        let serialized = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&tmp_path, serialized).await?;
        tokio::fs::rename(&tmp_path, &json_path).await?;
        Ok(())
    }

    async fn append_audit_line(&self, entry: &TaskHistoryEntry) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let audit_path = self.dir.join(AUDIT_FILE);
        let line = format!(
            "- `{}` **{}** via {} ({}) — success={} tokens={} files={:?} @ {}\n",
            entry.task_id,
            entry.title,
            entry.agent_display_name,
            entry.model_id,
            entry.success,
            entry.tokens,
            entry.file_paths,
            entry.timestamp.to_rfc3339(),
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MemoryDocument {
    /// Builds a `TaskHistoryEntry`, truncating the explanation to the
    /// 500-char cap named in §3.
    pub fn truncated_entry(
        task_id: String,
        title: String,
        agent_id: String,
        agent_display_name: String,
        model_id: String,
        explanation: &str,
        file_paths: Vec<String>,
        tokens: u64,
        success: bool,
    ) -> TaskHistoryEntry {
        let explanation: String = explanation.chars().take(500).collect();
        TaskHistoryEntry {
            task_id,
            title,
            agent_id,
            agent_display_name,
            model_id,
            explanation,
            file_paths,
            tokens,
            success,
            timestamp: Utc::now(),
        }
    }
}
