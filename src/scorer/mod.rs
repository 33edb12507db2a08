//! Task categorization, output scoring, and rolling per-agent/
//! per-category performance averages — the reinforcement-learning
//! signal the orchestrator's agent selector reads from.

use crate::models::{CommandOutcome, FileIntent, PerformanceLog, TaskStatus};
use crate::OrchestratorError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::sync::RwLock;

/// Category label -> case-insensitive pattern over title ⊕ description.
/// Order is fixed and matches the categorization contract; more than
/// one label may match a given task.
fn categories() -> &'static Vec<(&'static str, Regex)> {
    static CATEGORIES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    CATEGORIES.get_or_init(|| {
        let specs: &[(&str, &str)] = &[
            ("python", r"(?i)\bpython\b|\.py\b"),
            ("javascript", r"(?i)\bjavascript\b|\bjs\b|\.js\b|\bnode\b"),
            ("web", r"(?i)\bhtml\b|\bcss\b|\bweb\b|\bfrontend\b|\breact\b"),
            ("api", r"(?i)\bapi\b|\bendpoint\b|\brest\b|\bhttp\b"),
            ("test", r"(?i)\btest(s|ing)?\b|\bspec\b|\bassert\b"),
            ("refactor", r"(?i)\brefactor\b|\bcleanup\b|\brewrite\b"),
            ("docs", r"(?i)\bdocs?\b|\bdocumentation\b|\breadme\b"),
            ("devops", r"(?i)\bdocker\b|\bci\b|\bdeploy(ment)?\b|\bpipeline\b"),
            ("data", r"(?i)\bdata\b|\bdatabase\b|\bsql\b|\bcsv\b"),
            ("tool", r"(?i)\btool(ing)?\b|\bscript\b|\bcli\b"),
        ];
        specs
            .iter()
            .map(|(label, pattern)| (*label, Regex::new(pattern).expect("static regex is valid")))
            .collect()
    })
}

/// Classifies a task into category tags from its title and
/// description. Falls back to `general` when nothing matches.
pub fn classify(title: &str, description: &str) -> Vec<String> {
    let haystack = format!("{title} {description}");
    let mut tags: Vec<String> = categories()
        .iter()
        .filter(|(_, re)| re.is_match(&haystack))
        .map(|(label, _)| label.to_string())
        .collect();
    if tags.is_empty() {
        tags.push("general".to_string());
    }
    tags
}

/// Inputs to the completed-task scoring formula.
pub struct ScoringInput<'a> {
    pub files: &'a [FileIntent],
    pub commands: &'a [crate::models::CommandIntent],
    pub outcomes: &'a [CommandOutcome],
    pub raw_text: &'a str,
    pub tokens: u64,
    pub status: TaskStatus,
}

/// Scores a completed task's output, 0–100.
pub fn score(input: &ScoringInput) -> u8 {
    let mut base: i32 = 0;

    if !input.files.is_empty() {
        base += 20 + (5 * input.files.len() as i32).min(20);
    }
    if input.raw_text.contains("FILE") {
        base += 15;
    }

    if !input.commands.is_empty() {
        if !input.outcomes.is_empty() {
            let successful = input.outcomes.iter().filter(|o| o.success).count() as f64;
            let ratio = successful / input.outcomes.len() as f64;
            base += (15.0 * ratio).round() as i32;
        }
    } else {
        base += 10;
    }

    base += match input.tokens {
        1..=499 => 15,
        500..=1999 => 12,
        2000..=4999 => 8,
        5000..=9999 => 4,
        _ => 0,
    };

    if input.status != TaskStatus::Failed {
        base += 15;
    }

    base.clamp(0, 100) as u8
}

/// Score assigned when a task raised before producing a result.
/// Transport-shaped errors (rate-limit, 4xx/5xx, timeout, connection
/// refused) score 25; anything else scores 0.
pub fn failure_score(error: &OrchestratorError) -> u8 {
    if error.is_transport_like() {
        25
    } else {
        0
    }
}

/// Owns the two-level (agent id -> category -> rolling log) mapping
/// and the derived selector inputs (per-category average, recent
/// failure count, overall score).
#[derive(Default)]
pub struct RlScorer {
    performance: RwLock<HashMap<String, HashMap<String, PerformanceLog>>>,
}

impl RlScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `score` to the rolling list for every tag, trimming to
    /// the most recent 20 and recomputing the average.
    pub async fn record_performance(
        &self,
        agent_id: &str,
        tags: &[String],
        score: u8,
        task_id: &str,
    ) {
        let now = chrono::Utc::now();
        let mut perf = self.performance.write().await;
        let by_category = perf.entry(agent_id.to_string()).or_default();
        for tag in tags {
            by_category
                .entry(tag.clone())
                .or_default()
                .record(score, task_id.to_string(), now);
        }
    }

    /// Per-category average for an agent, defaulting to 50 when there
    /// is no history yet (same default as the overall score).
    pub async fn agent_category_score(&self, agent_id: &str, category: &str) -> f64 {
        let perf = self.performance.read().await;
        perf.get(agent_id)
            .and_then(|by_cat| by_cat.get(category))
            .filter(|log| !log.scores.is_empty())
            .map(|log| log.avg)
            .unwrap_or(crate::constants::DEFAULT_OVERALL_SCORE)
    }

    /// Arithmetic mean of per-category averages, or the default
    /// overall score if the agent has no records at all.
    pub async fn overall_score(&self, agent_id: &str) -> f64 {
        let perf = self.performance.read().await;
        match perf.get(agent_id) {
            Some(by_cat) if !by_cat.is_empty() => {
                let sum: f64 = by_cat.values().map(|log| log.avg).sum();
                sum / by_cat.len() as f64
            }
            _ => crate::constants::DEFAULT_OVERALL_SCORE,
        }
    }

    /// Total recorded observations across all categories for an agent
    /// — feeds the selector's exploration bonus.
    pub async fn total_observations(&self, agent_id: &str) -> u32 {
        let perf = self.performance.read().await;
        perf.get(agent_id)
            .map(|by_cat| by_cat.values().map(|log| log.count as u32).sum())
            .unwrap_or(0)
    }

    /// Full two-level map, for the broadcaster's performance summary
    /// and the memory store's periodic persistence.
    pub async fn snapshot(&self) -> HashMap<String, HashMap<String, PerformanceLog>> {
        self.performance.read().await.clone()
    }

    /// Number of scores below the recent-failure threshold among the
    /// 5 most-recent records across all categories for an agent.
    pub async fn recent_failure_count(&self, agent_id: &str) -> u32 {
        let perf = self.performance.read().await;
        let Some(by_cat) = perf.get(agent_id) else {
            return 0;
        };
        let mut all: Vec<&crate::models::PerformanceRecord> =
            by_cat.values().flat_map(|log| log.scores.iter()).collect();
        all.sort_by_key(|r| r.timestamp);
        all.iter()
            .rev()
            .take(crate::constants::RECENT_FAILURE_WINDOW)
            .filter(|r| r.score < crate::constants::RECENT_FAILURE_SCORE_THRESHOLD)
            .count() as u32
    }
}
