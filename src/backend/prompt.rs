//! Adaptive system prompt composition (§4.6): role preamble + matched
//! skill templates + a performance-driven hint + recent-memory
//! context + the structured-output marker contract.

use crate::constants::{PROMPT_RECENT_MEMORY_ENTRIES, PROMPT_RECENT_MEMORY_OUTPUT_CHARS};
use crate::models::TaskHistoryEntry;

fn role_preamble(role_tag: &str) -> &'static str {
    match role_tag {
        "developer" => {
            "You are a software developer. Write correct, complete, runnable code."
        }
        "reviewer" => {
            "You review code for correctness, security, and maintainability before it ships."
        }
        "planner" => "You break work into small, well-scoped subtasks and coordinate agents.",
        "qa" => "You write and run tests to verify behavior matches the stated requirements.",
        "docs" => "You write clear, accurate documentation for the code you are given.",
        _ => "You are a capable software engineering assistant.",
    }
}

const SKILLS: &[(&[&str], &str)] = &[
    (
        &["python", ".py"],
        "Follow PEP 8. Prefer standard-library solutions over new dependencies.",
    ),
    (
        &["javascript", "typescript", "node", ".js", ".ts"],
        "Use modern ES module syntax. Avoid unnecessary external packages.",
    ),
    (
        &["test", "testing", "spec"],
        "Include test coverage for any new logic you introduce.",
    ),
    (
        &["api", "endpoint", "rest"],
        "Document request and response shapes for any endpoint you add or change.",
    ),
    (
        &["docker", "deploy", "ci", "pipeline"],
        "Keep deployment configuration minimal and explain any new environment variables.",
    ),
];

fn matched_skills(task_description: &str) -> Vec<&'static str> {
    let lower = task_description.to_lowercase();
    SKILLS
        .iter()
        .filter(|(triggers, _)| triggers.iter().any(|t| lower.contains(t)))
        .map(|(_, template)| *template)
        .collect()
}

/// One of three adaptive hints, or none if the agent's recent record
/// doesn't cross any threshold.
fn adaptive_hint(overall_score: f64, recent_failures: u32) -> Option<&'static str> {
    if recent_failures >= 3 {
        Some(
            "You have had several recent low-scoring outputs. Strictly follow the FILE/EXEC/SUBTASK \
             block format below — do not deviate from the literal markers.",
        )
    } else if overall_score < 40.0 {
        Some(
            "Your recent output quality has been below target. Double-check that your response \
             uses the structured-output markers correctly.",
        )
    } else if overall_score >= 75.0 {
        Some(
            "Your recent output has been strong. You have latitude to propose additional \
             improvements via SUBTASK blocks where appropriate.",
        )
    } else {
        None
    }
}

fn recent_memory_context(history: &[TaskHistoryEntry]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut lines = vec!["Recent task history:".to_string()];
    for entry in history.iter().rev().take(PROMPT_RECENT_MEMORY_ENTRIES) {
        let truncated: String = entry
            .explanation
            .chars()
            .take(PROMPT_RECENT_MEMORY_OUTPUT_CHARS)
            .collect();
        lines.push(format!(
            "- [{}] {} ({}): \"{}\" files={:?}",
            entry.agent_display_name, entry.task_id, entry.title, truncated, entry.file_paths
        ));
    }
    lines.join("\n")
}

const MARKER_CONTRACT: &str = r#"Structured output format. To write a file, emit exactly:
FILE
path: <relative path>
CONTENT
<file content, byte for byte>
END_FILE

To run a command, emit exactly:
EXEC
cwd: <relative directory>
cmd: <single command line>
END_EXEC

To propose follow-up work, emit exactly:
SUBTASK
title: <short title>
agent: <agent id or "auto">
description: <multi-line description>
END_SUBTASK

Any code you include must be complete and runnable, not a fragment."#;

pub struct PromptContext<'a> {
    pub agent_display_name: &'a str,
    pub role_tag: &'a str,
    pub task_description: &'a str,
    pub overall_score: f64,
    pub recent_failures: u32,
    pub recent_history: &'a [TaskHistoryEntry],
}

pub fn compose_system_prompt(ctx: &PromptContext) -> String {
    let mut sections = vec![
        format!("You are {}.", ctx.agent_display_name),
        role_preamble(ctx.role_tag).to_string(),
    ];

    let skills = matched_skills(ctx.task_description);
    if !skills.is_empty() {
        sections.push(skills.join(" "));
    }

    if let Some(hint) = adaptive_hint(ctx.overall_score, ctx.recent_failures) {
        sections.push(hint.to_string());
    }

    let memory = recent_memory_context(ctx.recent_history);
    if !memory.is_empty() {
        sections.push(memory);
    }

    sections.push(MARKER_CONTRACT.to_string());
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(task_description: &'a str, overall: f64, failures: u32) -> PromptContext<'a> {
        PromptContext {
            agent_display_name: "Dev Agent",
            role_tag: "developer",
            task_description,
            overall_score: overall,
            recent_failures: failures,
            recent_history: &[],
        }
    }

    #[test]
    fn includes_role_preamble_and_markers() {
        let prompt = compose_system_prompt(&ctx("write a function", 50.0, 0));
        assert!(prompt.contains("software developer"));
        assert!(prompt.contains("END_FILE"));
    }

    #[test]
    fn matches_skill_triggers_case_insensitively() {
        let prompt = compose_system_prompt(&ctx("Write a PYTHON script", 50.0, 0));
        assert!(prompt.contains("PEP 8"));
    }

    #[test]
    fn strict_format_hint_wins_over_low_score_hint() {
        let prompt = compose_system_prompt(&ctx("anything", 10.0, 3));
        assert!(prompt.contains("Strictly follow"));
    }

    #[test]
    fn initiative_hint_for_high_scorers() {
        let prompt = compose_system_prompt(&ctx("anything", 80.0, 0));
        assert!(prompt.contains("latitude"));
    }

    #[test]
    fn no_hint_in_the_middle_band() {
        let prompt = compose_system_prompt(&ctx("anything", 55.0, 1));
        assert!(!prompt.contains("Strictly follow"));
        assert!(!prompt.contains("latitude"));
        assert!(!prompt.contains("below target"));
    }
}
