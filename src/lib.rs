//! # Orchestrator core
//!
//! A multi-model AI agent orchestrator: users submit free-form coding
//! tasks, the core routes each to a registered language-model backend,
//! parses structured output into file writes, shell-command
//! executions, and child-task declarations, tracks per-agent/
//! per-category performance with a reinforcement-learning signal, and
//! fans state changes to subscribers.
//!
//! ## Architecture
//!
//! - **Agent Registry** ([`agents`]): agent configs + runtime state
//! - **Task Manager** ([`tasks`]): task lifecycle + pending queue
//! - **RL Scorer** ([`scorer`]): categorization, scoring, performance logs
//! - **Output Parser** ([`parser`]): structured-output block extraction
//! - **Backend Adapter** ([`backend`]): per-provider chat completion
//! - **Workspace Executor** ([`workspace`]): file writes, command exec
//! - **Memory Store** ([`memory`]): durable task history + audit log
//! - **Event Bus** ([`events`]): in-process publish/subscribe
//! - **Broadcaster** ([`broadcaster`]): throttled snapshot emission
//! - **Orchestrator** ([`orchestrator`]): dispatch loop tying it together

/// Agent registry: configs, runtime state, hot-reload.
pub mod agents;
/// HTTP command surface (ambient transport binding).
pub mod api;
/// Backend adapters: buffered/streaming OpenAI-compatible, thinking-model, bridge.
pub mod backend;
/// Throttled pub/sub snapshot broadcaster.
pub mod broadcaster;
/// Typed application configuration.
pub mod config;
/// System-wide tuning constants.
pub mod constants;
/// Error types shared by every component.
pub mod error;
/// In-process publish/subscribe event bus.
pub mod events;
/// Durable task history and performance-log persistence.
pub mod memory;
/// Core data model types.
pub mod models;
/// Observability: structured logging init, health/metrics surface.
pub mod monitoring;
/// Dispatch loop, agent selection, per-task execution pipeline.
pub mod orchestrator;
/// Structured-output block extraction (FILE/EXEC/SUBTASK).
pub mod parser;
/// Task categorization, scoring, rolling performance averages.
pub mod scorer;
/// Task lifecycle state machine and pending queue.
pub mod tasks;
/// Workspace-confined file writes and command execution.
pub mod workspace;

#[cfg(test)]
mod tests;

pub use error::{OrchestratorError, Result};
