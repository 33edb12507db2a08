//! System-wide tuning values. Kept in one place so the orchestrator,
//! backend adapter, and workspace executor agree on the same numbers.

use std::time::Duration;

/// Orchestrator dispatch tick interval.
pub const DISPATCH_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Agent energy recharge tick interval.
pub const RECHARGE_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum number of agents simultaneously in `working` status.
pub const MAX_CONCURRENT_WORKING_AGENTS: usize = 5;

/// Duration an agent stays in cooldown after a rate-limit response
/// that carried no explicit `Retry-After`.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Hard wall-clock deadline for a single backend adapter call.
pub const BACKEND_CALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Hard wall-clock deadline for a single workspace command execution.
pub const COMMAND_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Bytes of combined output retained for a successful command.
pub const COMMAND_OUTPUT_TAIL_BYTES: usize = 500;

/// Bytes of error output retained for a failed command.
pub const COMMAND_ERROR_TAIL_BYTES: usize = 300;

/// Minimum broadcast spacing; a snapshot requested inside this window
/// is coalesced into one trailing delivery.
pub const BROADCAST_THROTTLE: Duration = Duration::from_millis(300);

/// Max chars retained in a light task projection's explanation field.
pub const LIGHT_TASK_EXPLANATION_CHARS: usize = 500;

/// Number of most-recent history entries folded into the adaptive
/// system prompt's "recent memory" context.
pub const PROMPT_RECENT_MEMORY_ENTRIES: usize = 5;

/// Chars of a history entry's output kept in the recent-memory prompt
/// context.
pub const PROMPT_RECENT_MEMORY_OUTPUT_CHARS: usize = 120;

/// Score threshold under which a (agent, category) record counts as a
/// "recent failure" for the selector's penalty term.
pub const RECENT_FAILURE_SCORE_THRESHOLD: u8 = 30;

/// Window size (most-recent records, across all categories) the
/// recent-failure count is computed over.
pub const RECENT_FAILURE_WINDOW: usize = 5;

/// Minimum total observations across tags before the selector's
/// exploration bonus stops applying.
pub const EXPLORATION_BONUS_OBSERVATION_THRESHOLD: u32 = 3;
pub const EXPLORATION_BONUS: f64 = 15.0;
pub const RECENT_FAILURE_PENALTY: f64 = 10.0;

/// Top-N candidates the selector draws a weighted-random choice from.
pub const SELECTOR_TOP_N: usize = 3;

/// Overall score (no records yet) used as the agent's baseline.
pub const DEFAULT_OVERALL_SCORE: f64 = 50.0;
