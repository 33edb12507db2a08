//! Workspace Executor (§4.7): applies a task's `FileIntent`s and
//! `CommandIntent`s under a single confined root. Path escapes are
//! dropped, not fatal; command timeouts kill the whole process group.

use crate::events::{Event, EventBus};
use crate::models::{CommandIntent, CommandOutcome, FileIntent};
use crate::{OrchestratorError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{info, warn};

pub struct WorkspaceExecutor {
    root: PathBuf,
    events: std::sync::Arc<EventBus>,
}

impl WorkspaceExecutor {
    pub fn new(root: impl Into<PathBuf>, events: std::sync::Arc<EventBus>) -> Self {
        Self {
            root: root.into(),
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `path` under the root, rejecting any normalization that
    /// escapes it (`..` components climbing past the root, or an
    /// absolute path).
    fn resolve_confined(&self, path: &str) -> Option<PathBuf> {
        if Path::new(path).is_absolute() {
            return None;
        }
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            use std::path::Component;
            match component {
                Component::Normal(seg) => resolved.push(seg),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() || !resolved.starts_with(&self.root) {
                        return None;
                    }
                }
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if resolved.starts_with(&self.root) {
            Some(resolved)
        } else {
            None
        }
    }

    /// Writes every file intent under the confined root. Escaping
    /// paths are dropped with a published activity entry rather than
    /// failing the task (§4.7 Open Question resolved).
    pub async fn write_files(&self, task_id: &str, files: &[FileIntent]) -> Result<Vec<String>> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut written = Vec::with_capacity(files.len());
        for file in files {
            let Some(resolved) = self.resolve_confined(&file.path) else {
                warn!(task_id, path = %file.path, "rejected file write outside workspace root");
                self.events.publish(Event::FileRejected {
                    task_id: task_id.to_string(),
                    path: file.path.clone(),
                });
                continue;
            };
            if let Some(parent) = resolved.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| OrchestratorError::FileWriteFailure {
                    path: file.path.clone(),
                    message: e.to_string(),
                })?;
            }
            tokio::fs::write(&resolved, &file.content).await.map_err(|e| OrchestratorError::FileWriteFailure {
                path: file.path.clone(),
                message: e.to_string(),
            })?;
            info!(task_id, path = %file.path, "wrote file");
            self.events.publish(Event::FileWritten {
                task_id: task_id.to_string(),
                path: file.path.clone(),
            });
            written.push(file.path.clone());
        }
        Ok(written)
    }

    /// Runs every command intent sequentially, in the order the model
    /// emitted them (§5 "Ordering guarantees"). Each command gets a
    /// 120-second wall-clock deadline and a fresh process group so a
    /// timeout can kill the whole tree.
    pub async fn run_commands(&self, task_id: &str, commands: &[CommandIntent]) -> Result<Vec<CommandOutcome>> {
        let mut outcomes = Vec::with_capacity(commands.len());
        for cmd in commands {
            let outcome = self.run_one(cmd).await;
            self.events.publish(Event::ExecDone {
                task_id: task_id.to_string(),
                cmd: cmd.cmd.clone(),
                success: outcome.success,
            });
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run_one(&self, intent: &CommandIntent) -> CommandOutcome {
        let Some(cwd) = self.resolve_confined(&intent.cwd) else {
            return CommandOutcome {
                cwd: intent.cwd.clone(),
                cmd: intent.cmd.clone(),
                success: false,
                output: "cwd escapes the workspace root".to_string(),
            };
        };
        if let Err(e) = tokio::fs::create_dir_all(&cwd).await {
            return CommandOutcome {
                cwd: intent.cwd.clone(),
                cmd: intent.cmd.clone(),
                success: false,
                output: format!("failed to create cwd: {e}"),
            };
        }

        let mut command = new_shell_command(&intent.cmd);
        command.current_dir(&cwd).stdout(Stdio::piped()).stderr(Stdio::piped());
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc_setsid();
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return CommandOutcome {
                    cwd: intent.cwd.clone(),
                    cmd: intent.cmd.clone(),
                    success: false,
                    output: format!("failed to spawn: {e}"),
                };
            }
        };
        let pid = child.id();

        match tokio::time::timeout(crate::constants::COMMAND_EXEC_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let success = output.status.success();
                let tail = if success {
                    tail_bytes(&output.stdout, crate::constants::COMMAND_OUTPUT_TAIL_BYTES)
                } else {
                    tail_bytes(&output.stderr, crate::constants::COMMAND_ERROR_TAIL_BYTES)
                };
                CommandOutcome {
                    cwd: intent.cwd.clone(),
                    cmd: intent.cmd.clone(),
                    success,
                    output: tail,
                }
            }
            Ok(Err(e)) => CommandOutcome {
                cwd: intent.cwd.clone(),
                cmd: intent.cmd.clone(),
                success: false,
                output: format!("command wait failed: {e}"),
            },
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                CommandOutcome {
                    cwd: intent.cwd.clone(),
                    cmd: intent.cmd.clone(),
                    success: false,
                    output: format!(
                        "command exceeded {}s timeout",
                        crate::constants::COMMAND_EXEC_TIMEOUT.as_secs()
                    ),
                }
            }
        }
    }
}

fn new_shell_command(cmd: &str) -> tokio::process::Command {
    #[cfg(unix)]
    {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    }
    #[cfg(not(unix))]
    {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    }
}

#[cfg(unix)]
fn libc_setsid() -> i32 {
    // SAFETY: called only in the forked child before exec, per
    // `pre_exec`'s contract; setsid() detaches the child into its own
    // process group so `kill_process_group` can reach its descendants.
    unsafe { libc::setsid() }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: signals the process group headed by `pid`, which was
    // placed in its own group by `setsid` above.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn tail_bytes(data: &[u8], max: usize) -> String {
    let start = data.len().saturating_sub(max);
    String::from_utf8_lossy(&data[start..]).to_string()
}
