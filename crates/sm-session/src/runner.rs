use thiserror::Error;
use tracing::{debug, info};

use sm_core::types::Task;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("multiplexer command failed: {0}")]
    MuxCommand(String),
    #[error("spawn failed for session {session}: {stderr}")]
    SpawnFailed { session: String, stderr: String },
    #[error("session not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

// ---------------------------------------------------------------------------
// MuxRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over terminal-multiplexer invocations so they can be
/// mocked in tests. The multiplexer itself is opaque to the orchestrator.
pub trait MuxRunner: Send + Sync {
    fn run_mux(&self, args: &[&str]) -> std::result::Result<MuxOutput, String>;
}

#[derive(Debug, Clone)]
pub struct MuxOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl MuxOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Real runner shelling out to the `tmux` binary.
pub struct TmuxRunner;

impl MuxRunner for TmuxRunner {
    fn run_mux(&self, args: &[&str]) -> std::result::Result<MuxOutput, String> {
        let output = std::process::Command::new("tmux")
            .args(args)
            .output()
            .map_err(|e| e.to_string())?;
        Ok(MuxOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// SessionRunner
// ---------------------------------------------------------------------------

/// Spawns one detached terminal session per task, hosting the agent CLI
/// inside the task's working copy. Sessions are never tailed on the hot
/// path; output is captured only on demand for display.
pub struct SessionRunner {
    mux: Box<dyn MuxRunner>,
    agent_command: String,
}

impl SessionRunner {
    pub fn new(agent_command: impl Into<String>) -> Self {
        Self {
            mux: Box::new(TmuxRunner),
            agent_command: agent_command.into(),
        }
    }

    /// Create a runner with a custom multiplexer (for testing).
    pub fn with_mux(agent_command: impl Into<String>, mux: Box<dyn MuxRunner>) -> Self {
        Self {
            mux,
            agent_command: agent_command.into(),
        }
    }

    /// Deterministic session name for a task: `<id>-<branch>`, sanitized
    /// for the multiplexer's naming rules.
    pub fn session_name_for(task: &Task) -> String {
        sanitize_session_name(&format!("{}-{}", task.id, task.branch))
    }

    /// Launch the agent in a new detached session rooted in `workdir`.
    /// Fails fast on a nonzero spawn exit code.
    pub fn spawn(&self, task: &Task, workdir: &str, status_dir: &str) -> Result<String> {
        let session = Self::session_name_for(task);
        let prompt = compose_prompt(task, &session, status_dir);

        info!(
            task_id = %task.id,
            session = %session,
            workdir,
            "spawning agent session"
        );

        let out = self
            .mux
            .run_mux(&[
                "new-session",
                "-d",
                "-s",
                &session,
                "-c",
                workdir,
                &self.agent_command,
                &prompt,
            ])
            .map_err(SessionError::MuxCommand)?;

        if !out.success {
            return Err(SessionError::SpawnFailed {
                session,
                stderr: out.stderr,
            });
        }
        Ok(session)
    }

    pub fn kill(&self, session: &str) -> Result<()> {
        debug!(session, "killing session");
        let out = self
            .mux
            .run_mux(&["kill-session", "-t", session])
            .map_err(SessionError::MuxCommand)?;
        // Killing an already-dead session is not an error worth surfacing.
        if !out.success && !out.stderr.contains("can't find session") {
            return Err(SessionError::MuxCommand(out.stderr));
        }
        Ok(())
    }

    /// Shell command the UI can hand to a terminal emulator to attach.
    pub fn attach_command(&self, session: &str) -> String {
        format!("tmux attach-session -t {session}")
    }

    /// Names of all currently live sessions. A missing multiplexer server
    /// means no sessions.
    pub fn list_live(&self) -> Result<Vec<String>> {
        let out = self
            .mux
            .run_mux(&["list-sessions", "-F", "#{session_name}"])
            .map_err(SessionError::MuxCommand)?;
        if !out.success {
            if out.stderr.contains("no server running") || out.stderr.contains("No such file") {
                return Ok(Vec::new());
            }
            return Err(SessionError::MuxCommand(out.stderr));
        }
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Scrape the visible contents of a session's pane for display.
    pub fn capture_log(&self, session: &str) -> Result<String> {
        let out = self
            .mux
            .run_mux(&["capture-pane", "-p", "-t", session])
            .map_err(SessionError::MuxCommand)?;
        if !out.success {
            return Err(SessionError::NotFound(session.to_string()));
        }
        Ok(out.stdout)
    }
}

// ---------------------------------------------------------------------------
// Prompt composition
// ---------------------------------------------------------------------------

/// Compose the full instruction handed to the agent CLI: the task's own
/// prompt (or a default template from title + description), preceded by
/// the coordination preamble and followed by the completion contract.
pub fn compose_prompt(task: &Task, session: &str, status_dir: &str) -> String {
    let body = match &task.prompt {
        Some(custom) => custom.clone(),
        None => format!(
            "You are working on the task below inside an isolated git worktree.\n\
             Commit your work to the current branch as you go.\n\n\
             Task: {}\n\
             Description: {}",
            task.title,
            if task.description.is_empty() {
                "(none)"
            } else {
                &task.description
            }
        ),
    };

    format!(
        "{preamble}\n\n{body}\n\n{postamble}",
        preamble = coordination_preamble(task, session),
        body = body,
        postamble = completion_postamble(session, status_dir),
    )
}

fn coordination_preamble(task: &Task, session: &str) -> String {
    format!(
        "Before anything else, register with the coordination service:\n\
         call the `register_agent` operation with session_name={session}, \
         task_id={id}, branch={branch}.\n\
         Send `heartbeat` periodically while you work. Before editing any \
         file, call `announce_file_change` for it and release the lock with \
         `release_file_lock` when done.",
        id = task.id,
        branch = task.branch,
    )
}

fn completion_postamble(session: &str, status_dir: &str) -> String {
    format!(
        "When the task is finished: call `mark_task_completed`, then write \
         a file at {status_dir}/{session}.status containing the single line \
         COMPLETED. If you cannot finish, write FAILED:<short reason> instead."
    )
}

/// Multiplexer session names must avoid `:` and `.`; keep to word
/// characters and hyphens.
fn sanitize_session_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
