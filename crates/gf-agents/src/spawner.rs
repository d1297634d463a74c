//! Spawning the external agent as a child process.
//!
//! [`AgentSpawner`] is the seam between the executor and the real agent CLI
//! so tests can substitute a scripted spawner. [`ClaudeSpawner`] is the
//! production implementation: it launches the agent in non-interactive
//! print mode with a line-delimited JSON output stream, confirmation
//! prompts disabled, and the task's working directory as cwd. A monitor
//! task owns the child and serves kill requests, so a crashing or killed
//! agent never takes the scheduling process down.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use gf_core::types::ModelTier;
use gf_harness::classifier::AgentError;

/// Binary name of the external agent CLI.
pub const AGENT_BINARY: &str = "claude";

// ---------------------------------------------------------------------------
// SpawnRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub working_dir: String,
    pub execution_prompt: String,
    pub system_prompt: Option<String>,
    pub tier: ModelTier,
}

/// Concrete model the agent runs at each tier.
fn model_for(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Fast => "haiku",
        ModelTier::Balanced => "sonnet",
        ModelTier::Deep => "opus",
    }
}

// ---------------------------------------------------------------------------
// ExitReport
// ---------------------------------------------------------------------------

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code; `None` when the process died to a signal.
    pub exit_code: Option<i32>,
    /// Captured stderr (classification input).
    pub stderr: String,
    /// True when the process was killed through [`SpawnedAgent::kill`].
    pub killed: bool,
}

impl ExitReport {
    pub fn clean() -> Self {
        Self {
            exit_code: Some(0),
            stderr: String::new(),
            killed: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.killed
    }
}

// ---------------------------------------------------------------------------
// SpawnedAgent
// ---------------------------------------------------------------------------

/// Handle to a live agent process.
#[derive(Debug)]
pub struct SpawnedAgent {
    pub id: Uuid,
    pub pid: Option<u32>,
    lines: flume::Receiver<String>,
    exit: flume::Receiver<ExitReport>,
    kill: flume::Sender<()>,
}

impl SpawnedAgent {
    /// Assemble a handle from raw channels (the mock spawners in tests use
    /// this directly).
    pub fn new(
        id: Uuid,
        pid: Option<u32>,
        lines: flume::Receiver<String>,
        exit: flume::Receiver<ExitReport>,
        kill: flume::Sender<()>,
    ) -> Self {
        Self {
            id,
            pid,
            lines,
            exit,
            kill,
        }
    }

    /// Next stdout line, or `None` once the stream has ended.
    pub async fn next_line(&self) -> Option<String> {
        self.lines.recv_async().await.ok()
    }

    /// Ask the monitor to terminate the child. Idempotent, best-effort.
    pub fn kill(&self) {
        let _ = self.kill.try_send(());
    }

    /// Wait for the process to end and collect its exit report.
    pub async fn wait(&self) -> ExitReport {
        self.exit.recv_async().await.unwrap_or_else(|_| ExitReport {
            exit_code: None,
            stderr: String::new(),
            killed: true,
        })
    }
}

// ---------------------------------------------------------------------------
// AgentSpawner trait
// ---------------------------------------------------------------------------

/// Abstraction over agent process spawning so tests can script it.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedAgent, AgentError>;

    /// Name of the binary this spawner launches. Startup recovery uses it
    /// to verify a stale pid still belongs to an agent before killing it.
    fn binary_name(&self) -> &str {
        AGENT_BINARY
    }
}

// ---------------------------------------------------------------------------
// ClaudeSpawner
// ---------------------------------------------------------------------------

/// Production spawner for the agent CLI.
pub struct ClaudeSpawner {
    binary: String,
}

impl ClaudeSpawner {
    pub fn new() -> Self {
        Self {
            binary: AGENT_BINARY.to_string(),
        }
    }

    /// Use a different binary name (tests point this at a stub script).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for ClaudeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentSpawner for ClaudeSpawner {
    fn binary_name(&self) -> &str {
        &self.binary
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedAgent, AgentError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(&request.execution_prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(model_for(request.tier))
            // Headless execution: the agent must never stop to ask.
            .arg("--dangerously-skip-permissions");
        if let Some(system_prompt) = &request.system_prompt {
            cmd.arg("--system-prompt").arg(system_prompt);
        }
        cmd.current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AgentError::Missing {
                binary: self.binary.clone(),
            },
            _ => AgentError::Connect(e.to_string()),
        })?;

        let id = Uuid::new_v4();
        let pid = child.id();
        debug!(agent = %id, pid, "agent process spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Connect("agent stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Connect("agent stderr not captured".to_string()))?;

        let (line_tx, line_rx) = flume::bounded::<String>(256);
        let (exit_tx, exit_rx) = flume::bounded::<ExitReport>(1);
        let (kill_tx, kill_rx) = flume::bounded::<()>(1);

        // Stdout reader: forwards lines until EOF or the executor goes away.
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if line_tx.send_async(line).await.is_err() {
                    break;
                }
            }
        });

        // Monitor: owns the child, serves kill requests, collects stderr
        // and the exit status. A dropped handle counts as a kill request.
        tokio::spawn(async move {
            let mut stderr_reader = stderr;
            let mut stderr_buf = String::new();

            let mut killed = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv_async() => {
                    killed = true;
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "failed to kill agent process");
                    }
                    child.wait().await
                }
            };

            let _ = stderr_reader.read_to_string(&mut stderr_buf).await;
            let report = match status {
                Ok(status) => ExitReport {
                    exit_code: status.code(),
                    stderr: stderr_buf,
                    killed,
                },
                Err(e) => ExitReport {
                    exit_code: None,
                    stderr: format!("{stderr_buf}\nwait failed: {e}"),
                    killed,
                },
            };
            let _ = exit_tx.send_async(report).await;
        });

        Ok(SpawnedAgent::new(id, pid, line_rx, exit_rx, kill_tx))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
