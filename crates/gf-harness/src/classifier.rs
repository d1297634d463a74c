//! Error classification for agent invocation failures.
//!
//! [`classify`] is a pure function from an [`AgentError`] value to a
//! [`Classified`] record: the failure kind, whether retry is policy-correct,
//! a suggested HTTP status, a human description, and a recovery hint. The
//! environment probe in [`probe_environment`] is descriptive only and never
//! influences the kind decision.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AgentError
// ---------------------------------------------------------------------------

/// Failure raised while invoking the external agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent binary `{binary}` not found in PATH")]
    Missing { binary: String },
    #[error("agent connection failed: {0}")]
    Connect(String),
    #[error("unparseable agent message: {0}")]
    Protocol(String),
    #[error("agent JSON framing error: {detail}")]
    Json { fragment: String, detail: String },
    #[error("agent process exited with {exit_code:?}")]
    Process {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("task exceeded {budget_secs}s timeout")]
    Timeout { budget_secs: u64 },
    #[error("circuit breaker `{key}` is open")]
    BreakerOpen { key: String },
    #[error("agent error: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Closed set of user-visible failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AgentMissing,
    AgentConnect,
    AgentProtocol,
    AgentJson,
    AgentProcess,
    RateLimit,
    InternalTimeout,
    BreakerOpen,
    AgentGeneric,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AgentMissing => "agent_missing",
            FailureKind::AgentConnect => "agent_connect",
            FailureKind::AgentProtocol => "agent_protocol",
            FailureKind::AgentJson => "agent_json",
            FailureKind::AgentProcess => "agent_process",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::InternalTimeout => "internal_timeout",
            FailureKind::BreakerOpen => "breaker_open",
            FailureKind::AgentGeneric => "agent_generic",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Classified
// ---------------------------------------------------------------------------

/// The classifier's verdict for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub kind: FailureKind,
    pub transient: bool,
    pub http_status: u16,
    pub description: String,
    pub recovery_hint: &'static str,
    /// Descriptive context for the detailed log (stderr tail etc.).
    pub debug: Vec<String>,
}

impl Classified {
    /// User-visible failure string: `[{kind}] {description} | hint: {hint}`.
    pub fn error_message(&self) -> String {
        format!(
            "[{}] {} | hint: {}",
            self.kind, self.description, self.recovery_hint
        )
    }
}

// ---------------------------------------------------------------------------
// classify
// ---------------------------------------------------------------------------

const TRANSIENT_STDERR_PATTERNS: &[&str] =
    &["timeout", "connection", "network", "rate limit", "temporary"];

/// Exit codes left behind by timeout, SIGKILL, and SIGTERM.
const TRANSIENT_EXIT_CODES: &[i32] = &[124, 137, 143];

fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit") || lower.contains("429")
}

fn looks_truncated(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("incomplete")
        || lower.contains("truncated")
        || lower.contains("unexpected end")
        || lower.contains("eof")
}

/// Map an agent failure to its classified record. Pure: the same input
/// always yields the same record.
pub fn classify(err: &AgentError) -> Classified {
    // Explicit rate-limit text wins over the structural variant, so that a
    // 429 surfaced through stderr or a connect error still gets the long
    // fixed delay.
    if !matches!(err, AgentError::RateLimited(_)) && looks_rate_limited(&err.to_string()) {
        return Classified {
            kind: FailureKind::RateLimit,
            transient: true,
            http_status: 429,
            description: err.to_string(),
            recovery_hint: "wait for the rate limit window to reset before retrying",
            debug: Vec::new(),
        };
    }

    match err {
        AgentError::Missing { binary } => Classified {
            kind: FailureKind::AgentMissing,
            transient: false,
            http_status: 503,
            description: format!("agent binary `{binary}` not found in PATH"),
            recovery_hint: "install the agent CLI and verify it is on PATH",
            debug: Vec::new(),
        },
        AgentError::Connect(detail) => Classified {
            kind: FailureKind::AgentConnect,
            transient: true,
            http_status: 502,
            description: format!("could not talk to the agent process: {detail}"),
            recovery_hint: "check agent authentication and network connectivity",
            debug: Vec::new(),
        },
        AgentError::Protocol(detail) => Classified {
            kind: FailureKind::AgentProtocol,
            transient: false,
            http_status: 502,
            description: format!("agent emitted a structurally invalid message: {detail}"),
            recovery_hint: "update the agent CLI to a compatible version",
            debug: Vec::new(),
        },
        AgentError::Json { fragment, detail } => {
            let transient = looks_truncated(detail) || looks_truncated(fragment);
            Classified {
                kind: FailureKind::AgentJson,
                transient,
                http_status: 502,
                description: format!("JSON framing error: {detail}"),
                recovery_hint: if transient {
                    "likely an interrupted stream; retry the task"
                } else {
                    "inspect the detailed log for the malformed fragment"
                },
                debug: vec![format!("fragment: {}", preview(fragment, 200))],
            }
        }
        AgentError::Process { exit_code, stderr } => {
            let stderr_lower = stderr.to_lowercase();
            let transient = exit_code.is_some_and(|c| TRANSIENT_EXIT_CODES.contains(&c))
                || TRANSIENT_STDERR_PATTERNS
                    .iter()
                    .any(|p| stderr_lower.contains(p));
            Classified {
                kind: FailureKind::AgentProcess,
                transient,
                http_status: 500,
                description: format!(
                    "agent exited with {} ({})",
                    exit_code.map_or("unknown code".to_string(), |c| c.to_string()),
                    exit_code_meaning(*exit_code),
                ),
                recovery_hint: if transient {
                    "transient process failure; retry the task"
                } else {
                    "check the stderr tail in the detailed log"
                },
                debug: stderr_tail(stderr, 20)
                    .lines()
                    .map(|l| l.to_string())
                    .collect(),
            }
        }
        AgentError::RateLimited(detail) => Classified {
            kind: FailureKind::RateLimit,
            transient: true,
            http_status: 429,
            description: format!("rate limited: {detail}"),
            recovery_hint: "wait for the rate limit window to reset before retrying",
            debug: Vec::new(),
        },
        AgentError::Timeout { budget_secs } => Classified {
            kind: FailureKind::InternalTimeout,
            transient: true,
            http_status: 504,
            description: format!("task exceeded its {budget_secs}s timeout budget"),
            recovery_hint: "split the task up or submit it at a deeper model tier",
            debug: Vec::new(),
        },
        AgentError::BreakerOpen { key } => Classified {
            kind: FailureKind::BreakerOpen,
            transient: false,
            http_status: 503,
            description: format!("circuit breaker `{key}` is open; call suppressed"),
            recovery_hint: "wait for the breaker cooldown, then resubmit",
            debug: Vec::new(),
        },
        AgentError::Other(detail) => Classified {
            kind: FailureKind::AgentGeneric,
            transient: false,
            http_status: 500,
            description: detail.clone(),
            recovery_hint: "check the detailed task log",
            debug: Vec::new(),
        },
    }
}

fn exit_code_meaning(exit_code: Option<i32>) -> &'static str {
    match exit_code {
        None => "killed by signal",
        Some(0) => "success",
        Some(1) => "general error",
        Some(2) => "usage error",
        Some(124) => "timed out",
        Some(126) => "permission denied",
        Some(127) => "command not found",
        Some(137) => "SIGKILL",
        Some(143) => "SIGTERM",
        Some(c) if c > 128 => "terminated by signal",
        Some(_) => "unknown exit code",
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

/// Last `lines` lines of a stderr capture.
pub fn stderr_tail(stderr: &str, lines: usize) -> String {
    let all: Vec<&str> = stderr.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

// ---------------------------------------------------------------------------
// Environment diagnostics
// ---------------------------------------------------------------------------

/// Capture environmental signals for the detailed log: whether the agent
/// binary resolves on PATH and what PATH contains. Descriptive only.
pub fn probe_environment(binary: &str) -> Vec<String> {
    let mut out = Vec::new();
    let path = std::env::var("PATH").unwrap_or_default();
    let entries: Vec<&str> = path.split(':').filter(|p| !p.is_empty()).collect();

    let found = entries
        .iter()
        .map(|dir| std::path::Path::new(dir).join(binary))
        .find(|candidate| candidate.is_file());

    match found {
        Some(p) => out.push(format!("agent binary `{binary}` found at {}", p.display())),
        None => out.push(format!("agent binary `{binary}` not found on PATH")),
    }
    out.push(format!("PATH has {} entries", entries.len()));
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
