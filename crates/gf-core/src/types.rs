use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// Waiting for declared dependencies to complete.
    Waiting,
    Running,
    Completed,
    Failed,
    /// Terminal: a dependency did not complete successfully.
    Skipped,
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Waiting)
                | (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Waiting, TaskStatus::Pending)
                | (TaskStatus::Waiting, TaskStatus::Skipped)
                | (TaskStatus::Waiting, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Skipped
                | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// TaskOutcome
// ---------------------------------------------------------------------------

/// Terminal outcome attached to a task's completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed => TaskStatus::Completed,
            TaskOutcome::Failed => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
            TaskOutcome::Skipped => TaskStatus::Skipped,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelTier
// ---------------------------------------------------------------------------

/// Abstract quality/latency class. Maps to a per-tier timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    #[default]
    Balanced,
    Deep,
}

impl ModelTier {
    /// Timeout budget for a single task at this tier.
    pub fn timeout(&self) -> Duration {
        match self {
            ModelTier::Fast => Duration::from_secs(600),
            ModelTier::Balanced => Duration::from_secs(1800),
            ModelTier::Deep => Duration::from_secs(3600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::Deep => "deep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(ModelTier::Fast),
            "balanced" => Some(ModelTier::Balanced),
            "deep" => Some(ModelTier::Deep),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub status: TaskStatus,
    pub tier: ModelTier,
    pub working_dir: String,
    pub system_prompt: Option<String>,
    pub execution_prompt: String,
    /// Set at insert, never rewritten.
    pub summary_log_path: String,
    /// Set at insert, never rewritten.
    pub detailed_log_path: String,
    /// Latest summary line; monotonically advances, never cleared.
    pub last_action: Option<String>,
    pub final_summary: Option<String>,
    pub error_message: Option<String>,
    /// OS id of the worker driving the task while it is running: the
    /// scheduling process at claim time, replaced by the agent child once
    /// it is spawned.
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub orchestration_id: Option<i64>,
    /// Client-chosen name, unique within an orchestration.
    pub task_identifier: Option<String>,
    pub depends_on: Vec<String>,
    /// Seconds to sleep after all dependencies complete.
    pub wait_after_dependencies: f64,
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed
                | OrchestrationStatus::Failed
                | OrchestrationStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::Pending => "pending",
            OrchestrationStatus::Running => "running",
            OrchestrationStatus::Completed => "completed",
            OrchestrationStatus::Failed => "failed",
            OrchestrationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: i64,
    pub status: OrchestrationStatus,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub skipped_tasks: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Submission inputs
// ---------------------------------------------------------------------------

/// Inputs for a single task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub execution_prompt: String,
    pub working_dir: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tier: ModelTier,
}

/// One member of an orchestration submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupTask {
    /// Unique within the group; letters, digits, `_` and `-` only.
    pub identifier: String,
    #[serde(flatten)]
    pub task: NewTask,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Seconds to wait after all dependencies complete (≥ 0).
    #[serde(default)]
    pub wait_after_dependencies: f64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ValidationError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl NewTask {
    /// Loose validation for the human submit surface. Defaults apply.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.execution_prompt.trim().len() < 10 {
            return Err(ValidationError::invalid(
                "execution_prompt",
                "must be at least 10 characters",
            ));
        }
        if self.working_dir.trim().is_empty() {
            return Err(ValidationError::invalid(
                "working_dir",
                "cannot be empty",
            ));
        }
        Ok(())
    }

    /// Strict validation for machine/tool clients.
    ///
    /// On top of the loose rules: execution prompt length ≥ 150 and contains
    /// a path-like fragment; system prompt, if given, 75–500 chars.
    pub fn validate_strict(&self) -> Result<(), ValidationError> {
        self.validate()?;
        if self.execution_prompt.len() < 150 {
            return Err(ValidationError::invalid(
                "execution_prompt",
                format!(
                    "must be at least 150 characters (got {})",
                    self.execution_prompt.len()
                ),
            ));
        }
        if !self.execution_prompt.contains('/') && !self.execution_prompt.contains('\\') {
            return Err(ValidationError::invalid(
                "execution_prompt",
                "must contain a path-like fragment (`/` or `\\`)",
            ));
        }
        if let Some(sp) = &self.system_prompt {
            if sp.len() < 75 || sp.len() > 500 {
                return Err(ValidationError::invalid(
                    "system_prompt",
                    format!("must be 75-500 characters (got {})", sp.len()),
                ));
            }
        }
        Ok(())
    }
}

impl GroupTask {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.identifier.trim().is_empty() {
            return Err(ValidationError::invalid("identifier", "cannot be empty"));
        }
        if !self
            .identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ValidationError::invalid(
                "identifier",
                "may only contain letters, digits, underscore, and hyphen",
            ));
        }
        if self.wait_after_dependencies < 0.0 {
            return Err(ValidationError::invalid(
                "wait_after_dependencies",
                "must be non-negative",
            ));
        }
        self.task.validate()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
