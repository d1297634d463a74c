//! Per-task append-only log sinks.
//!
//! Every task owns two files: a **summary** log (one emoji-tagged line per
//! notable event) and a **detailed** log (full serialized agent messages and
//! error context). Every write is newline-terminated and flushed; the closer
//! runs exactly once even when the executor unwinds, with `Drop` as the
//! backstop for the file handles.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskLogError {
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write log file: {0}")]
    Write(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// SummaryCode
// ---------------------------------------------------------------------------

/// Emoji-tagged event codes prefixed to summary-log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryCode {
    Start,
    Tool,
    Text,
    Retry,
    Recovery,
    Done,
    Fail,
    Cancel,
    Skip,
}

impl SummaryCode {
    pub fn glyph(&self) -> &'static str {
        match self {
            SummaryCode::Start => "🚀",
            SummaryCode::Tool => "🔧",
            SummaryCode::Text => "💬",
            SummaryCode::Retry => "🔁",
            SummaryCode::Recovery => "♻️",
            SummaryCode::Done => "✅",
            SummaryCode::Fail => "❌",
            SummaryCode::Cancel => "⏹️",
            SummaryCode::Skip => "⏭️",
        }
    }
}

// ---------------------------------------------------------------------------
// TaskLogSink
// ---------------------------------------------------------------------------

/// Paired summary/detailed writers for one task.
///
/// File descriptors are owned by the sink and never shared across tasks.
#[derive(Debug)]
pub struct TaskLogSink {
    summary: Option<File>,
    detailed: Option<File>,
    summary_path: PathBuf,
    detailed_path: PathBuf,
}

impl TaskLogSink {
    /// Open both files in append mode, creating parent directories.
    pub async fn open(
        summary_path: impl AsRef<Path>,
        detailed_path: impl AsRef<Path>,
    ) -> Result<Self, TaskLogError> {
        let summary_path = summary_path.as_ref().to_path_buf();
        let detailed_path = detailed_path.as_ref().to_path_buf();
        let summary = open_append(&summary_path).await?;
        let detailed = open_append(&detailed_path).await?;
        Ok(Self {
            summary: Some(summary),
            detailed: Some(detailed),
            summary_path,
            detailed_path,
        })
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    pub fn detailed_path(&self) -> &Path {
        &self.detailed_path
    }

    /// Write one summary line: `{timestamp} {glyph} {line}`.
    pub async fn summary(&mut self, code: SummaryCode, line: &str) -> Result<(), TaskLogError> {
        let stamped = format!(
            "{} {} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            code.glyph(),
            line.trim_end(),
        );
        if let Some(file) = self.summary.as_mut() {
            file.write_all(stamped.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }

    /// Append a raw payload line to the detailed log.
    pub async fn detailed(&mut self, line: &str) -> Result<(), TaskLogError> {
        if let Some(file) = self.detailed.as_mut() {
            file.write_all(line.trim_end().as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }
        Ok(())
    }

    /// Write the task-start header to both logs.
    pub async fn header(
        &mut self,
        task_id: i64,
        working_dir: &str,
        tier: &str,
        timeout_secs: u64,
        execution_prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<(), TaskLogError> {
        let preview: String = execution_prompt.chars().take(100).collect();
        let ellipsis = if execution_prompt.chars().count() > 100 {
            "..."
        } else {
            ""
        };
        self.summary(
            SummaryCode::Start,
            &format!("task {task_id} started in {working_dir} (tier={tier}, timeout={timeout_secs}s): {preview}{ellipsis}"),
        )
        .await?;

        self.detailed(&format!("{:=<60}", "")).await?;
        self.detailed(&format!("TASK {task_id} EXECUTION LOG")).await?;
        self.detailed(&format!("Start time: {}", Utc::now().to_rfc3339()))
            .await?;
        self.detailed(&format!("Working directory: {working_dir}"))
            .await?;
        self.detailed(&format!("Tier: {tier} (timeout {timeout_secs}s)"))
            .await?;
        self.detailed(&format!(
            "System prompt: {}",
            system_prompt.unwrap_or("(default)")
        ))
        .await?;
        self.detailed(&format!("Execution prompt: {execution_prompt}"))
            .await?;
        self.detailed(&format!("{:=<60}", "")).await?;
        Ok(())
    }

    /// Flush and close both files. Safe to call more than once; only the
    /// first call does work.
    pub async fn close(&mut self) -> Result<(), TaskLogError> {
        if let Some(mut file) = self.summary.take() {
            file.flush().await?;
            file.shutdown().await?;
        }
        if let Some(mut file) = self.detailed.take() {
            file.flush().await?;
            file.shutdown().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.summary.is_none() && self.detailed.is_none()
    }
}

async fn open_append(path: &Path) -> Result<File, TaskLogError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| TaskLogError::Open {
                path: path.to_path_buf(),
                source,
            })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| TaskLogError::Open {
            path: path.to_path_buf(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
