//! Cross-platform helpers for generating safe, collision-free log filenames.

use std::path::Path;

use chrono::{DateTime, Utc};

/// Maximum length of the `{context}` slug embedded in log filenames.
const MAX_CONTEXT_LEN: usize = 40;

/// Reduce any string to a safe filename component: non-alphanumeric
/// characters become `_`, runs of `_` collapse, and the result is
/// lowercased and truncated to `max_len`.
pub fn sanitize_component(raw: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(max_len));
    let mut last_underscore = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("unknown");
    }
    out.truncate(max_len);
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Extract a context slug from a working directory: the basename, sanitized
/// and truncated to 40 characters.
pub fn directory_context(working_dir: &str) -> String {
    let basename = Path::new(working_dir)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("root");
    sanitize_component(basename, MAX_CONTEXT_LEN)
}

/// Which of the two per-task log files a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Summary,
    Detailed,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Summary => "summary",
            LogKind::Detailed => "detailed",
        }
    }
}

/// Build the per-task log filename:
/// `task_{id}_{context}_{yyyymmdd_HHMM}_{kind}.log`.
pub fn log_filename(
    task_id: i64,
    working_dir: &str,
    kind: LogKind,
    timestamp: DateTime<Utc>,
) -> String {
    format!(
        "task_{}_{}_{}_{}.log",
        task_id,
        directory_context(working_dir),
        timestamp.format("%Y%m%d_%H%M"),
        kind.as_str(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
