//! The agent's structured message model.
//!
//! The agent CLI emits one JSON object per stdout line. Each line carries a
//! `type` field and, for assistant/user turns, a list of content blocks.
//! [`parse_line`] flattens a line into tagged [`AgentMessage`] values the
//! executor pattern-matches on; [`summary_line`] renders the one-line
//! human-readable form for the summary log and the `last_action` cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// AgentMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentMessage {
    UserText {
        text: String,
    },
    AssistantText {
        text: String,
    },
    ToolUse {
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        is_error: bool,
    },
    /// The agent's final report for the whole run.
    Final {
        summary: String,
        is_error: bool,
    },
}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The line is not valid JSON (framing problem).
    #[error("JSON framing error: {detail}")]
    Json { fragment: String, detail: String },
    /// The line is valid JSON but not a message shape we know.
    #[error("structurally invalid message: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// parse_line
// ---------------------------------------------------------------------------

/// Parse one stdout line from the agent into zero or more messages.
///
/// Lines of known-but-uninteresting types (e.g. the `system` init banner)
/// parse to an empty vec. Unknown `type` values are a protocol error.
pub fn parse_line(line: &str) -> Result<Vec<AgentMessage>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| ParseError::Json {
        fragment: preview(trimmed, 500),
        detail: e.to_string(),
    })?;

    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ParseError::Protocol(format!("missing `type` field: {}", preview(trimmed, 200))))?;

    match msg_type {
        "system" => Ok(Vec::new()),
        "assistant" => parse_content_blocks(&value, true),
        "user" => parse_content_blocks(&value, false),
        "result" => {
            let summary = value
                .get("result")
                .and_then(|r| r.as_str())
                .unwrap_or_default()
                .to_string();
            let is_error = value
                .get("is_error")
                .and_then(|e| e.as_bool())
                .unwrap_or(false);
            Ok(vec![AgentMessage::Final { summary, is_error }])
        }
        other => Err(ParseError::Protocol(format!(
            "unknown message type `{other}`"
        ))),
    }
}

fn parse_content_blocks(value: &Value, assistant: bool) -> Result<Vec<AgentMessage>, ParseError> {
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .ok_or_else(|| ParseError::Protocol("message without content array".to_string()))?;

    let mut out = Vec::new();
    for block in content {
        let block_type = block
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ParseError::Protocol("content block without `type`".to_string()))?;
        match block_type {
            "text" => {
                let text = block
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string();
                if assistant {
                    out.push(AgentMessage::AssistantText { text });
                } else {
                    out.push(AgentMessage::UserText { text });
                }
            }
            "tool_use" => {
                let name = block
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| ParseError::Protocol("tool_use without name".to_string()))?
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                out.push(AgentMessage::ToolUse { name, input });
            }
            "tool_result" => {
                let tool_use_id = block
                    .get("tool_use_id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default()
                    .to_string();
                let is_error = block
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .unwrap_or(false);
                out.push(AgentMessage::ToolResult {
                    tool_use_id,
                    is_error,
                });
            }
            // Thinking and other auxiliary blocks are not surfaced.
            _ => {}
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// summary_line
// ---------------------------------------------------------------------------

/// One-line human-readable form for the summary log and `last_action`.
/// Returns `None` for messages that should not surface there.
pub fn summary_line(msg: &AgentMessage) -> Option<String> {
    match msg {
        AgentMessage::ToolUse { name, input } => Some(format_tool_use(name, input)),
        AgentMessage::AssistantText { text } => Some(format!("[text] {}", preview(text, 100))),
        AgentMessage::ToolResult {
            tool_use_id,
            is_error: true,
        } => Some(format!("[tool:result:error] tool {tool_use_id} failed")),
        _ => None,
    }
}

fn format_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("n/a")
            .to_string()
    };
    match name {
        "Bash" => format!("[tool:bash] {}", preview(&field("command"), 100)),
        "Edit" | "MultiEdit" => format!("[tool:edit] {}", field("file_path")),
        "Write" => format!("[tool:write] {}", field("file_path")),
        "Read" => format!("[tool:read] {}", field("file_path")),
        "Grep" => format!("[tool:grep] {}", field("pattern")),
        "Glob" => format!("[tool:glob] {}", field("pattern")),
        "WebSearch" => format!("[tool:websearch] {}", field("query")),
        "WebFetch" => format!("[tool:webfetch] {}", field("url")),
        "TodoWrite" => {
            let count = input
                .get("todos")
                .and_then(|t| t.as_array())
                .map(|t| t.len())
                .unwrap_or(0);
            format!("[tool:todo] managing {count} tasks")
        }
        "Task" => format!("[tool:task] {}", field("description")),
        other => format!(
            "[tool:{}] {}",
            other.to_lowercase(),
            preview(&input.to_string(), 100)
        ),
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
