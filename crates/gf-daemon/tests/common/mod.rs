#![allow(dead_code)]
//! Shared test support: a scripted agent spawner and store polling helpers.
//!
//! The spawner keys its behavior off the first whitespace token of the
//! execution prompt (the "tag"), so orchestration tests can fail one member
//! of a group while the rest succeed, and records spawn order and peak
//! concurrency for scheduling assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use gf_agents::spawner::{AgentSpawner, ExitReport, SpawnRequest, SpawnedAgent};
use gf_core::store::TaskStore;
use gf_core::types::Task;
use gf_harness::classifier::AgentError;

#[derive(Debug, Clone)]
pub enum Mode {
    /// Emit one tool-use line and a final line after `delay_ms`, exit 0.
    Success { delay_ms: u64 },
    /// Fail the spawn with a transient connect error.
    ConnectError,
    /// Fail the spawn with a permanent missing-binary error.
    MissingError,
    /// Keep the stream open until the handle is dropped.
    Hang,
}

pub struct ScriptedSpawner {
    default_mode: Mutex<Mode>,
    overrides: Mutex<HashMap<String, Mode>>,
    /// Binary name reported to the scheduler's orphan reaper.
    binary: String,
    pub spawns: AtomicU32,
    active: Arc<AtomicU32>,
    pub max_active: Arc<AtomicU32>,
    order: Mutex<Vec<String>>,
    held: Mutex<Vec<flume::Sender<String>>>,
}

impl ScriptedSpawner {
    pub fn new(default_mode: Mode) -> Self {
        Self::with_binary(default_mode, "claude")
    }

    pub fn with_binary(default_mode: Mode, binary: impl Into<String>) -> Self {
        Self {
            default_mode: Mutex::new(default_mode),
            overrides: Mutex::new(HashMap::new()),
            binary: binary.into(),
            spawns: AtomicU32::new(0),
            active: Arc::new(AtomicU32::new(0)),
            max_active: Arc::new(AtomicU32::new(0)),
            order: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    /// Override the behavior for prompts whose tag matches.
    pub fn override_tag(&self, tag: &str, mode: Mode) {
        self.overrides.lock().unwrap().insert(tag.to_string(), mode);
    }

    /// Swap the default behavior (e.g. failing -> succeeding mid-test).
    pub fn set_default(&self, mode: Mode) {
        *self.default_mode.lock().unwrap() = mode;
    }

    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn spawn_order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    fn mode_for(&self, tag: &str) -> Mode {
        self.overrides
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .unwrap_or_else(|| self.default_mode.lock().unwrap().clone())
    }
}

fn tag_of(prompt: &str) -> String {
    prompt.split_whitespace().next().unwrap_or("").to_string()
}

pub fn tool_use_line(command: &str) -> String {
    format!(
        r#"{{"type":"assistant","message":{{"content":[{{"type":"tool_use","name":"Bash","input":{{"command":"{command}"}},"id":"toolu_1"}}]}}}}"#
    )
}

pub fn final_line(summary: &str) -> String {
    format!(r#"{{"type":"result","subtype":"success","result":"{summary}","is_error":false}}"#)
}

#[async_trait]
impl AgentSpawner for ScriptedSpawner {
    fn binary_name(&self) -> &str {
        &self.binary
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedAgent, AgentError> {
        let tag = tag_of(&request.execution_prompt);
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(tag.clone());

        match self.mode_for(&tag) {
            Mode::MissingError => Err(AgentError::Missing {
                binary: "claude".into(),
            }),
            Mode::ConnectError => Err(AgentError::Connect("transport closed".into())),
            Mode::Hang => {
                let (line_tx, line_rx) = flume::bounded(16);
                let (exit_tx, exit_rx) = flume::bounded(1);
                let (kill_tx, _kill_rx) = flume::bounded(1);
                let _ = exit_tx.send(ExitReport {
                    exit_code: None,
                    stderr: String::new(),
                    killed: true,
                });
                self.held.lock().unwrap().push(line_tx);
                Ok(SpawnedAgent::new(
                    Uuid::new_v4(),
                    Some(1),
                    line_rx,
                    exit_rx,
                    kill_tx,
                ))
            }
            Mode::Success { delay_ms } => {
                let (line_tx, line_rx) = flume::bounded(16);
                let (exit_tx, exit_rx) = flume::bounded(1);
                let (kill_tx, _kill_rx) = flume::bounded(1);

                let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(current, Ordering::SeqCst);

                let active = self.active.clone();
                let summary = format!("{tag} finished");
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = line_tx.send_async(tool_use_line("touch out.txt")).await;
                    let _ = line_tx.send_async(final_line(&summary)).await;
                    drop(line_tx);
                    let _ = exit_tx.send_async(ExitReport::clean()).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                });

                Ok(SpawnedAgent::new(
                    Uuid::new_v4(),
                    Some(1),
                    line_rx,
                    exit_rx,
                    kill_tx,
                ))
            }
        }
    }
}

/// Poll the store until the task reaches a terminal state.
pub async fn wait_terminal(store: &TaskStore, task_id: i64) -> Task {
    for _ in 0..500 {
        let task = store
            .get_task(task_id)
            .await
            .expect("store read")
            .expect("task exists");
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not reach a terminal state in time");
}
