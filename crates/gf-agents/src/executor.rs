//! Drives a single task end-to-end.
//!
//! The executor owns the full lifecycle of one task: the `pending ->
//! running` transition, both log sinks, the per-tier timeout budget, the
//! retry-wrapped agent invocation, and finalization. Both log files are
//! closed on every exit path; cancellation is honored at every suspension
//! point and is never retried.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use gf_core::config::SchedulerConfig;
use gf_core::store::{StoreError, TaskStore};
use gf_core::task_log::{SummaryCode, TaskLogSink};
use gf_core::types::{Task, TaskOutcome, TaskStatus};
use gf_harness::breaker::CircuitBreaker;
use gf_harness::classifier::{classify, probe_environment, AgentError, Classified};
use gf_harness::retry::{execute_with_retry, RetryNotice, RetryPolicy};

use crate::message::{parse_line, summary_line, AgentMessage, ParseError};
use crate::spawner::{AgentSpawner, SpawnRequest, SpawnedAgent, AGENT_BINARY};

/// Breaker key protecting the agent invocation path.
pub const BREAKER_KEY: &str = "agent.invoke";

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

pub struct TaskExecutor {
    store: Arc<TaskStore>,
    spawner: Arc<dyn AgentSpawner>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    scheduler_cfg: SchedulerConfig,
}

/// The agent's final report, if one arrived on the stream.
#[derive(Debug, Clone)]
struct FinalReport {
    summary: String,
    is_error: bool,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<TaskStore>,
        spawner: Arc<dyn AgentSpawner>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
        scheduler_cfg: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            spawner,
            breaker,
            policy,
            scheduler_cfg,
        }
    }

    /// Run the task to a terminal state and return its outcome.
    ///
    /// `cancel` flips to `true` when the task is cancelled; the agent child
    /// receives a terminate signal and the task finalizes as `cancelled`.
    pub async fn run(&self, task_id: i64, cancel: watch::Receiver<bool>) -> TaskOutcome {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id, "task vanished before execution");
                return TaskOutcome::Failed;
            }
            Err(e) => {
                error!(task_id, error = %e, "store read failed before execution");
                return TaskOutcome::Failed;
            }
        };

        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Completed => return TaskOutcome::Completed,
            TaskStatus::Failed => return TaskOutcome::Failed,
            TaskStatus::Skipped => return TaskOutcome::Skipped,
            TaskStatus::Cancelled => return TaskOutcome::Cancelled,
            other => {
                warn!(task_id, status = ?other, "task not dispatchable");
                return TaskOutcome::Failed;
            }
        }

        if let Err(e) = self.store.mark_running(task_id, std::process::id()).await {
            match e {
                StoreError::StatusConflict { actual, .. } => {
                    warn!(task_id, actual = ?actual, "lost the pending -> running race");
                    return match actual {
                        TaskStatus::Cancelled => TaskOutcome::Cancelled,
                        _ => TaskOutcome::Failed,
                    };
                }
                other => {
                    error!(task_id, error = %other, "could not mark task running");
                    return TaskOutcome::Failed;
                }
            }
        }

        // Failing to open the log files is fatal for the task, not the
        // service.
        let sink = match TaskLogSink::open(&task.summary_log_path, &task.detailed_log_path).await {
            Ok(sink) => Arc::new(Mutex::new(sink)),
            Err(e) => {
                let message = format!(
                    "[agent_generic] cannot open task log files: {e} | hint: verify the log directory is writable"
                );
                self.finalize(task_id, TaskOutcome::Failed, &message).await;
                return TaskOutcome::Failed;
            }
        };

        let budget = self.scheduler_cfg.timeout_for(task.tier);
        {
            let mut s = sink.lock().await;
            let _ = s
                .header(
                    task.id,
                    &task.working_dir,
                    task.tier.as_str(),
                    budget.as_secs(),
                    &task.execution_prompt,
                    task.system_prompt.as_deref(),
                )
                .await;
        }

        let outcome = self.drive(&task, sink.clone(), cancel).await;

        let mut s = sink.lock().await;
        if let Err(e) = s.close().await {
            warn!(task_id, error = %e, "failed to close task logs");
        }
        outcome
    }

    /// Invoke the agent under retry/cancel and finalize the row.
    async fn drive(
        &self,
        task: &Task,
        sink: Arc<Mutex<TaskLogSink>>,
        cancel: watch::Receiver<bool>,
    ) -> TaskOutcome {
        let task_id = task.id;
        let budget = self.scheduler_cfg.timeout_for(task.tier);
        let request = SpawnRequest {
            working_dir: task.working_dir.clone(),
            execution_prompt: task.execution_prompt.clone(),
            system_prompt: task.system_prompt.clone(),
            tier: task.tier,
        };
        let message_count = Arc::new(AtomicU32::new(0));

        let op = {
            let spawner = self.spawner.clone();
            let store = self.store.clone();
            let sink = sink.clone();
            let message_count = message_count.clone();
            let request = request.clone();
            move |attempt: u32| {
                let spawner = spawner.clone();
                let store = store.clone();
                let sink = sink.clone();
                let message_count = message_count.clone();
                let request = request.clone();
                async move {
                    let agent = spawner.spawn(&request).await?;
                    // Point the row's pid at the agent child so crash
                    // recovery can find and kill an orphaned agent.
                    if let Err(e) = store.update_worker_pid(task_id, agent.pid).await {
                        warn!(task_id, error = %e, "failed to record agent pid");
                    }
                    {
                        let mut s = sink.lock().await;
                        let _ = s
                            .detailed(&format!(
                                "[attempt {attempt}] agent {} spawned (pid {:?})",
                                agent.id, agent.pid
                            ))
                            .await;
                    }

                    let streamed = tokio::time::timeout(
                        budget,
                        stream_agent(&agent, &store, &sink, task_id, &message_count),
                    )
                    .await;

                    match streamed {
                        Err(_elapsed) => {
                            agent.kill();
                            let _ = agent.wait().await;
                            Err(AgentError::Timeout {
                                budget_secs: budget.as_secs(),
                            })
                        }
                        Ok(Err(e)) => {
                            agent.kill();
                            let _ = agent.wait().await;
                            Err(e)
                        }
                        Ok(Ok(final_report)) => {
                            let report = agent.wait().await;
                            if !report.success() {
                                return Err(AgentError::Process {
                                    exit_code: report.exit_code,
                                    stderr: report.stderr,
                                });
                            }
                            match final_report {
                                Some(f) if f.is_error => Err(AgentError::Other(format!(
                                    "agent reported failure: {}",
                                    f.summary
                                ))),
                                Some(f) if !f.summary.is_empty() => Ok(f.summary),
                                _ => Ok(format!(
                                    "Task completed successfully ({} messages)",
                                    message_count.load(Ordering::Relaxed)
                                )),
                            }
                        }
                    }
                }
            }
        };

        let on_retry = {
            let store = self.store.clone();
            let sink = sink.clone();
            move |notice: RetryNotice| {
                let store = store.clone();
                let sink = sink.clone();
                async move {
                    let line = format!(
                        "attempt {}/{} failed ({}); retrying in {:.1}s",
                        notice.attempt,
                        notice.max_attempts,
                        notice.verdict.kind,
                        notice.delay.as_secs_f64(),
                    );
                    {
                        let mut s = sink.lock().await;
                        let _ = s.summary(SummaryCode::Retry, &line).await;
                        let _ = s
                            .detailed(&format!("[retry] {}", notice.verdict.description))
                            .await;
                    }
                    if let Err(e) = store.append_action(task_id, &line).await {
                        warn!(task_id, error = %e, "failed to record retry action");
                    }
                }
            }
        };

        let attempt_result = tokio::select! {
            _ = wait_cancelled(cancel) => None,
            res = execute_with_retry(&self.policy, &self.breaker, BREAKER_KEY, op, on_retry) => {
                Some(res)
            }
        };

        match attempt_result {
            None => {
                info!(task_id, "task cancelled");
                {
                    let mut s = sink.lock().await;
                    let _ = s.summary(SummaryCode::Cancel, "task cancelled").await;
                }
                self.finalize(task_id, TaskOutcome::Cancelled, "cancelled by request")
                    .await;
                TaskOutcome::Cancelled
            }
            Some(Ok(summary)) => {
                info!(task_id, "task completed");
                {
                    let mut s = sink.lock().await;
                    let _ = s.summary(SummaryCode::Done, &summary).await;
                }
                self.finalize(task_id, TaskOutcome::Completed, &summary).await;
                TaskOutcome::Completed
            }
            Some(Err(verdict)) => {
                warn!(task_id, kind = %verdict.kind, "task failed");
                self.log_failure(&sink, &verdict).await;
                self.finalize(task_id, TaskOutcome::Failed, &verdict.error_message())
                    .await;
                TaskOutcome::Failed
            }
        }
    }

    /// Full error report for the detailed log; one ❌ line for the summary.
    async fn log_failure(&self, sink: &Mutex<TaskLogSink>, verdict: &Classified) {
        let mut s = sink.lock().await;
        let _ = s.summary(SummaryCode::Fail, &verdict.error_message()).await;
        let _ = s.detailed(&format!("{:=<60}", "")).await;
        let _ = s
            .detailed(&format!("[error] {}", chrono::Utc::now().to_rfc3339()))
            .await;
        let _ = s.detailed(&format!("Kind: {}", verdict.kind)).await;
        let _ = s.detailed(&format!("Message: {}", verdict.description)).await;
        let _ = s.detailed(&format!("Transient: {}", verdict.transient)).await;
        let _ = s
            .detailed(&format!("Recovery hint: {}", verdict.recovery_hint))
            .await;
        let _ = s.detailed("Environment:").await;
        for line in probe_environment(AGENT_BINARY) {
            let _ = s.detailed(&format!("  {line}")).await;
        }
        if !verdict.debug.is_empty() {
            let _ = s.detailed("Debug context:").await;
            for line in &verdict.debug {
                let _ = s.detailed(&format!("  {line}")).await;
            }
        }
        let _ = s.detailed(&format!("{:=<60}", "")).await;
    }

    async fn finalize(&self, task_id: i64, outcome: TaskOutcome, message: &str) {
        if let Err(e) = self.store.finalize(task_id, outcome, message).await {
            error!(task_id, outcome = ?outcome, error = %e, "failed to finalize task");
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Consume the agent's stdout stream: every line lands in the detailed log;
/// the first significant block per line becomes the summary line and the
/// `last_action` cache entry. Tool-level failures inside the agent's own
/// tool calls are observed data — logged, never raised.
async fn stream_agent(
    agent: &SpawnedAgent,
    store: &TaskStore,
    sink: &Mutex<TaskLogSink>,
    task_id: i64,
    message_count: &AtomicU32,
) -> Result<Option<FinalReport>, AgentError> {
    let mut final_report = None;

    while let Some(line) = agent.next_line().await {
        message_count.fetch_add(1, Ordering::Relaxed);
        {
            let mut s = sink.lock().await;
            let _ = s.detailed(&line).await;
        }

        let messages = parse_line(&line).map_err(|e| match e {
            ParseError::Json { fragment, detail } => AgentError::Json { fragment, detail },
            ParseError::Protocol(detail) => AgentError::Protocol(detail),
        })?;

        let mut recorded_action = false;
        for msg in &messages {
            if let AgentMessage::Final { summary, is_error } = msg {
                final_report = Some(FinalReport {
                    summary: summary.clone(),
                    is_error: *is_error,
                });
                continue;
            }
            if recorded_action {
                continue;
            }
            if let Some(action) = summary_line(msg) {
                let code = match msg {
                    AgentMessage::AssistantText { .. } => SummaryCode::Text,
                    _ => SummaryCode::Tool,
                };
                {
                    let mut s = sink.lock().await;
                    let _ = s.summary(code, &action).await;
                }
                if let Err(e) = store.append_action(task_id, &action).await {
                    warn!(task_id, error = %e, "failed to update last_action");
                }
                recorded_action = true;
            }
        }
    }
    Ok(final_report)
}

/// Resolve when the cancel flag flips to true; park forever if the sender
/// goes away without cancelling.
async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::ExitReport;
    use async_trait::async_trait;
    use gf_core::types::{ModelTier, NewTask};
    use gf_harness::breaker::BreakerConfig;
    use gf_harness::classifier::FailureKind;
    use std::collections::VecDeque;
    use std::time::Duration;
    use uuid::Uuid;

    // -- Scripted spawner --

    enum Script {
        /// Emit these lines, then end the stream with the given exit report.
        Emit {
            lines: Vec<String>,
            exit: ExitReport,
        },
        /// Fail the spawn itself.
        SpawnError(AgentError),
        /// Keep the stream open until the handle is dropped.
        Hang,
    }

    struct MockSpawner {
        scripts: std::sync::Mutex<VecDeque<Script>>,
        spawn_count: AtomicU32,
        // Keeps hanging channels alive.
        held: std::sync::Mutex<Vec<flume::Sender<String>>>,
    }

    impl MockSpawner {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: std::sync::Mutex::new(scripts.into()),
                spawn_count: AtomicU32::new(0),
                held: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn spawns(&self) -> u32 {
            self.spawn_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentSpawner for MockSpawner {
        async fn spawn(&self, _request: &SpawnRequest) -> Result<SpawnedAgent, AgentError> {
            self.spawn_count.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            match script {
                Script::SpawnError(e) => Err(e),
                Script::Emit { lines, exit } => {
                    let (line_tx, line_rx) = flume::bounded(256);
                    let (exit_tx, exit_rx) = flume::bounded(1);
                    let (kill_tx, _kill_rx) = flume::bounded(1);
                    for line in lines {
                        let _ = line_tx.send(line);
                    }
                    drop(line_tx);
                    let _ = exit_tx.send(exit);
                    Ok(SpawnedAgent::new(
                        Uuid::new_v4(),
                        Some(1234),
                        line_rx,
                        exit_rx,
                        kill_tx,
                    ))
                }
                Script::Hang => {
                    let (line_tx, line_rx) = flume::bounded(256);
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
                        Some(1234),
                        line_rx,
                        exit_rx,
                        kill_tx,
                    ))
                }
            }
        }
    }

    // -- Helpers --

    fn tool_use_line(command: &str) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"tool_use","name":"Bash","input":{{"command":"{command}"}},"id":"toolu_1"}}]}}}}"#
        )
    }

    fn final_line(summary: &str) -> String {
        format!(r#"{{"type":"result","subtype":"success","result":"{summary}","is_error":false}}"#)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    struct Fixture {
        store: Arc<TaskStore>,
        breaker_dir: tempfile::TempDir,
        _log_dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let log_dir = tempfile::tempdir().unwrap();
        let breaker_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            TaskStore::open_in_memory(log_dir.path())
                .await
                .unwrap(),
        );
        Fixture {
            store,
            breaker_dir,
            _log_dir: log_dir,
        }
    }

    impl Fixture {
        fn executor(&self, spawner: Arc<dyn AgentSpawner>, policy: RetryPolicy) -> TaskExecutor {
            let breaker = Arc::new(CircuitBreaker::new(
                self.breaker_dir.path(),
                BreakerConfig::default(),
            ));
            TaskExecutor::new(
                self.store.clone(),
                spawner,
                breaker,
                policy,
                SchedulerConfig::default(),
            )
        }

        async fn submit(&self) -> i64 {
            self.store
                .create_task(NewTask {
                    execution_prompt: "write /tmp/hello.txt containing hi".into(),
                    working_dir: "/tmp".into(),
                    system_prompt: None,
                    tier: ModelTier::Balanced,
                })
                .await
                .unwrap()
                .id
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the flag can never flip.
        std::mem::forget(tx);
        rx
    }

    // -- Tests --

    #[tokio::test]
    async fn success_path_reaches_completed_with_logs() {
        let fx = fixture().await;
        let spawner = Arc::new(MockSpawner::new(vec![Script::Emit {
            lines: vec![tool_use_line("touch /tmp/hello.txt"), final_line("Wrote hi")],
            exit: ExitReport::clean(),
        }]));
        let executor = fx.executor(spawner.clone(), fast_policy());
        let task_id = fx.submit().await;

        let outcome = executor.run(task_id, no_cancel()).await;
        assert_eq!(outcome, TaskOutcome::Completed);

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.final_summary.as_deref(), Some("Wrote hi"));
        assert!(task.error_message.is_none());
        assert!(task.started_at.is_some());
        assert!(task.ended_at.is_some());
        assert_eq!(
            task.last_action.as_deref(),
            Some("[tool:bash] touch /tmp/hello.txt")
        );

        let summary = std::fs::read_to_string(&task.summary_log_path).unwrap();
        assert!(summary.contains("🚀"));
        assert!(summary.contains("🔧 [tool:bash] touch /tmp/hello.txt"));
        assert!(summary.contains("✅ Wrote hi"));
        let detailed = std::fs::read_to_string(&task.detailed_log_path).unwrap();
        assert!(detailed.contains("tool_use"));
        assert_eq!(spawner.spawns(), 1);
    }

    #[tokio::test]
    async fn missing_binary_fails_without_retry() {
        let fx = fixture().await;
        let spawner = Arc::new(MockSpawner::new(vec![Script::SpawnError(
            AgentError::Missing {
                binary: "claude".into(),
            },
        )]));
        let executor = fx.executor(spawner.clone(), fast_policy());
        let task_id = fx.submit().await;

        let outcome = executor.run(task_id, no_cancel()).await;
        assert_eq!(outcome, TaskOutcome::Failed);
        assert_eq!(spawner.spawns(), 1);

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let message = task.error_message.unwrap();
        assert!(message.starts_with("[agent_missing]"));
        assert!(message.contains("| hint:"));
        assert!(task.final_summary.is_none());
    }

    #[tokio::test]
    async fn transient_connect_recovers_on_second_attempt() {
        let fx = fixture().await;
        let spawner = Arc::new(MockSpawner::new(vec![
            Script::SpawnError(AgentError::Connect("transport closed".into())),
            Script::Emit {
                lines: vec![final_line("Recovered")],
                exit: ExitReport::clean(),
            },
        ]));
        let executor = fx.executor(spawner.clone(), fast_policy());
        let task_id = fx.submit().await;

        let outcome = executor.run(task_id, no_cancel()).await;
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(spawner.spawns(), 2);

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.final_summary.as_deref(), Some("Recovered"));
        let summary = std::fs::read_to_string(&task.summary_log_path).unwrap();
        assert!(summary.contains("🔁"));
        let detailed = std::fs::read_to_string(&task.detailed_log_path).unwrap();
        assert_eq!(detailed.matches("[retry]").count(), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_classifies_as_agent_process() {
        let fx = fixture().await;
        let spawner = Arc::new(MockSpawner::new(vec![Script::Emit {
            lines: vec![],
            exit: ExitReport {
                exit_code: Some(2),
                stderr: "unknown flag".into(),
                killed: false,
            },
        }]));
        let executor = fx.executor(spawner, fast_policy());
        let task_id = fx.submit().await;

        let outcome = executor.run(task_id, no_cancel()).await;
        assert_eq!(outcome, TaskOutcome::Failed);

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert!(task
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("[agent_process]"));
        let detailed = std::fs::read_to_string(&task.detailed_log_path).unwrap();
        assert!(detailed.contains("Kind: agent_process"));
        assert!(detailed.contains("Recovery hint:"));
    }

    #[tokio::test]
    async fn agent_reported_failure_is_generic() {
        let fx = fixture().await;
        let line =
            r#"{"type":"result","subtype":"error_during_execution","result":"could not comply","is_error":true}"#;
        let spawner = Arc::new(MockSpawner::new(vec![Script::Emit {
            lines: vec![line.to_string()],
            exit: ExitReport::clean(),
        }]));
        let executor = fx.executor(spawner, fast_policy());
        let task_id = fx.submit().await;

        let outcome = executor.run(task_id, no_cancel()).await;
        assert_eq!(outcome, TaskOutcome::Failed);
        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert!(task
            .error_message
            .unwrap()
            .starts_with("[agent_generic] agent reported failure"));
    }

    #[tokio::test]
    async fn tool_level_failures_do_not_fail_the_task() {
        let fx = fixture().await;
        let tool_error = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","is_error":true}]}}"#;
        let spawner = Arc::new(MockSpawner::new(vec![Script::Emit {
            lines: vec![
                tool_use_line("cargo test"),
                tool_error.to_string(),
                final_line("Fixed the tests"),
            ],
            exit: ExitReport::clean(),
        }]));
        let executor = fx.executor(spawner.clone(), fast_policy());
        let task_id = fx.submit().await;

        let outcome = executor.run(task_id, no_cancel()).await;
        assert_eq!(outcome, TaskOutcome::Completed);
        // No retry was triggered by the failed tool call.
        assert_eq!(spawner.spawns(), 1);
    }

    #[tokio::test]
    async fn cancel_terminates_without_retry() {
        let fx = fixture().await;
        let spawner = Arc::new(MockSpawner::new(vec![Script::Hang]));
        let executor = fx.executor(spawner.clone(), fast_policy());
        let task_id = fx.submit().await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = {
            let store = fx.store.clone();
            tokio::spawn(async move {
                // Wait until the task is running, then cancel.
                loop {
                    let task = store.get_task(task_id).await.unwrap().unwrap();
                    if task.status == TaskStatus::Running {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                let _ = cancel_tx.send(true);
            })
        };

        let outcome = executor.run(task_id, cancel_rx).await;
        handle.await.unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(spawner.spawns(), 1);

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.error_message.as_deref(), Some("cancelled by request"));
        let summary = std::fs::read_to_string(&task.summary_log_path).unwrap();
        assert!(summary.contains("⏹️ task cancelled"));
    }

    #[tokio::test]
    async fn timeout_finalizes_as_internal_timeout() {
        let fx = fixture().await;
        let spawner = Arc::new(MockSpawner::new(vec![Script::Hang]));
        let mut cfg = SchedulerConfig::default();
        cfg.timeout_balanced_secs = 0;
        let breaker = Arc::new(CircuitBreaker::new(
            fx.breaker_dir.path(),
            BreakerConfig::default(),
        ));
        let executor = TaskExecutor::new(
            fx.store.clone(),
            spawner,
            breaker,
            RetryPolicy {
                max_attempts: 1,
                ..fast_policy()
            },
            cfg,
        );
        let task_id = fx.submit().await;

        let outcome = executor.run(task_id, no_cancel()).await;
        assert_eq!(outcome, TaskOutcome::Failed);
        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert!(task
            .error_message
            .unwrap()
            .starts_with("[internal_timeout]"));
    }

    #[tokio::test]
    async fn breaker_open_fails_fast_with_distinct_kind() {
        let fx = fixture().await;
        let spawner = Arc::new(MockSpawner::new(vec![]));
        let breaker = Arc::new(CircuitBreaker::new(
            fx.breaker_dir.path(),
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        ));
        breaker.record_failure(BREAKER_KEY).await.unwrap();

        let executor = TaskExecutor::new(
            fx.store.clone(),
            spawner.clone(),
            breaker,
            fast_policy(),
            SchedulerConfig::default(),
        );
        let task_id = fx.submit().await;

        let outcome = executor.run(task_id, no_cancel()).await;
        assert_eq!(outcome, TaskOutcome::Failed);
        // The agent was never invoked.
        assert_eq!(spawner.spawns(), 0);

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        let message = task.error_message.unwrap();
        assert!(message.starts_with(&format!("[{}]", FailureKind::BreakerOpen)));
    }

    #[tokio::test]
    async fn run_on_terminal_task_is_a_noop() {
        let fx = fixture().await;
        let spawner = Arc::new(MockSpawner::new(vec![Script::Emit {
            lines: vec![final_line("done")],
            exit: ExitReport::clean(),
        }]));
        let executor = fx.executor(spawner.clone(), fast_policy());
        let task_id = fx.submit().await;

        assert_eq!(executor.run(task_id, no_cancel()).await, TaskOutcome::Completed);
        // Second run observes the terminal state and does nothing.
        assert_eq!(executor.run(task_id, no_cancel()).await, TaskOutcome::Completed);
        assert_eq!(spawner.spawns(), 1);
    }
}
