//! Process-wide supervisor of in-flight executors.
//!
//! The scheduler enforces the concurrency bound with a [`Semaphore`]: each
//! dispatched task acquires an owned permit before its executor starts and
//! releases it on every exit path. Admission (`submit*`) is synchronous —
//! the row exists when the call returns — while execution is asynchronous.
//!
//! Executors run inside this process, not in a worker subprocess pool: the
//! agent's interactive authentication does not survive re-parenting. The
//! isolation that matters is between the executor and the agent *child*,
//! which the spawner provides.

use std::collections::HashMap;
use std::sync::Arc;

use sysinfo::{Pid, System};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use gf_agents::executor::TaskExecutor;
use gf_core::store::{StoreError, TaskStore};
use gf_core::task_log::{SummaryCode, TaskLogSink};
use gf_core::types::{
    NewTask, Orchestration, OrchestrationStatus, Task, TaskOutcome, TaskStatus, ValidationError,
};

/// Fallback when the configured concurrency bound is zero.
const DEFAULT_MAX_CONCURRENT: u32 = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    store: Arc<TaskStore>,
    executor: Arc<TaskExecutor>,
    gate: Arc<Semaphore>,
    max_concurrent: u32,
    /// Binary name of the agent CLI; used to verify stale pids during
    /// orphan reaping.
    agent_binary: String,
    /// Cancel flags for dispatched tasks, keyed by task id.
    active: Arc<Mutex<HashMap<i64, watch::Sender<bool>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        executor: Arc<TaskExecutor>,
        max_concurrent: u32,
        agent_binary: impl Into<String>,
    ) -> Self {
        let limit = if max_concurrent == 0 {
            warn!("max_concurrent was 0, defaulting to {DEFAULT_MAX_CONCURRENT}");
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent
        };
        Self {
            store,
            executor,
            gate: Arc::new(Semaphore::new(limit as usize)),
            max_concurrent: limit,
            agent_binary: agent_binary.into(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent
    }

    /// Executor slots currently free.
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Human submit surface: loose validation, defaults apply. Returns once
    /// the row exists; execution proceeds in the background.
    pub async fn submit(&self, new: NewTask) -> Result<Task, SchedulerError> {
        new.validate()?;
        let task = self.store.create_task(new).await?;
        info!(task_id = task.id, "task submitted");
        self.dispatch(task.id).await;
        Ok(task)
    }

    /// Machine submit surface: strict admission per the tool contract.
    pub async fn submit_strict(&self, new: NewTask) -> Result<Task, SchedulerError> {
        new.validate_strict()?;
        let task = self.store.create_task(new).await?;
        info!(task_id = task.id, "task submitted (strict surface)");
        self.dispatch(task.id).await;
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Queue a `pending` task behind the concurrency gate and run it.
    ///
    /// The returned handle resolves to the task's terminal outcome; the
    /// orchestrator awaits it to fire completion events. Fire-and-forget
    /// callers simply drop it.
    pub async fn dispatch(&self, task_id: i64) -> JoinHandle<TaskOutcome> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.lock().await.insert(task_id, cancel_tx);

        let gate = self.gate.clone();
        let executor = self.executor.clone();
        let store = self.store.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let permit = match gate.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed only at shutdown.
                    active.lock().await.remove(&task_id);
                    return TaskOutcome::Cancelled;
                }
            };

            // Cancelled while queued: finalize without launching an executor.
            let outcome = if *cancel_rx.borrow() {
                match store
                    .finalize(task_id, TaskOutcome::Cancelled, "cancelled by request")
                    .await
                {
                    Ok(()) => TaskOutcome::Cancelled,
                    Err(e) => {
                        warn!(task_id, error = %e, "could not finalize queued cancel");
                        TaskOutcome::Cancelled
                    }
                }
            } else {
                executor.run(task_id, cancel_rx).await
            };

            drop(permit);
            active.lock().await.remove(&task_id);
            outcome
        })
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Best-effort, idempotent cancel. Returns the task's status after the
    /// mutation; cancelling a terminal task is a no-op success.
    pub async fn cancel(&self, task_id: i64) -> Result<TaskStatus, SchedulerError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status.is_terminal() {
            return Ok(task.status);
        }

        // Signal a dispatched executor if there is one.
        let signalled = {
            let active = self.active.lock().await;
            match active.get(&task_id) {
                Some(tx) => tx.send(true).is_ok(),
                None => false,
            }
        };

        if signalled {
            info!(task_id, "cancel signalled to executor");
            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or(StoreError::TaskNotFound(task_id))?;
            return Ok(task.status);
        }

        // Never dispatched (e.g. `waiting` on dependencies): finalize here.
        match self
            .store
            .finalize(task_id, TaskOutcome::Cancelled, "cancelled by request")
            .await
        {
            Ok(()) => Ok(TaskStatus::Cancelled),
            // Lost a race with the executor finalizing; report what won.
            Err(StoreError::InvalidTransition { .. }) => {
                let task = self
                    .store
                    .get_task(task_id)
                    .await?
                    .ok_or(StoreError::TaskNotFound(task_id))?;
                Ok(task.status)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel every non-terminal member, then mark the orchestration
    /// cancelled. Idempotent.
    pub async fn cancel_orchestration(
        &self,
        orch_id: i64,
    ) -> Result<Orchestration, SchedulerError> {
        let orch = self
            .store
            .get_orchestration(orch_id)
            .await?
            .ok_or(StoreError::OrchestrationNotFound(orch_id))?;
        if orch.status.is_terminal() {
            return Ok(orch);
        }

        let members = self.store.tasks_by_orchestration(orch_id).await?;
        for member in members.iter().filter(|t| !t.status.is_terminal()) {
            if let Err(e) = self.cancel(member.id).await {
                warn!(task_id = member.id, error = %e, "member cancel failed");
            }
        }

        self.store.update_orchestration_counts(orch_id).await?;
        self.store
            .finalize_orchestration(orch_id, OrchestrationStatus::Cancelled)
            .await?;
        info!(orch_id, "orchestration cancelled");
        Ok(self
            .store
            .get_orchestration(orch_id)
            .await?
            .ok_or(StoreError::OrchestrationNotFound(orch_id))?)
    }

    // -----------------------------------------------------------------------
    // Startup recovery
    // -----------------------------------------------------------------------

    /// Requeue work left behind by a previous process.
    ///
    /// `running` rows get their orphaned agent child killed (if it survived
    /// the crash), a recovery marker in their logs, and go back to
    /// `pending`; standalone `pending` rows are re-dispatched. Orchestrated
    /// rows are left for the orchestrator to resume. Returns the ids this
    /// pass dispatched.
    pub async fn recover_on_startup(&self) -> Result<Vec<i64>, StoreError> {
        let stranded = self.store.load_pending_on_startup().await?;
        let mut dispatched = Vec::new();

        for task in stranded {
            if task.status == TaskStatus::Running {
                let orphan_killed = self.kill_orphaned_agent(&task);
                self.write_recovery_marker(&task, orphan_killed).await;
                if let Err(e) = self.store.requeue_for_recovery(task.id).await {
                    warn!(task_id = task.id, error = %e, "requeue failed");
                    continue;
                }
                info!(task_id = task.id, "requeued task from crashed run");
            }

            // Orchestrated members are resumed by their orchestration run.
            if task.orchestration_id.is_some() {
                continue;
            }

            match task.status {
                TaskStatus::Pending | TaskStatus::Running => {
                    self.dispatch(task.id).await;
                    dispatched.push(task.id);
                }
                _ => {}
            }
        }
        Ok(dispatched)
    }

    /// Terminate the agent child a crashed run left behind, if it is still
    /// alive. `kill_on_drop` only fires inside a live process, so a
    /// SIGKILLed daemon strands its children; respawning against the same
    /// working directory would race the survivor. Returns `true` when a
    /// process was killed.
    ///
    /// The stored pid is only trusted when it still resolves to the agent
    /// binary — pids get recycled, and rows claimed before the agent
    /// spawned still carry the dead scheduler's own pid.
    fn kill_orphaned_agent(&self, task: &Task) -> bool {
        let Some(pid) = task.pid else {
            return false;
        };
        if pid == std::process::id() {
            return false;
        }

        let sys_pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(sys_pid) {
            return false;
        }
        let Some(process) = system.process(sys_pid) else {
            return false;
        };
        if !process.name().contains(&self.agent_binary) {
            warn!(
                task_id = task.id,
                pid,
                name = process.name(),
                "stale pid no longer belongs to an agent; leaving it alone"
            );
            return false;
        }

        let killed = process.kill();
        if killed {
            info!(task_id = task.id, pid, "terminated orphaned agent process");
        } else {
            warn!(task_id = task.id, pid, "failed to kill orphaned agent");
        }
        killed
    }

    async fn write_recovery_marker(&self, task: &Task, orphan_killed: bool) {
        match TaskLogSink::open(&task.summary_log_path, &task.detailed_log_path).await {
            Ok(mut sink) => {
                let _ = sink
                    .summary(
                        SummaryCode::Recovery,
                        "service restarted mid-task; requeued",
                    )
                    .await;
                let _ = sink
                    .detailed("[recovery] previous process died while this task was running; the task has been requeued")
                    .await;
                if orphan_killed {
                    let _ = sink
                        .detailed(&format!(
                            "[recovery] terminated orphaned agent process (pid {})",
                            task.pid.unwrap_or_default()
                        ))
                        .await;
                }
                let _ = sink.close().await;
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "could not write recovery marker");
            }
        }
    }
}
