//! DAG orchestration: admit groups of dependent tasks, gate each task on
//! its predecessors with one-shot completion events, and propagate
//! skip/failure semantics.
//!
//! Dependency waits are purely event-driven — each task owns a watch
//! channel fired exactly once with its terminal outcome, and waiters block
//! on those events, never on store polling. The orchestrator knows tasks;
//! tasks never know the orchestrator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use gf_core::store::{StoreError, TaskStore};
use gf_core::types::{
    GroupTask, Orchestration, OrchestrationStatus, Task, TaskOutcome, TaskStatus, ValidationError,
};

use crate::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("orchestration must contain at least one task")]
    Empty,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("duplicate task identifier `{0}`")]
    DuplicateIdentifier(String),
    #[error("task `{task}` depends on unknown task `{dependency}`")]
    UnknownDependency { task: String, dependency: String },
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

type CompletionTx = watch::Sender<Option<TaskOutcome>>;
type CompletionRx = watch::Receiver<Option<TaskOutcome>>;

pub struct Orchestrator {
    store: Arc<TaskStore>,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    pub fn new(store: Arc<TaskStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Validate the batch and persist it atomically. Rejection leaves no
    /// rows behind. Execution does not start here — call [`start`]
    /// (Self::start) with the returned orchestration id.
    pub async fn admit(
        &self,
        specs: Vec<GroupTask>,
    ) -> Result<(Orchestration, Vec<Task>), AdmissionError> {
        if specs.is_empty() {
            return Err(AdmissionError::Empty);
        }
        for spec in &specs {
            spec.validate()?;
        }

        {
            let mut seen = HashSet::new();
            for spec in &specs {
                if !seen.insert(spec.identifier.as_str()) {
                    return Err(AdmissionError::DuplicateIdentifier(spec.identifier.clone()));
                }
            }

            let graph: HashMap<&str, &[String]> = specs
                .iter()
                .map(|s| (s.identifier.as_str(), s.depends_on.as_slice()))
                .collect();
            for spec in &specs {
                for dep in &spec.depends_on {
                    if !graph.contains_key(dep.as_str()) {
                        return Err(AdmissionError::UnknownDependency {
                            task: spec.identifier.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
            detect_cycle(&graph)?;
        }

        let (orch, tasks) = self.store.create_orchestration(specs).await?;
        info!(
            orch_id = orch.id,
            tasks = tasks.len(),
            "orchestration admitted"
        );
        Ok((orch, tasks))
    }

    /// Spawn the orchestration run in the background.
    pub fn start(self: &Arc<Self>, orch_id: i64) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(orch_id).await {
                warn!(orch_id, error = %e, "orchestration run failed");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Drive every member to a terminal state and finalize the aggregate.
    ///
    /// Safe to call on a partially-executed orchestration (startup
    /// recovery): members already terminal fire their events immediately.
    pub async fn run(&self, orch_id: i64) -> Result<Orchestration, StoreError> {
        let members = self.store.tasks_by_orchestration(orch_id).await?;

        let orch = self
            .store
            .get_orchestration(orch_id)
            .await?
            .ok_or(StoreError::OrchestrationNotFound(orch_id))?;
        if orch.status == OrchestrationStatus::Pending {
            self.store.orchestration_started(orch_id).await?;
        }

        // One completion event per member, fired exactly once.
        let mut senders: HashMap<String, CompletionTx> = HashMap::new();
        let mut receivers: HashMap<String, CompletionRx> = HashMap::new();
        for member in &members {
            if let Some(identifier) = &member.task_identifier {
                let (tx, rx) = watch::channel(None);
                senders.insert(identifier.clone(), tx);
                receivers.insert(identifier.clone(), rx);
            }
        }

        let mut units = Vec::new();
        for member in members {
            let Some(identifier) = member.task_identifier.clone() else {
                warn!(task_id = member.id, "orchestrated task without identifier");
                continue;
            };
            let Some(tx) = senders.remove(&identifier) else {
                continue;
            };
            let dep_events: Vec<(String, CompletionRx)> = member
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();

            let store = self.store.clone();
            let scheduler = self.scheduler.clone();
            units.push(tokio::spawn(async move {
                let outcome = run_member(&store, &scheduler, &member, dep_events).await;
                // Fire the completion event exactly once.
                tx.send_replace(Some(outcome));
                if let Err(e) = store.update_orchestration_counts(orch_id).await {
                    warn!(orch_id, error = %e, "count update failed");
                }
            }));
        }
        drop(receivers);

        for unit in units {
            let _ = unit.await;
        }

        self.finalize(orch_id).await
    }

    /// Derive and persist the aggregate terminal status.
    async fn finalize(&self, orch_id: i64) -> Result<Orchestration, StoreError> {
        let orch = self.store.update_orchestration_counts(orch_id).await?;
        if orch.status.is_terminal() {
            // An explicit cancel already finalized the aggregate.
            return Ok(orch);
        }
        let status = if orch.failed_tasks > 0 {
            OrchestrationStatus::Failed
        } else if orch.completed_tasks == orch.total_tasks {
            OrchestrationStatus::Completed
        } else {
            OrchestrationStatus::Cancelled
        };
        self.store.finalize_orchestration(orch_id, status).await?;
        info!(orch_id, status = ?status, "orchestration finalized");
        self.store
            .get_orchestration(orch_id)
            .await?
            .ok_or(StoreError::OrchestrationNotFound(orch_id))
    }
}

// ---------------------------------------------------------------------------
// Per-member unit
// ---------------------------------------------------------------------------

/// Wait for dependencies, then run (or skip) one member task.
async fn run_member(
    store: &TaskStore,
    scheduler: &Scheduler,
    member: &Task,
    dep_events: Vec<(String, CompletionRx)>,
) -> TaskOutcome {
    // Resume support: members that already finished just re-fire.
    if member.status.is_terminal() {
        return status_outcome(member.status);
    }

    // Event-driven dependency wait: block on every predecessor's one-shot
    // event. No store polling happens here.
    let mut failed_dep: Option<String> = None;
    for (name, mut rx) in dep_events {
        let outcome = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => value.unwrap_or(TaskOutcome::Failed),
            // Sender vanished (orchestration torn down mid-run).
            Err(_) => TaskOutcome::Failed,
        };
        if outcome != TaskOutcome::Completed && failed_dep.is_none() {
            failed_dep = Some(name);
        }
    }

    if let Some(dep) = failed_dep {
        let reason = format!("dependency '{dep}' did not complete");
        return match store.finalize(member.id, TaskOutcome::Skipped, &reason).await {
            Ok(()) => {
                info!(task_id = member.id, dep, "task skipped");
                TaskOutcome::Skipped
            }
            Err(_) => current_outcome(store, member.id).await,
        };
    }

    // Release the member for dispatch.
    if member.status == TaskStatus::Waiting {
        if let Err(e) = store
            .transition(member.id, TaskStatus::Waiting, TaskStatus::Pending)
            .await
        {
            warn!(task_id = member.id, error = %e, "could not release waiting task");
            return current_outcome(store, member.id).await;
        }
    }

    if member.wait_after_dependencies > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(member.wait_after_dependencies)).await;
    }

    let handle = scheduler.dispatch(member.id).await;
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(task_id = member.id, error = %e, "executor task panicked");
            current_outcome(store, member.id).await
        }
    }
}

fn status_outcome(status: TaskStatus) -> TaskOutcome {
    match status {
        TaskStatus::Completed => TaskOutcome::Completed,
        TaskStatus::Skipped => TaskOutcome::Skipped,
        TaskStatus::Cancelled => TaskOutcome::Cancelled,
        _ => TaskOutcome::Failed,
    }
}

/// Re-read the row to report what actually happened after a lost race.
async fn current_outcome(store: &TaskStore, task_id: i64) -> TaskOutcome {
    match store.get_task(task_id).await {
        Ok(Some(task)) => status_outcome(task.status),
        _ => TaskOutcome::Failed,
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Depth-first search with gray/black marking; the first back edge found is
/// reported with the path that reached it.
fn detect_cycle(graph: &HashMap<&str, &[String]>) -> Result<(), AdmissionError> {
    let mut marks: HashMap<&str, Mark> = graph.keys().map(|k| (*k, Mark::White)).collect();
    let mut nodes: Vec<&str> = graph.keys().copied().collect();
    nodes.sort_unstable();

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), AdmissionError> {
        marks.insert(node, Mark::Gray);
        path.push(node);
        for dep in graph.get(node).copied().unwrap_or_default() {
            match marks.get(dep.as_str()).copied().unwrap_or(Mark::White) {
                Mark::Gray => {
                    // Back edge: close the cycle path for the diagnostic.
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Err(AdmissionError::Cycle { path: cycle });
                }
                Mark::White => visit(dep.as_str(), graph, marks, path)?,
                Mark::Black => {}
            }
        }
        path.pop();
        marks.insert(node, Mark::Black);
        Ok(())
    }

    for node in nodes {
        if marks.get(node).copied() == Some(Mark::White) {
            let mut path = Vec::new();
            visit(node, graph, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
