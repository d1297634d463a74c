//! Daemon wiring: config -> store -> scheduler/orchestrator -> maintenance
//! loops.
//!
//! The daemon owns the long-lived services and exposes the submit/query/
//! cancel surface that the external presentation layers (HTTP, CLI, tool
//! front-end) mount. `run()` performs startup recovery, spawns the monitor
//! and breaker-sweep loops on timers, and parks until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use gf_agents::executor::TaskExecutor;
use gf_agents::spawner::{AgentSpawner, ClaudeSpawner};
use gf_core::config::Config;
use gf_core::store::{StoreError, TaskStore};
use gf_core::types::{GroupTask, NewTask, Orchestration, Task, TaskStatus};
use gf_harness::breaker::{BreakerConfig, CircuitBreaker};
use gf_harness::retry::{BackoffSchedule, RetryPolicy};
use gf_harness::shutdown::ShutdownSignal;

use crate::monitor::ResourceMonitor;
use crate::orchestrator::{AdmissionError, Orchestrator};
use crate::scheduler::{Scheduler, SchedulerError};

// ---------------------------------------------------------------------------
// Intervals
// ---------------------------------------------------------------------------

/// Timer cadence for the daemon's maintenance loops.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// Resource monitor sampling (default: 60s).
    pub monitor_secs: u64,
    /// Circuit breaker stale-record sweep (default: 3600s).
    pub breaker_sweep_secs: u64,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self {
            monitor_secs: 60,
            breaker_sweep_secs: 3_600,
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct Daemon {
    config: Config,
    store: Arc<TaskStore>,
    scheduler: Arc<Scheduler>,
    orchestrator: Arc<Orchestrator>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<ResourceMonitor>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the store and wire the services with the production spawner.
    ///
    /// A corrupt database surfaces here as [`StoreError::Corrupt`]; the
    /// caller must refuse to run.
    pub async fn new(config: Config) -> Result<Self, StoreError> {
        Self::with_spawner(config, Arc::new(ClaudeSpawner::new())).await
    }

    /// Wire the daemon with a custom agent spawner (tests script this).
    pub async fn with_spawner(
        config: Config,
        spawner: Arc<dyn AgentSpawner>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(TaskStore::open(config.db_path(), config.log_dir()).await?);

        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_dir(),
            BreakerConfig {
                failure_threshold: config.breaker.failure_threshold,
                cooldown: Duration::from_secs(config.breaker.cooldown_secs),
                half_open_successes: config.breaker.half_open_successes,
            },
        ));

        let schedule = BackoffSchedule::parse(&config.retry.schedule).unwrap_or_else(|| {
            warn!(
                schedule = %config.retry.schedule,
                "unknown retry schedule, falling back to exponential"
            );
            BackoffSchedule::Exponential
        });
        let policy = RetryPolicy {
            max_attempts: config.retry.max_attempts,
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            schedule,
            jitter: true,
        };

        let agent_binary = spawner.binary_name().to_string();
        let executor = Arc::new(TaskExecutor::new(
            store.clone(),
            spawner,
            breaker.clone(),
            policy,
            config.scheduler.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            executor,
            config.scheduler.max_concurrent,
            agent_binary,
        ));
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), scheduler.clone()));
        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
        let intervals = DaemonIntervals {
            monitor_secs: config.monitor.interval_secs,
            ..DaemonIntervals::default()
        };

        Ok(Self {
            config,
            store,
            scheduler,
            orchestrator,
            breaker,
            monitor,
            intervals,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    // -----------------------------------------------------------------------
    // Submit / query / cancel surface
    // -----------------------------------------------------------------------

    pub async fn submit(&self, new: NewTask) -> Result<Task, SchedulerError> {
        self.scheduler.submit(new).await
    }

    pub async fn submit_strict(&self, new: NewTask) -> Result<Task, SchedulerError> {
        self.scheduler.submit_strict(new).await
    }

    /// Batch submit: all-or-nothing admission, background execution.
    pub async fn submit_group(&self, specs: Vec<GroupTask>) -> Result<Orchestration, AdmissionError> {
        let (orch, _tasks) = self.orchestrator.admit(specs).await?;
        self.orchestrator.start(orch.id);
        Ok(orch)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>, StoreError> {
        self.store.get_task(task_id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.store.list_tasks().await
    }

    pub async fn get_orchestration(
        &self,
        orch_id: i64,
    ) -> Result<Option<(Orchestration, Vec<Task>)>, StoreError> {
        let Some(orch) = self.store.get_orchestration(orch_id).await? else {
            return Ok(None);
        };
        let members = self.store.tasks_by_orchestration(orch_id).await?;
        Ok(Some((orch, members)))
    }

    pub async fn list_orchestrations(&self) -> Result<Vec<Orchestration>, StoreError> {
        self.store.list_orchestrations().await
    }

    pub async fn cancel(&self, task_id: i64) -> Result<TaskStatus, SchedulerError> {
        self.scheduler.cancel(task_id).await
    }

    pub async fn cancel_orchestration(
        &self,
        orch_id: i64,
    ) -> Result<Orchestration, SchedulerError> {
        self.scheduler.cancel_orchestration(orch_id).await
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Recover stranded work, start the maintenance loops, and park until
    /// shutdown is triggered.
    pub async fn run(&self) -> Result<(), StoreError> {
        self.recover().await?;

        info!(
            monitor_secs = self.intervals.monitor_secs,
            breaker_sweep_secs = self.intervals.breaker_sweep_secs,
            max_concurrent = self.scheduler.max_concurrent(),
            "daemon started"
        );

        self.run_loops().await;
        info!("daemon stopped");
        Ok(())
    }

    /// Requeue stranded tasks and resume unfinished orchestrations.
    pub async fn recover(&self) -> Result<(), StoreError> {
        let dispatched = self.scheduler.recover_on_startup().await?;
        if !dispatched.is_empty() {
            info!(count = dispatched.len(), "requeued standalone tasks");
        }

        for orch in self.store.list_orchestrations().await? {
            if !orch.status.is_terminal() {
                info!(orch_id = orch.id, "resuming orchestration");
                self.orchestrator.start(orch.id);
            }
        }
        Ok(())
    }

    /// The maintenance loop: resource sampling and breaker sweeping on
    /// timers, until shutdown. Forgetting either timer is the documented
    /// leak, so both live in this single select loop.
    async fn run_loops(&self) {
        let mut monitor_interval =
            tokio::time::interval(Duration::from_secs(self.intervals.monitor_secs.max(1)));
        let mut sweep_interval =
            tokio::time::interval(Duration::from_secs(self.intervals.breaker_sweep_secs.max(1)));

        // Consume the immediate first ticks so loops don't all fire at t=0.
        monitor_interval.tick().await;
        sweep_interval.tick().await;

        let retention =
            Duration::from_secs(u64::from(self.config.breaker.retention_days) * 24 * 3_600);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = monitor_interval.tick() => {
                    let monitor = self.monitor.clone();
                    // Sampling touches procfs; keep it off the scheduler.
                    let _ = tokio::task::spawn_blocking(move || monitor.record()).await;
                }
                _ = sweep_interval.tick() => {
                    match self.breaker.sweep_stale(retention).await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "breaker sweep removed stale records");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "breaker sweep failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping maintenance loops");
                    break;
                }
            }
        }
    }
}
