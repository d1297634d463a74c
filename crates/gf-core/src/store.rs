//! The sole gateway to persistent state.
//!
//! One `tokio_rusqlite::Connection` serializes every mutation onto the
//! database file's worker thread. There is deliberately no connection pool:
//! on a single-file engine the file itself is the serializer, and layering a
//! pool on top only adds race windows between writers.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio_rusqlite::Connection;

use crate::paths::{log_filename, LogKind};
use crate::types::{
    GroupTask, ModelTier, NewTask, Orchestration, OrchestrationStatus, Task, TaskOutcome,
    TaskStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("database file failed integrity check: {0}")]
    Corrupt(String),
    #[error("task {0} not found")]
    TaskNotFound(i64),
    #[error("orchestration {0} not found")]
    OrchestrationNotFound(i64),
    #[error("task {id}: expected status {expected:?}, found {actual:?}")]
    StatusConflict {
        id: i64,
        expected: TaskStatus,
        actual: TaskStatus,
    },
    #[error("task {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
}

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_utc(raw: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed store for tasks and orchestrations.
pub struct TaskStore {
    conn: Connection,
    log_dir: PathBuf,
}

impl TaskStore {
    /// Open (or create) the store at the given file path.
    ///
    /// Runs `PRAGMA integrity_check` before accepting the file; a corrupt
    /// database is fatal and the caller must refuse to start.
    pub async fn open(
        db_path: impl AsRef<Path>,
        log_dir: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
        }
        let conn = Connection::open(db_path.as_ref()).await?;
        let store = Self {
            conn,
            log_dir: log_dir.into(),
        };
        store.check_integrity().await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory store (useful for tests).
    pub async fn open_in_memory(log_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self {
            conn,
            log_dir: log_dir.into(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Directory where per-task log files are created.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    async fn check_integrity(&self) -> Result<(), StoreError> {
        let verdict: String = self
            .conn
            .call(|conn| {
                let v = conn.query_row("PRAGMA integrity_check", [], |r| r.get::<_, String>(0))?;
                Ok(v)
            })
            .await?;
        if verdict != "ok" {
            return Err(StoreError::Corrupt(verdict));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS orchestrations (
                        id              INTEGER PRIMARY KEY AUTOINCREMENT,
                        status          TEXT NOT NULL,
                        total_tasks     INTEGER NOT NULL DEFAULT 0,
                        completed_tasks INTEGER NOT NULL DEFAULT 0,
                        failed_tasks    INTEGER NOT NULL DEFAULT 0,
                        skipped_tasks   INTEGER NOT NULL DEFAULT 0,
                        created_at      TEXT NOT NULL,
                        started_at      TEXT,
                        ended_at        TEXT
                    );

                    CREATE TABLE IF NOT EXISTS tasks (
                        id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                        status                  TEXT NOT NULL,
                        tier                    TEXT NOT NULL,
                        working_dir             TEXT NOT NULL,
                        system_prompt           TEXT,
                        execution_prompt        TEXT NOT NULL,
                        summary_log_path        TEXT NOT NULL,
                        detailed_log_path       TEXT NOT NULL,
                        last_action             TEXT,
                        final_summary           TEXT,
                        error_message           TEXT,
                        pid                     INTEGER,
                        created_at              TEXT NOT NULL,
                        started_at              TEXT,
                        ended_at                TEXT,
                        orchestration_id        INTEGER REFERENCES orchestrations(id),
                        task_identifier         TEXT,
                        depends_on              TEXT,
                        wait_after_dependencies REAL NOT NULL DEFAULT 0,
                        UNIQUE(orchestration_id, task_identifier)
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_orch   ON tasks(orchestration_id);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Task CRUD
    // -----------------------------------------------------------------------

    /// Allocate an id, precompute both log paths, and insert the row in
    /// `pending`. The paths embed the id, so the insert and the path update
    /// share one transaction.
    pub async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let log_dir = self.log_dir.clone();
        let created_at = Utc::now();
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO tasks (status, tier, working_dir, system_prompt,
                        execution_prompt, summary_log_path, detailed_log_path, created_at)
                     VALUES (?1,?2,?3,?4,?5,'','',?6)",
                    rusqlite::params![
                        enum_to_sql(&TaskStatus::Pending),
                        enum_to_sql(&new.tier),
                        new.working_dir,
                        new.system_prompt,
                        new.execution_prompt,
                        created_at.to_rfc3339(),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                let summary = log_dir.join(log_filename(
                    id,
                    &new.working_dir,
                    LogKind::Summary,
                    created_at,
                ));
                let detailed = log_dir.join(log_filename(
                    id,
                    &new.working_dir,
                    LogKind::Detailed,
                    created_at,
                ));
                tx.execute(
                    "UPDATE tasks SET summary_log_path = ?2, detailed_log_path = ?3 WHERE id = ?1",
                    rusqlite::params![
                        id,
                        summary.to_string_lossy().into_owned(),
                        detailed.to_string_lossy().into_owned(),
                    ],
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await?;

        self.get_task(id).await?.ok_or(StoreError::TaskNotFound(id))
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let task = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_TASK} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(task)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_TASK} ORDER BY id"))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    pub async fn tasks_by_orchestration(&self, orch_id: i64) -> Result<Vec<Task>, StoreError> {
        let tasks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("{SELECT_TASK} WHERE orchestration_id = ?1 ORDER BY id"))?;
                let mut rows = stmt.query(rusqlite::params![orch_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    /// Rows left in non-terminal states by a previous process.
    pub async fn load_pending_on_startup(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_TASK} WHERE status IN ('pending','waiting','running') ORDER BY id"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Compare-and-set status transition between non-terminal states.
    ///
    /// Fails with [`StoreError::StatusConflict`] if the row is not currently
    /// in `from`. Terminal states are reached through [`finalize`]
    /// (Self::finalize) only.
    pub async fn transition(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<(), StoreError> {
        if to.is_terminal() {
            return Err(StoreError::InvalidTransition { id, from, to });
        }
        if !from.can_transition_to(&to) {
            return Err(StoreError::InvalidTransition { id, from, to });
        }
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT status FROM tasks WHERE id = ?1",
                        rusqlite::params![id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(current) = current else {
                    return Ok(Err(StoreError::TaskNotFound(id)));
                };
                let actual: TaskStatus = enum_from_sql(&current);
                if actual != from {
                    return Ok(Err(StoreError::StatusConflict {
                        id,
                        expected: from,
                        actual,
                    }));
                }
                tx.execute(
                    "UPDATE tasks SET status = ?2 WHERE id = ?1",
                    rusqlite::params![id, enum_to_sql(&to)],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?;
        outcome
    }

    /// CAS `pending -> running`, capturing `started_at` and the worker pid.
    pub async fn mark_running(&self, id: i64, pid: u32) -> Result<(), StoreError> {
        let started_at = Utc::now().to_rfc3339();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT status FROM tasks WHERE id = ?1",
                        rusqlite::params![id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(current) = current else {
                    return Ok(Err(StoreError::TaskNotFound(id)));
                };
                let actual: TaskStatus = enum_from_sql(&current);
                if actual != TaskStatus::Pending {
                    return Ok(Err(StoreError::StatusConflict {
                        id,
                        expected: TaskStatus::Pending,
                        actual,
                    }));
                }
                tx.execute(
                    "UPDATE tasks SET status = 'running', pid = ?2, started_at = ?3
                     WHERE id = ?1",
                    rusqlite::params![id, pid as i64, started_at],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?;
        outcome
    }

    /// Replace the worker pid on a `running` row with the agent child's pid
    /// once the child is spawned. Crash recovery reads this to find and
    /// terminate orphaned agents.
    pub async fn update_worker_pid(&self, id: i64, pid: Option<u32>) -> Result<(), StoreError> {
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET pid = ?2 WHERE id = ?1 AND status = 'running'",
                    rusqlite::params![id, pid.map(|p| p as i64)],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    /// Crash recovery: put a `running` row left behind by a dead process
    /// back into `pending` so the scheduler can requeue it.
    ///
    /// This is the one path that moves a row out of `running` without
    /// finalizing it; it exists only for startup recovery, where the
    /// process that claimed the row no longer exists. `started_at` is kept
    /// (the row did run) and is overwritten on the rerun.
    pub async fn requeue_for_recovery(&self, id: i64) -> Result<(), StoreError> {
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = 'pending', pid = NULL
                     WHERE id = ?1 AND status = 'running'",
                    rusqlite::params![id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    /// Update the `last_action` cache. The cache only advances — a line is
    /// never cleared once set.
    pub async fn append_action(&self, id: i64, line: &str) -> Result<(), StoreError> {
        let line = line.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET last_action = ?2 WHERE id = ?1",
                    rusqlite::params![id, line],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    /// Terminal transition: sets `ended_at` plus exactly one of
    /// `final_summary` / `error_message`, and clears the worker pid.
    ///
    /// `Completed` stores the message as the final summary; every other
    /// outcome stores it as the error message.
    pub async fn finalize(
        &self,
        id: i64,
        outcome: TaskOutcome,
        message: &str,
    ) -> Result<(), StoreError> {
        let to = outcome.status();
        let message = message.to_string();
        let ended_at = Utc::now().to_rfc3339();
        let result = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT status FROM tasks WHERE id = ?1",
                        rusqlite::params![id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(current) = current else {
                    return Ok(Err(StoreError::TaskNotFound(id)));
                };
                let from: TaskStatus = enum_from_sql(&current);
                if !from.can_transition_to(&to) {
                    return Ok(Err(StoreError::InvalidTransition { id, from, to }));
                }
                let (final_summary, error_message) = match outcome {
                    TaskOutcome::Completed => (Some(message), None),
                    _ => (None, Some(message)),
                };
                tx.execute(
                    "UPDATE tasks SET status = ?2, final_summary = ?3, error_message = ?4,
                        ended_at = ?5, pid = NULL
                     WHERE id = ?1",
                    rusqlite::params![id, enum_to_sql(&to), final_summary, error_message, ended_at],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?;
        result
    }

    // -----------------------------------------------------------------------
    // Orchestrations
    // -----------------------------------------------------------------------

    /// Insert an orchestration and all member tasks atomically.
    ///
    /// Members with at least one dependency start in `waiting`; roots start
    /// in `pending`. The caller is responsible for graph validation — this
    /// method only guarantees all-or-nothing persistence (the per-group
    /// identifier uniqueness is also enforced by the schema).
    pub async fn create_orchestration(
        &self,
        specs: Vec<GroupTask>,
    ) -> Result<(Orchestration, Vec<Task>), StoreError> {
        let log_dir = self.log_dir.clone();
        let created_at = Utc::now();
        let orch_id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO orchestrations (status, total_tasks, created_at)
                     VALUES ('pending', ?1, ?2)",
                    rusqlite::params![specs.len() as i64, created_at.to_rfc3339()],
                )?;
                let orch_id = tx.last_insert_rowid();
                for spec in &specs {
                    let status = if spec.depends_on.is_empty() {
                        TaskStatus::Pending
                    } else {
                        TaskStatus::Waiting
                    };
                    let depends_on = serde_json::to_string(&spec.depends_on)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    tx.execute(
                        "INSERT INTO tasks (status, tier, working_dir, system_prompt,
                            execution_prompt, summary_log_path, detailed_log_path, created_at,
                            orchestration_id, task_identifier, depends_on,
                            wait_after_dependencies)
                         VALUES (?1,?2,?3,?4,?5,'','',?6,?7,?8,?9,?10)",
                        rusqlite::params![
                            enum_to_sql(&status),
                            enum_to_sql(&spec.task.tier),
                            spec.task.working_dir,
                            spec.task.system_prompt,
                            spec.task.execution_prompt,
                            created_at.to_rfc3339(),
                            orch_id,
                            spec.identifier,
                            depends_on,
                            spec.wait_after_dependencies,
                        ],
                    )?;
                    let id = tx.last_insert_rowid();
                    let summary = log_dir.join(log_filename(
                        id,
                        &spec.task.working_dir,
                        LogKind::Summary,
                        created_at,
                    ));
                    let detailed = log_dir.join(log_filename(
                        id,
                        &spec.task.working_dir,
                        LogKind::Detailed,
                        created_at,
                    ));
                    tx.execute(
                        "UPDATE tasks SET summary_log_path = ?2, detailed_log_path = ?3
                         WHERE id = ?1",
                        rusqlite::params![
                            id,
                            summary.to_string_lossy().into_owned(),
                            detailed.to_string_lossy().into_owned(),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(orch_id)
            })
            .await?;

        let orch = self
            .get_orchestration(orch_id)
            .await?
            .ok_or(StoreError::OrchestrationNotFound(orch_id))?;
        let tasks = self.tasks_by_orchestration(orch_id).await?;
        Ok((orch, tasks))
    }

    pub async fn get_orchestration(&self, id: i64) -> Result<Option<Orchestration>, StoreError> {
        let orch = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_ORCH} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_orchestration(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(orch)
    }

    pub async fn list_orchestrations(&self) -> Result<Vec<Orchestration>, StoreError> {
        let orchs = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_ORCH} ORDER BY id"))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_orchestration(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(orchs)
    }

    /// Mark an orchestration running and stamp `started_at`.
    pub async fn orchestration_started(&self, id: i64) -> Result<(), StoreError> {
        let started_at = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE orchestrations SET status = 'running', started_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![id, started_at],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::OrchestrationNotFound(id));
        }
        Ok(())
    }

    /// Recompute aggregate counts after a member reached a terminal state.
    pub async fn update_orchestration_counts(&self, id: i64) -> Result<Orchestration, StoreError> {
        self.conn
            .call(move |conn| {
                let count = |status: &str| -> rusqlite::Result<i64> {
                    conn.query_row(
                        "SELECT COUNT(*) FROM tasks WHERE orchestration_id = ?1 AND status = ?2",
                        rusqlite::params![id, status],
                        |r| r.get(0),
                    )
                };
                let completed = count("completed")?;
                let failed = count("failed")?;
                let skipped = count("skipped")?;
                conn.execute(
                    "UPDATE orchestrations
                     SET completed_tasks = ?2, failed_tasks = ?3, skipped_tasks = ?4
                     WHERE id = ?1",
                    rusqlite::params![id, completed, failed, skipped],
                )?;
                Ok(())
            })
            .await?;
        self.get_orchestration(id)
            .await?
            .ok_or(StoreError::OrchestrationNotFound(id))
    }

    /// Set the terminal orchestration status and stamp `ended_at`.
    pub async fn finalize_orchestration(
        &self,
        id: i64,
        status: OrchestrationStatus,
    ) -> Result<(), StoreError> {
        let ended_at = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE orchestrations SET status = ?2, ended_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, enum_to_sql(&status), ended_at],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::OrchestrationNotFound(id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const SELECT_TASK: &str = "SELECT id, status, tier, working_dir, system_prompt,
        execution_prompt, summary_log_path, detailed_log_path, last_action,
        final_summary, error_message, pid, created_at, started_at, ended_at,
        orchestration_id, task_identifier, depends_on, wait_after_dependencies
 FROM tasks";

const SELECT_ORCH: &str = "SELECT id, status, total_tasks, completed_tasks,
        failed_tasks, skipped_tasks, created_at, started_at, ended_at
 FROM orchestrations";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(1)?;
    let tier_str: String = row.get(2)?;
    let pid_val: Option<i64> = row.get(11)?;
    let created_at_str: String = row.get(12)?;
    let started_at_str: Option<String> = row.get(13)?;
    let ended_at_str: Option<String> = row.get(14)?;
    let depends_on_str: Option<String> = row.get(17)?;

    Ok(Task {
        id: row.get(0)?,
        status: enum_from_sql(&status_str),
        tier: enum_from_sql::<ModelTier>(&tier_str),
        working_dir: row.get(3)?,
        system_prompt: row.get(4)?,
        execution_prompt: row.get(5)?,
        summary_log_path: row.get(6)?,
        detailed_log_path: row.get(7)?,
        last_action: row.get(8)?,
        final_summary: row.get(9)?,
        error_message: row.get(10)?,
        pid: pid_val.map(|p| p as u32),
        created_at: parse_utc(&created_at_str),
        started_at: started_at_str.map(|s| parse_utc(&s)),
        ended_at: ended_at_str.map(|s| parse_utc(&s)),
        orchestration_id: row.get(15)?,
        task_identifier: row.get(16)?,
        depends_on: depends_on_str
            .map(|s| serde_json::from_str(&s).expect("valid json"))
            .unwrap_or_default(),
        wait_after_dependencies: row.get(18)?,
    })
}

fn row_to_orchestration(row: &rusqlite::Row<'_>) -> rusqlite::Result<Orchestration> {
    let status_str: String = row.get(1)?;
    let created_at_str: String = row.get(6)?;
    let started_at_str: Option<String> = row.get(7)?;
    let ended_at_str: Option<String> = row.get(8)?;

    Ok(Orchestration {
        id: row.get(0)?,
        status: enum_from_sql(&status_str),
        total_tasks: row.get::<_, i64>(2)? as u32,
        completed_tasks: row.get::<_, i64>(3)? as u32,
        failed_tasks: row.get::<_, i64>(4)? as u32,
        skipped_tasks: row.get::<_, i64>(5)? as u32,
        created_at: parse_utc(&created_at_str),
        started_at: started_at_str.map(|s| parse_utc(&s)),
        ended_at: ended_at_str.map(|s| parse_utc(&s)),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(prompt: &str) -> NewTask {
        NewTask {
            execution_prompt: prompt.to_string(),
            working_dir: "/tmp/project".to_string(),
            system_prompt: None,
            tier: ModelTier::Balanced,
        }
    }

    async fn memory_store() -> TaskStore {
        TaskStore::open_in_memory("/tmp/gaffer-test-logs")
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = memory_store().await;
        let task = store
            .create_task(new_task("write /tmp/hello.txt containing hi"))
            .await
            .unwrap();

        assert_eq!(task.id, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.summary_log_path.contains("task_1_"));
        assert!(task.summary_log_path.ends_with("_summary.log"));
        assert!(task.detailed_log_path.ends_with("_detailed.log"));
        assert!(task.last_action.is_none());
        assert!(task.started_at.is_none());

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_prompt, task.execution_prompt);
    }

    #[tokio::test]
    async fn ids_are_dense() {
        let store = memory_store().await;
        for expected in 1..=3 {
            let task = store.create_task(new_task("p".repeat(20).as_str())).await.unwrap();
            assert_eq!(task.id, expected);
        }
    }

    #[tokio::test]
    async fn mark_running_captures_pid_and_started_at() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();

        store.mark_running(task.id, 4242).await.unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.pid, Some(4242));
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn mark_running_is_compare_and_set() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();
        store.mark_running(task.id, 1).await.unwrap();

        let err = store.mark_running(task.id, 2).await.unwrap_err();
        match err {
            StoreError::StatusConflict { actual, .. } => {
                assert_eq!(actual, TaskStatus::Running)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transition_rejects_terminal_targets() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();
        let err = store
            .transition(task.id, TaskStatus::Pending, TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn finalize_completed_sets_summary_only() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();
        store.mark_running(task.id, 1).await.unwrap();
        store
            .finalize(task.id, TaskOutcome::Completed, "all done")
            .await
            .unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.final_summary.as_deref(), Some("all done"));
        assert!(loaded.error_message.is_none());
        assert!(loaded.ended_at.is_some());
        assert!(loaded.pid.is_none());
    }

    #[tokio::test]
    async fn finalize_failed_sets_error_only() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();
        store.mark_running(task.id, 1).await.unwrap();
        store
            .finalize(task.id, TaskOutcome::Failed, "[agent_connect] boom | hint: retry")
            .await
            .unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert!(loaded.final_summary.is_none());
        assert!(loaded.error_message.unwrap().starts_with("[agent_connect]"));
    }

    #[tokio::test]
    async fn finalize_on_terminal_row_is_rejected() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();
        store.mark_running(task.id, 1).await.unwrap();
        store
            .finalize(task.id, TaskOutcome::Completed, "done")
            .await
            .unwrap();

        let err = store
            .finalize(task.id, TaskOutcome::Failed, "late failure")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn last_action_advances_and_is_never_cleared() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();

        store.append_action(task.id, "[tool:bash] ls").await.unwrap();
        store.append_action(task.id, "[tool:edit] src/lib.rs").await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_action.as_deref(), Some("[tool:edit] src/lib.rs"));

        // Finalizing must not clear the cache.
        store.mark_running(task.id, 1).await.unwrap();
        store
            .finalize(task.id, TaskOutcome::Completed, "done")
            .await
            .unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_action.as_deref(), Some("[tool:edit] src/lib.rs"));
    }

    #[tokio::test]
    async fn create_orchestration_roots_pending_dependents_waiting() {
        let store = memory_store().await;
        let specs = vec![
            GroupTask {
                identifier: "a".into(),
                task: new_task("first task writes /tmp/a"),
                depends_on: vec![],
                wait_after_dependencies: 0.0,
            },
            GroupTask {
                identifier: "b".into(),
                task: new_task("second task writes /tmp/b"),
                depends_on: vec!["a".into()],
                wait_after_dependencies: 0.5,
            },
        ];
        let (orch, tasks) = store.create_orchestration(specs).await.unwrap();

        assert_eq!(orch.status, OrchestrationStatus::Pending);
        assert_eq!(orch.total_tasks, 2);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[1].status, TaskStatus::Waiting);
        assert_eq!(tasks[1].depends_on, vec!["a".to_string()]);
        assert_eq!(tasks[1].orchestration_id, Some(orch.id));
        assert!((tasks[1].wait_after_dependencies - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duplicate_identifier_rolls_back_whole_group() {
        let store = memory_store().await;
        let specs = vec![
            GroupTask {
                identifier: "dup".into(),
                task: new_task("first task writes /tmp/a"),
                depends_on: vec![],
                wait_after_dependencies: 0.0,
            },
            GroupTask {
                identifier: "dup".into(),
                task: new_task("second task writes /tmp/b"),
                depends_on: vec![],
                wait_after_dependencies: 0.0,
            },
        ];
        assert!(store.create_orchestration(specs).await.is_err());
        // Nothing persisted.
        assert!(store.list_tasks().await.unwrap().is_empty());
        assert!(store.list_orchestrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn orchestration_counts_recomputed() {
        let store = memory_store().await;
        let specs = vec![
            GroupTask {
                identifier: "a".into(),
                task: new_task("first task writes /tmp/a"),
                depends_on: vec![],
                wait_after_dependencies: 0.0,
            },
            GroupTask {
                identifier: "b".into(),
                task: new_task("second task writes /tmp/b"),
                depends_on: vec!["a".into()],
                wait_after_dependencies: 0.0,
            },
        ];
        let (orch, tasks) = store.create_orchestration(specs).await.unwrap();

        store.mark_running(tasks[0].id, 1).await.unwrap();
        store
            .finalize(tasks[0].id, TaskOutcome::Failed, "boom")
            .await
            .unwrap();
        store
            .finalize(tasks[1].id, TaskOutcome::Skipped, "dependency 'a' failed")
            .await
            .unwrap();

        let agg = store.update_orchestration_counts(orch.id).await.unwrap();
        assert_eq!(agg.completed_tasks, 0);
        assert_eq!(agg.failed_tasks, 1);
        assert_eq!(agg.skipped_tasks, 1);

        store
            .finalize_orchestration(orch.id, OrchestrationStatus::Failed)
            .await
            .unwrap();
        let agg = store.get_orchestration(orch.id).await.unwrap().unwrap();
        assert_eq!(agg.status, OrchestrationStatus::Failed);
        assert!(agg.ended_at.is_some());
    }

    #[tokio::test]
    async fn load_pending_on_startup_returns_non_terminal_rows() {
        let store = memory_store().await;
        let t1 = store.create_task(new_task("task one in /srv")).await.unwrap();
        let t2 = store.create_task(new_task("task two in /srv")).await.unwrap();
        let t3 = store.create_task(new_task("task three in /srv")).await.unwrap();

        store.mark_running(t2.id, 9).await.unwrap();
        store.mark_running(t3.id, 9).await.unwrap();
        store
            .finalize(t3.id, TaskOutcome::Completed, "done")
            .await
            .unwrap();

        let pending = store.load_pending_on_startup().await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![t1.id, t2.id]);
    }

    #[tokio::test]
    async fn update_worker_pid_tracks_the_agent_child() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();

        // Only running rows carry a worker pid.
        assert!(store.update_worker_pid(task.id, Some(555)).await.is_err());

        store.mark_running(task.id, 77).await.unwrap();
        store.update_worker_pid(task.id, Some(555)).await.unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.pid, Some(555));
    }

    #[tokio::test]
    async fn requeue_for_recovery_resets_running_rows_only() {
        let store = memory_store().await;
        let task = store.create_task(new_task("do the thing in /srv")).await.unwrap();

        // Not running yet: nothing to recover.
        assert!(store.requeue_for_recovery(task.id).await.is_err());

        store.mark_running(task.id, 77).await.unwrap();
        store.requeue_for_recovery(task.id).await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(loaded.pid.is_none());
        // The rerun overwrites started_at; until then it records the crashed run.
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn waiting_moves_to_pending_via_transition() {
        let store = memory_store().await;
        let specs = vec![
            GroupTask {
                identifier: "a".into(),
                task: new_task("first task writes /tmp/a"),
                depends_on: vec![],
                wait_after_dependencies: 0.0,
            },
            GroupTask {
                identifier: "b".into(),
                task: new_task("second task writes /tmp/b"),
                depends_on: vec!["a".into()],
                wait_after_dependencies: 0.0,
            },
        ];
        let (_, tasks) = store.create_orchestration(specs).await.unwrap();
        store
            .transition(tasks[1].id, TaskStatus::Waiting, TaskStatus::Pending)
            .await
            .unwrap();
        let loaded = store.get_task(tasks[1].id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
    }
}
