//! Task rows: leases, outputs, step states and log progress.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{Row, params};

use super::db::{ActionsDb, optional, parse_enum};
use crate::models::*;
use crate::token::{self, SaltedToken};

const TASK_COLUMNS: &str = "id, job_id, run_id, repo_id, owner_id, runner_id, attempt, status,
    token_last_eight, log_index, log_length, log_in_storage, log_expired, lease_expires_at, steps,
    started_at, stopped_at, created_at, updated_at";

struct TaskRow {
    id: i64,
    job_id: i64,
    run_id: i64,
    repo_id: i64,
    owner_id: i64,
    runner_id: Option<i64>,
    attempt: i64,
    status: String,
    token_last_eight: String,
    log_index: i64,
    log_length: i64,
    log_in_storage: bool,
    log_expired: bool,
    lease_expires_at: Option<String>,
    steps: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            run_id: row.get(2)?,
            repo_id: row.get(3)?,
            owner_id: row.get(4)?,
            runner_id: row.get(5)?,
            attempt: row.get(6)?,
            status: row.get(7)?,
            token_last_eight: row.get(8)?,
            log_index: row.get(9)?,
            log_length: row.get(10)?,
            log_in_storage: row.get(11)?,
            log_expired: row.get(12)?,
            lease_expires_at: row.get(13)?,
            steps: row.get(14)?,
            started_at: row.get(15)?,
            stopped_at: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let steps: Vec<StepState> =
            serde_json::from_str(&self.steps).context("Failed to parse task steps JSON")?;
        Ok(Task {
            id: self.id,
            job_id: self.job_id,
            run_id: self.run_id,
            repo_id: self.repo_id,
            owner_id: self.owner_id,
            runner_id: self.runner_id,
            attempt: self.attempt,
            status: parse_enum(&self.status, "task status")?,
            token_last_eight: self.token_last_eight,
            log_index: self.log_index,
            log_length: self.log_length,
            log_in_storage: self.log_in_storage,
            log_expired: self.log_expired,
            lease_expires_at: self.lease_expires_at,
            steps,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl ActionsDb {
    /// Insert the task for a job that was just moved to `Running`.
    pub fn insert_task(
        &self,
        job: &Job,
        runner_id: i64,
        lease: &SaltedToken,
        lease_expires_at: &str,
    ) -> Result<i64> {
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO tasks (job_id, run_id, repo_id, owner_id, runner_id, attempt, status,
                    token_hash, token_salt, token_last_eight, lease_expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'assigned', ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    job.id,
                    job.run_id,
                    job.repo_id,
                    job.owner_id,
                    runner_id,
                    job.attempt,
                    lease.hash,
                    lease.salt,
                    lease.last_eight,
                    lease_expires_at,
                    now,
                ],
            )
            .context("Failed to insert task")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = optional(self.conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            TaskRow::from_row,
        ))
        .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Check a presented lease token against the stored salted hash.
    pub fn verify_task_token(&self, id: i64, presented: &str) -> Result<bool> {
        let stored: Option<(String, String)> = optional(self.conn.query_row(
            "SELECT token_salt, token_hash FROM tasks WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))
        .context("Failed to query task token")?;
        Ok(stored.is_some_and(|(salt, hash)| token::verify(presented, &salt, &hash)))
    }

    pub fn list_tasks_for_job(&self, job_id: i64) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!("SELECT {} FROM tasks WHERE job_id = ?1 ORDER BY id", TASK_COLUMNS),
            params![job_id],
        )
    }

    pub fn task_ids_for_run(&self, run_id: i64) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, repo_id FROM tasks WHERE run_id = ?1")
            .context("Failed to prepare task id query")?;
        let rows = stmt
            .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query task ids")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read task id")?);
        }
        Ok(ids)
    }

    /// Non-terminal tasks whose lease ran out before `now`.
    pub fn tasks_with_expired_lease(&self, now: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE status IN ('waiting', 'assigned', 'running')
                 AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1 ORDER BY id",
                TASK_COLUMNS
            ),
            params![now],
        )
    }

    /// Non-terminal tasks created before `cutoff`, however alive their lease.
    pub fn tasks_started_before(&self, cutoff: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE status IN ('waiting', 'assigned', 'running')
                 AND created_at < ?1 ORDER BY id",
                TASK_COLUMNS
            ),
            params![cutoff],
        )
    }

    /// Finished tasks with a stored, unexpired log that stopped before `cutoff`.
    pub fn tasks_with_logs_before(&self, cutoff: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE log_expired = 0 AND stopped_at IS NOT NULL
                 AND stopped_at < ?1 ORDER BY id",
                TASK_COLUMNS
            ),
            params![cutoff],
        )
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params, TaskRow::from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn renew_task_lease(&self, id: i64, expires_at: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET lease_expires_at = ?1 WHERE id = ?2
                 AND status IN ('waiting', 'assigned', 'running')",
                params![expires_at, id],
            )
            .context("Failed to renew task lease")?;
        Ok(())
    }

    /// Advance a task's status. Terminal tasks never move again; the
    /// return value says whether this call changed anything.
    pub fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<bool> {
        let now = now_ts();
        let n = if status.is_terminal() {
            self.conn.execute(
                "UPDATE tasks SET status = ?1, stopped_at = ?2, lease_expires_at = NULL,
                    started_at = COALESCE(started_at, ?2), updated_at = ?2
                 WHERE id = ?3 AND status IN ('waiting', 'assigned', 'running')",
                params![status.as_str(), now, id],
            )
        } else {
            self.conn.execute(
                "UPDATE tasks SET status = ?1, started_at = COALESCE(started_at, ?2), updated_at = ?2
                 WHERE id = ?3 AND status IN ('waiting', 'assigned', 'running')",
                params![status.as_str(), now, id],
            )
        }
        .context("Failed to update task status")?;
        Ok(n > 0)
    }

    pub fn set_task_steps(&self, id: i64, steps: &[StepState]) -> Result<()> {
        let json = serde_json::to_string(steps).context("Failed to encode task steps")?;
        self.conn
            .execute(
                "UPDATE tasks SET steps = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now_ts(), id],
            )
            .context("Failed to update task steps")?;
        Ok(())
    }

    pub fn set_task_log_progress(&self, id: i64, log_index: i64, log_length: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET log_index = ?1, log_length = ?2, updated_at = ?3 WHERE id = ?4",
                params![log_index, log_length, now_ts(), id],
            )
            .context("Failed to update task log progress")?;
        Ok(())
    }

    pub fn mark_task_log_in_storage(&self, id: i64, log_length: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET log_in_storage = 1, log_length = ?1, updated_at = ?2 WHERE id = ?3",
                params![log_length, now_ts(), id],
            )
            .context("Failed to mark task log stored")?;
        Ok(())
    }

    pub fn mark_task_log_expired(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET log_expired = 1, updated_at = ?1 WHERE id = ?2",
                params![now_ts(), id],
            )
            .context("Failed to mark task log expired")?;
        Ok(())
    }

    // ── Outputs ───────────────────────────────────────────────────────

    /// Store an output unless the key was already written. Returns whether
    /// this call stored it.
    pub fn insert_task_output(&self, task_id: i64, key: &str, value: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO task_outputs (task_id, key, value) VALUES (?1, ?2, ?3)",
                params![task_id, key, value],
            )
            .context("Failed to insert task output")?;
        Ok(n > 0)
    }

    pub fn task_outputs(&self, task_id: i64) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM task_outputs WHERE task_id = ?1 ORDER BY key")
            .context("Failed to prepare output query")?;
        let rows = stmt
            .query_map(params![task_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query task outputs")?;
        let mut outputs = BTreeMap::new();
        for row in rows {
            let (k, v): (String, String) = row.context("Failed to read task output")?;
            outputs.insert(k, v);
        }
        Ok(outputs)
    }
}
