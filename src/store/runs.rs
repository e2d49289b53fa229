//! Run and job rows.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{Row, params};

use super::db::{ActionsDb, optional, parse_enum};
use crate::models::*;

/// Everything needed to insert a run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub repo_id: i64,
    pub owner_id: i64,
    pub workflow_id: String,
    pub title: String,
    pub event: TriggerEvent,
    pub commit_sha: String,
    pub ref_name: String,
    pub trigger_user: String,
    pub concurrency_group: Option<String>,
    pub needs_approval: bool,
    pub is_fork_pull_request: bool,
    pub inputs: BTreeMap<String, String>,
}

/// Everything needed to insert a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub job_key: String,
    pub base_key: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub matrix: BTreeMap<String, String>,
    pub if_expr: Option<String>,
    pub runs_regardless: bool,
    pub depth: i64,
    pub payload: String,
}

const RUN_COLUMNS: &str = "id, repo_id, owner_id, workflow_id, title, event, commit_sha, ref_name,
    trigger_user, run_number, attempt, status, concurrency_group, needs_approval, approved_by,
    is_fork_pull_request, inputs, started_at, stopped_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, run_id, repo_id, owner_id, commit_sha, name, job_key, base_key,
    needs, runs_on, matrix, if_expr, runs_regardless, depth, pending_needs, failed_needs, status,
    skip_cause, attempt, task_id, payload, queued_at, started_at, stopped_at, created_at, updated_at";

struct RunRow {
    id: i64,
    repo_id: i64,
    owner_id: i64,
    workflow_id: String,
    title: String,
    event: String,
    commit_sha: String,
    ref_name: String,
    trigger_user: String,
    run_number: i64,
    attempt: i64,
    status: String,
    concurrency_group: Option<String>,
    needs_approval: bool,
    approved_by: Option<String>,
    is_fork_pull_request: bool,
    inputs: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_id: row.get(1)?,
            owner_id: row.get(2)?,
            workflow_id: row.get(3)?,
            title: row.get(4)?,
            event: row.get(5)?,
            commit_sha: row.get(6)?,
            ref_name: row.get(7)?,
            trigger_user: row.get(8)?,
            run_number: row.get(9)?,
            attempt: row.get(10)?,
            status: row.get(11)?,
            concurrency_group: row.get(12)?,
            needs_approval: row.get(13)?,
            approved_by: row.get(14)?,
            is_fork_pull_request: row.get(15)?,
            inputs: row.get(16)?,
            started_at: row.get(17)?,
            stopped_at: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let inputs: BTreeMap<String, String> =
            serde_json::from_str(&self.inputs).context("Failed to parse run inputs JSON")?;
        Ok(Run {
            id: self.id,
            repo_id: self.repo_id,
            owner_id: self.owner_id,
            workflow_id: self.workflow_id,
            title: self.title,
            event: TriggerEvent::from(self.event),
            commit_sha: self.commit_sha,
            ref_name: self.ref_name,
            trigger_user: self.trigger_user,
            run_number: self.run_number,
            attempt: self.attempt,
            status: parse_enum(&self.status, "run status")?,
            concurrency_group: self.concurrency_group,
            needs_approval: self.needs_approval,
            approved_by: self.approved_by,
            is_fork_pull_request: self.is_fork_pull_request,
            inputs,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct JobRow {
    id: i64,
    run_id: i64,
    repo_id: i64,
    owner_id: i64,
    commit_sha: String,
    name: String,
    job_key: String,
    base_key: String,
    needs: String,
    runs_on: String,
    matrix: String,
    if_expr: Option<String>,
    runs_regardless: bool,
    depth: i64,
    pending_needs: i64,
    failed_needs: i64,
    status: String,
    skip_cause: Option<String>,
    attempt: i64,
    task_id: Option<i64>,
    payload: String,
    queued_at: Option<String>,
    started_at: Option<String>,
    stopped_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            repo_id: row.get(2)?,
            owner_id: row.get(3)?,
            commit_sha: row.get(4)?,
            name: row.get(5)?,
            job_key: row.get(6)?,
            base_key: row.get(7)?,
            needs: row.get(8)?,
            runs_on: row.get(9)?,
            matrix: row.get(10)?,
            if_expr: row.get(11)?,
            runs_regardless: row.get(12)?,
            depth: row.get(13)?,
            pending_needs: row.get(14)?,
            failed_needs: row.get(15)?,
            status: row.get(16)?,
            skip_cause: row.get(17)?,
            attempt: row.get(18)?,
            task_id: row.get(19)?,
            payload: row.get(20)?,
            queued_at: row.get(21)?,
            started_at: row.get(22)?,
            stopped_at: row.get(23)?,
            created_at: row.get(24)?,
            updated_at: row.get(25)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let needs: Vec<String> =
            serde_json::from_str(&self.needs).context("Failed to parse job needs JSON")?;
        let runs_on: Vec<String> =
            serde_json::from_str(&self.runs_on).context("Failed to parse job runs_on JSON")?;
        let matrix: BTreeMap<String, String> =
            serde_json::from_str(&self.matrix).context("Failed to parse job matrix JSON")?;
        let skip_cause = self
            .skip_cause
            .as_deref()
            .map(|s| parse_enum::<SkipCause>(s, "skip cause"))
            .transpose()?;
        Ok(Job {
            id: self.id,
            run_id: self.run_id,
            repo_id: self.repo_id,
            owner_id: self.owner_id,
            commit_sha: self.commit_sha,
            name: self.name,
            job_key: self.job_key,
            base_key: self.base_key,
            needs,
            runs_on,
            matrix,
            if_expr: self.if_expr,
            runs_regardless: self.runs_regardless,
            depth: self.depth,
            pending_needs: self.pending_needs,
            failed_needs: self.failed_needs,
            status: parse_enum(&self.status, "job status")?,
            skip_cause,
            attempt: self.attempt,
            task_id: self.task_id,
            payload: self.payload,
            queued_at: self.queued_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl ActionsDb {
    // ── Runs ──────────────────────────────────────────────────────────

    /// Allocate the next run number for a repository. Numbers are never
    /// reused, even after the newest run is deleted.
    pub fn next_run_number(&self, repo_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "INSERT INTO run_index (repo_id, max_index) VALUES (?1, 1)
                 ON CONFLICT(repo_id) DO UPDATE SET max_index = max_index + 1
                 RETURNING max_index",
                params![repo_id],
                |row| row.get(0),
            )
            .context("Failed to allocate run number")
    }

    pub fn insert_run(&self, run: &NewRun, run_number: i64) -> Result<i64> {
        let now = now_ts();
        let inputs = serde_json::to_string(&run.inputs).context("Failed to encode run inputs")?;
        self.conn
            .execute(
                "INSERT INTO runs (repo_id, owner_id, workflow_id, title, event, commit_sha, ref_name,
                    trigger_user, run_number, status, concurrency_group, needs_approval,
                    is_fork_pull_request, inputs, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'running', ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    run.repo_id,
                    run.owner_id,
                    run.workflow_id,
                    run.title,
                    run.event.as_str(),
                    run.commit_sha,
                    run.ref_name,
                    run.trigger_user,
                    run_number,
                    run.concurrency_group,
                    run.needs_approval,
                    run.is_fork_pull_request,
                    inputs,
                    now,
                ],
            )
            .context("Failed to insert run")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let row = optional(self.conn.query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![id],
            RunRow::from_row,
        ))
        .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn list_runs(&self, repo_id: i64) -> Result<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM runs WHERE repo_id = ?1 ORDER BY run_number DESC",
                RUN_COLUMNS
            ),
            params![repo_id],
        )
    }

    /// Non-terminal runs in a concurrency group.
    pub fn active_runs_in_group(&self, repo_id: i64, group: &str) -> Result<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM runs WHERE repo_id = ?1 AND concurrency_group = ?2
                 AND status = 'running' ORDER BY id",
                RUN_COLUMNS
            ),
            params![repo_id, group],
        )
    }

    /// Non-terminal runs of the same workflow, ref and event.
    pub fn active_runs_for_ref(
        &self,
        repo_id: i64,
        ref_name: &str,
        workflow_id: &str,
        event: &TriggerEvent,
    ) -> Result<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM runs WHERE repo_id = ?1 AND ref_name = ?2 AND workflow_id = ?3
                 AND event = ?4 AND status = 'running' ORDER BY id",
                RUN_COLUMNS
            ),
            params![repo_id, ref_name, workflow_id, event.as_str()],
        )
    }

    /// Non-terminal runs of any workflow for a ref and event.
    pub fn active_runs_for_event(
        &self,
        repo_id: i64,
        ref_name: &str,
        event: &TriggerEvent,
    ) -> Result<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM runs WHERE repo_id = ?1 AND ref_name = ?2 AND event = ?3
                 AND status = 'running' ORDER BY id",
                RUN_COLUMNS
            ),
            params![repo_id, ref_name, event.as_str()],
        )
    }

    pub fn list_run_ids_for_repo(&self, repo_id: i64) -> Result<Vec<i64>> {
        self.query_ids("SELECT id FROM runs WHERE repo_id = ?1", params![repo_id])
    }

    pub fn list_run_ids_for_owner(&self, owner_id: i64) -> Result<Vec<i64>> {
        self.query_ids("SELECT id FROM runs WHERE owner_id = ?1", params![owner_id])
    }

    fn query_runs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare run query")?;
        let rows = stmt
            .query_map(params, RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    pub(crate) fn query_ids(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare id query")?;
        let rows = stmt
            .query_map(params, |row| row.get(0))
            .context("Failed to query ids")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read id")?);
        }
        Ok(ids)
    }

    pub fn approve_run_row(&self, id: i64, approver: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET needs_approval = 0, approved_by = ?1, updated_at = ?2 WHERE id = ?3",
                params![approver, now_ts(), id],
            )
            .context("Failed to approve run")?;
        Ok(())
    }

    pub fn bump_run_attempt(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET attempt = attempt + 1, stopped_at = NULL, updated_at = ?1 WHERE id = ?2",
                params![now_ts(), id],
            )
            .context("Failed to bump run attempt")?;
        Ok(())
    }

    /// Recompute the cached run status from its jobs. Returns the new status
    /// when it changed.
    pub fn refresh_run_status(&self, run_id: i64) -> Result<Option<RunStatus>> {
        let Some(run) = self.get_run(run_id)? else {
            return Ok(None);
        };
        let statuses: Vec<JobStatus> = self.list_jobs(run_id)?.iter().map(|j| j.status).collect();
        let status = RunStatus::aggregate(statuses.iter().copied());
        let started = statuses
            .iter()
            .any(|s| !matches!(s, JobStatus::Blocked | JobStatus::Waiting));

        let now = now_ts();
        let started_at = match (&run.started_at, started) {
            (Some(at), _) => Some(at.clone()),
            (None, true) => Some(now.clone()),
            (None, false) => None,
        };
        let stopped_at = if status.is_terminal() {
            run.stopped_at.clone().or_else(|| Some(now.clone()))
        } else {
            None
        };
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, started_at = ?2, stopped_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![status.as_str(), started_at, stopped_at, now, run_id],
            )
            .context("Failed to update run status")?;

        Ok((status != run.status).then_some(status))
    }

    pub fn delete_run_row(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM runs WHERE id = ?1", params![id])
            .context("Failed to delete run")?;
        Ok(n > 0)
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn insert_job(&self, run: &Run, job: &NewJob) -> Result<i64> {
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO jobs (run_id, repo_id, owner_id, commit_sha, name, job_key, base_key,
                    needs, runs_on, matrix, if_expr, runs_regardless, depth, pending_needs,
                    status, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'blocked', ?15, ?16, ?16)",
                params![
                    run.id,
                    run.repo_id,
                    run.owner_id,
                    run.commit_sha,
                    job.name,
                    job.job_key,
                    job.base_key,
                    serde_json::to_string(&job.needs).context("Failed to encode needs")?,
                    serde_json::to_string(&job.runs_on).context("Failed to encode runs_on")?,
                    serde_json::to_string(&job.matrix).context("Failed to encode matrix")?,
                    job.if_expr,
                    job.runs_regardless,
                    job.depth,
                    job.needs.len() as i64,
                    job.payload,
                    now,
                ],
            )
            .context("Failed to insert job")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_job_need(&self, job_id: i64, need_id: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO job_needs (job_id, need_id) VALUES (?1, ?2)",
                params![job_id, need_id],
            )
            .context("Failed to insert job edge")?;
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = optional(self.conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            JobRow::from_row,
        ))
        .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs(&self, run_id: i64) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!("SELECT {} FROM jobs WHERE run_id = ?1 ORDER BY id", JOB_COLUMNS),
            params![run_id],
        )
    }

    /// `Waiting` jobs in claim order, restricted to what a runner in `scope`
    /// may see.
    pub fn waiting_jobs_for_scope(&self, scope: Scope) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs WHERE status = 'waiting'
                 AND ((?1 > 0 AND repo_id = ?1)
                   OR (?1 = 0 AND ?2 > 0 AND owner_id = ?2)
                   OR (?1 = 0 AND ?2 = 0))
                 ORDER BY queued_at, id",
                JOB_COLUMNS
            ),
            params![scope.repo_id, scope.owner_id],
        )
    }

    /// Jobs stuck in `Waiting` since before `cutoff`.
    pub fn waiting_jobs_queued_before(&self, cutoff: &str) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM jobs WHERE status = 'waiting' AND queued_at < ?1 ORDER BY id",
                JOB_COLUMNS
            ),
            params![cutoff],
        )
    }

    fn query_jobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare job query")?;
        let rows = stmt
            .query_map(params, JobRow::from_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Reverse edges: ids of jobs that need `job_id`.
    pub fn dependents_of(&self, job_id: i64) -> Result<Vec<i64>> {
        self.query_ids(
            "SELECT job_id FROM job_needs WHERE need_id = ?1 ORDER BY job_id",
            params![job_id],
        )
    }

    /// Forward edges: ids of jobs `job_id` needs.
    pub fn needs_of(&self, job_id: i64) -> Result<Vec<i64>> {
        self.query_ids(
            "SELECT need_id FROM job_needs WHERE job_id = ?1 ORDER BY need_id",
            params![job_id],
        )
    }

    /// `Blocked` → `Waiting`, stamping the queue position.
    pub fn mark_job_waiting(&self, id: i64) -> Result<bool> {
        let now = now_ts();
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'waiting', skip_cause = NULL, queued_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status IN ('blocked', 'waiting')",
                params![now, id],
            )
            .context("Failed to mark job waiting")?;
        Ok(n > 0)
    }

    /// Move a job to a terminal status. `Running` jobs keep their
    /// `started_at`; the stop time is stamped now.
    pub fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        skip_cause: Option<SkipCause>,
    ) -> Result<bool> {
        let now = now_ts();
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1, skip_cause = ?2, stopped_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status NOT IN ('succeeded', 'failed', 'cancelled', 'skipped')",
                params![status.as_str(), skip_cause.map(|c| c.as_str()), now, id],
            )
            .context("Failed to finish job")?;
        Ok(n > 0)
    }

    /// Record one resolved need on a blocked job. Returns the updated
    /// `(pending_needs, failed_needs)`.
    pub fn resolve_one_need(&self, id: i64, failed: bool) -> Result<Option<(i64, i64)>> {
        optional(self.conn.query_row(
            "UPDATE jobs SET pending_needs = MAX(pending_needs - 1, 0),
                failed_needs = failed_needs + ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'blocked'
             RETURNING pending_needs, failed_needs",
            params![failed as i64, now_ts(), id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))
        .context("Failed to resolve job need")
    }

    /// Put a job back into the state machine for a rerun.
    pub fn reset_job(&self, id: i64, status: JobStatus, pending: i64, failed: i64) -> Result<()> {
        let now = now_ts();
        let queued_at = (status == JobStatus::Waiting).then(|| now.clone());
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1, skip_cause = NULL, pending_needs = ?2,
                    failed_needs = ?3, task_id = NULL, queued_at = ?4, started_at = NULL,
                    stopped_at = NULL, updated_at = ?5
                 WHERE id = ?6",
                params![status.as_str(), pending, failed, queued_at, now, id],
            )
            .context("Failed to reset job")?;
        Ok(())
    }

    /// The single compare-and-swap that decides which runner wins a job:
    /// only a job still `Waiting` can be moved to `Running`.
    pub fn claim_job(&self, id: i64) -> Result<bool> {
        let now = now_ts();
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'running', attempt = attempt + 1, started_at = ?1,
                    updated_at = ?1
                 WHERE id = ?2 AND status = 'waiting'",
                params![now, id],
            )
            .context("Failed to claim job")?;
        Ok(n == 1)
    }

    pub fn set_job_task(&self, id: i64, task_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET task_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![task_id, now_ts(), id],
            )
            .context("Failed to link job task")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run(repo_id: i64) -> NewRun {
        NewRun {
            repo_id,
            owner_id: 1,
            workflow_id: ".gitea/workflows/ci.yml".to_string(),
            title: "ci".to_string(),
            event: TriggerEvent::Push,
            commit_sha: "abc123".to_string(),
            ref_name: "refs/heads/main".to_string(),
            trigger_user: "alice".to_string(),
            concurrency_group: None,
            needs_approval: false,
            is_fork_pull_request: false,
            inputs: BTreeMap::new(),
        }
    }

    fn new_job(key: &str, needs: &[&str]) -> NewJob {
        NewJob {
            name: key.to_string(),
            job_key: key.to_string(),
            base_key: key.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            runs_on: vec!["ubuntu-latest".to_string()],
            matrix: BTreeMap::new(),
            if_expr: None,
            runs_regardless: false,
            depth: 0,
            payload: "{}".to_string(),
        }
    }

    #[test]
    fn test_run_numbers_are_monotonic_per_repo() {
        let db = ActionsDb::new_in_memory().unwrap();
        assert_eq!(db.next_run_number(1).unwrap(), 1);
        assert_eq!(db.next_run_number(1).unwrap(), 2);
        assert_eq!(db.next_run_number(2).unwrap(), 1);

        let n = db.next_run_number(1).unwrap();
        let id = db.insert_run(&new_run(1), n).unwrap();
        db.delete_run_row(id).unwrap();
        assert_eq!(db.next_run_number(1).unwrap(), 4);
    }

    #[test]
    fn test_insert_and_get_run() {
        let db = ActionsDb::new_in_memory().unwrap();
        let mut run = new_run(9);
        run.inputs.insert("level".to_string(), "debug".to_string());
        let id = db.insert_run(&run, 1).unwrap();

        let got = db.get_run(id).unwrap().unwrap();
        assert_eq!(got.repo_id, 9);
        assert_eq!(got.event, TriggerEvent::Push);
        assert_eq!(got.status, RunStatus::Running);
        assert_eq!(got.inputs["level"], "debug");
        assert!(db.get_run(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_jobs_edges_and_cascade() {
        let db = ActionsDb::new_in_memory().unwrap();
        let run_id = db.insert_run(&new_run(1), 1).unwrap();
        let run = db.get_run(run_id).unwrap().unwrap();

        let a = db.insert_job(&run, &new_job("a", &[])).unwrap();
        let b = db.insert_job(&run, &new_job("b", &["a"])).unwrap();
        db.insert_job_need(b, a).unwrap();

        assert_eq!(db.dependents_of(a).unwrap(), vec![b]);
        assert_eq!(db.needs_of(b).unwrap(), vec![a]);
        let job_b = db.get_job(b).unwrap().unwrap();
        assert_eq!(job_b.status, JobStatus::Blocked);
        assert_eq!(job_b.pending_needs, 1);

        db.delete_run_row(run_id).unwrap();
        assert!(db.get_job(a).unwrap().is_none());
        assert!(db.dependents_of(a).unwrap().is_empty());
    }

    #[test]
    fn test_claim_job_is_compare_and_swap() {
        let db = ActionsDb::new_in_memory().unwrap();
        let run_id = db.insert_run(&new_run(1), 1).unwrap();
        let run = db.get_run(run_id).unwrap().unwrap();
        let a = db.insert_job(&run, &new_job("a", &[])).unwrap();

        assert!(!db.claim_job(a).unwrap(), "blocked jobs cannot be claimed");
        db.mark_job_waiting(a).unwrap();
        assert!(db.claim_job(a).unwrap());
        assert!(!db.claim_job(a).unwrap(), "second claim must lose");
        assert_eq!(db.get_job(a).unwrap().unwrap().attempt, 1);
    }

    #[test]
    fn test_resolve_one_need_counts_down() {
        let db = ActionsDb::new_in_memory().unwrap();
        let run_id = db.insert_run(&new_run(1), 1).unwrap();
        let run = db.get_run(run_id).unwrap().unwrap();
        let c = db.insert_job(&run, &new_job("c", &["a", "b"])).unwrap();

        assert_eq!(db.resolve_one_need(c, false).unwrap(), Some((1, 0)));
        assert_eq!(db.resolve_one_need(c, true).unwrap(), Some((0, 1)));
        db.finish_job(c, JobStatus::Skipped, Some(SkipCause::UpstreamFailed)).unwrap();
        assert_eq!(db.resolve_one_need(c, false).unwrap(), None);
    }

    #[test]
    fn test_refresh_run_status() {
        let db = ActionsDb::new_in_memory().unwrap();
        let run_id = db.insert_run(&new_run(1), 1).unwrap();
        let run = db.get_run(run_id).unwrap().unwrap();
        let a = db.insert_job(&run, &new_job("a", &[])).unwrap();
        let b = db.insert_job(&run, &new_job("b", &[])).unwrap();

        assert_eq!(db.refresh_run_status(run_id).unwrap(), None);
        db.finish_job(a, JobStatus::Succeeded, None).unwrap();
        assert_eq!(db.refresh_run_status(run_id).unwrap(), None);
        db.finish_job(b, JobStatus::Failed, None).unwrap();
        assert_eq!(db.refresh_run_status(run_id).unwrap(), Some(RunStatus::Failed));

        let run = db.get_run(run_id).unwrap().unwrap();
        assert!(run.started_at.is_some());
        assert!(run.stopped_at.is_some());
    }
}
