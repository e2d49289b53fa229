//! JobScheduler: the job state machine and everything that moves it.
//!
//! State transitions are plain synchronous functions in [`state`], run
//! inside one SQLite transaction each. They return an [`Effects`] record
//! which the async [`JobScheduler`] applies after commit: waking parked
//! runners, removing log blobs and reporting to the [`StatusSink`].

pub mod notify;
pub(crate) mod state;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::{ActionsError, ActionsResult};
use crate::models::*;
use crate::store::{ActionsDb, DbHandle, LogStore, NewRun};
use crate::workflow::JobGraph;

pub use notify::VersionNotifier;

/// Side effects of a committed transition, applied outside the transaction.
#[derive(Debug, Default)]
pub struct Effects {
    /// Scopes whose tasks version moved.
    pub woken: BTreeSet<Scope>,
    /// Jobs whose status changed, as of commit.
    pub jobs: Vec<Job>,
    /// Runs whose aggregate status changed, as of commit.
    pub runs: Vec<Run>,
    pub removed_runners: Vec<String>,
    /// `(repo_id, task_id)` of log blobs to delete.
    pub removed_logs: Vec<(i64, i64)>,
}

/// Commit-status / notification collaborator. Fire-and-forget: failures are
/// logged and never roll anything back.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn job_changed(&self, job: &Job) -> anyhow::Result<()>;
    async fn run_changed(&self, run: &Run) -> anyhow::Result<()>;
}

/// Sink that only logs; used when no forge integration is configured.
pub struct TracingSink;

#[async_trait]
impl StatusSink for TracingSink {
    async fn job_changed(&self, job: &Job) -> anyhow::Result<()> {
        debug!(job_id = job.id, run_id = job.run_id, status = job.status.as_str(), "Job status");
        Ok(())
    }

    async fn run_changed(&self, run: &Run) -> anyhow::Result<()> {
        info!(
            run_id = run.id,
            repo_id = run.repo_id,
            commit = %run.commit_sha,
            status = run.status.as_str(),
            "Run status"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct JobScheduler {
    db: DbHandle,
    logs: LogStore,
    notifier: VersionNotifier,
    sink: Arc<dyn StatusSink>,
}

impl JobScheduler {
    pub fn new(
        db: DbHandle,
        logs: LogStore,
        notifier: VersionNotifier,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            db,
            logs,
            notifier,
            sink,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn notifier(&self) -> &VersionNotifier {
        &self.notifier
    }

    /// Run `f` in one transaction, then apply its effects.
    pub(crate) async fn transact<R, F>(&self, f: F) -> ActionsResult<R>
    where
        F: FnOnce(&ActionsDb, &mut Effects) -> ActionsResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (value, fx) = self
            .db
            .call(move |db| {
                db.transaction(|db| {
                    let mut fx = Effects::default();
                    let value = f(db, &mut fx)?;
                    Ok::<_, ActionsError>((value, fx))
                })
            })
            .await?;
        self.apply(fx).await;
        Ok(value)
    }

    /// Apply committed effects.
    pub async fn apply(&self, fx: Effects) {
        self.notifier.notify_all(&fx.woken);

        if !fx.removed_logs.is_empty() {
            let logs = self.logs.clone();
            let removed = fx.removed_logs;
            let result = tokio::task::spawn_blocking(move || {
                for (repo_id, task_id) in removed {
                    if let Err(e) = logs.remove(repo_id, task_id) {
                        warn!(task_id, error = %e, "Failed to remove task log");
                    }
                }
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, "Log removal task panicked");
            }
        }

        if fx.jobs.is_empty() && fx.runs.is_empty() {
            return;
        }
        let sink = self.sink.clone();
        let (jobs, runs) = (fx.jobs, fx.runs);
        tokio::spawn(async move {
            for job in &jobs {
                if let Err(e) = sink.job_changed(job).await {
                    warn!(job_id = job.id, error = %e, "Status sink rejected job update");
                }
            }
            for run in &runs {
                if let Err(e) = sink.run_changed(run).await {
                    warn!(run_id = run.id, error = %e, "Status sink rejected run update");
                }
            }
        });
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Persist a run built from `graph`. Nothing is written if any step fails.
    pub async fn create_run(&self, new_run: NewRun, graph: JobGraph) -> ActionsResult<Run> {
        self.transact(move |db, fx| Ok(state::insert_run_graph(db, &new_run, &graph, fx)?))
            .await
    }

    pub async fn get_run(&self, run_id: i64) -> ActionsResult<Run> {
        self.db
            .call(move |db| {
                db.get_run(run_id)?
                    .ok_or_else(|| ActionsError::not_found("run", run_id))
            })
            .await
    }

    pub async fn list_runs(&self, repo_id: i64) -> ActionsResult<Vec<Run>> {
        self.db
            .call(move |db| Ok::<_, ActionsError>(db.list_runs(repo_id)?))
            .await
    }

    pub async fn get_job(&self, job_id: i64) -> ActionsResult<Job> {
        self.db
            .call(move |db| {
                db.get_job(job_id)?
                    .ok_or_else(|| ActionsError::not_found("job", job_id))
            })
            .await
    }

    pub async fn list_jobs(&self, run_id: i64) -> ActionsResult<Vec<Job>> {
        self.db
            .call(move |db| {
                if db.get_run(run_id)?.is_none() {
                    return Err(ActionsError::not_found("run", run_id));
                }
                Ok(db.list_jobs(run_id)?)
            })
            .await
    }

    pub async fn get_task(&self, task_id: i64) -> ActionsResult<Task> {
        self.db
            .call(move |db| {
                db.get_task(task_id)?
                    .ok_or_else(|| ActionsError::not_found("task", task_id))
            })
            .await
    }

    /// Cancel every non-terminal job of a run. Runners holding its tasks
    /// learn about it on their next `UpdateTask`.
    pub async fn cancel_run(&self, run_id: i64) -> ActionsResult<Run> {
        self.transact(move |db, fx| {
            let run = db
                .get_run(run_id)?
                .ok_or_else(|| ActionsError::not_found("run", run_id))?;
            if run.status.is_terminal() {
                return Err(ActionsError::InvalidState(format!(
                    "run {} already finished",
                    run_id
                )));
            }
            state::cancel_run(db, run_id, fx)?;
            Ok(db
                .get_run(run_id)?
                .ok_or_else(|| ActionsError::not_found("run", run_id))?)
        })
        .await
    }

    pub async fn cancel_job(&self, job_id: i64) -> ActionsResult<Job> {
        self.transact(move |db, fx| {
            let job = db
                .get_job(job_id)?
                .ok_or_else(|| ActionsError::not_found("job", job_id))?;
            if job.status.is_terminal() {
                return Err(ActionsError::InvalidState(format!(
                    "job {} already finished",
                    job_id
                )));
            }
            state::cancel_job(db, &job, fx)?;
            Ok(db
                .get_job(job_id)?
                .ok_or_else(|| ActionsError::not_found("job", job_id))?)
        })
        .await
    }

    /// Release a fork pull request run held for approval.
    pub async fn approve_run(&self, run_id: i64, approver: String) -> ActionsResult<Run> {
        self.transact(move |db, fx| {
            let run = db
                .get_run(run_id)?
                .ok_or_else(|| ActionsError::not_found("run", run_id))?;
            if !run.needs_approval {
                return Err(ActionsError::InvalidState(format!(
                    "run {} does not need approval",
                    run_id
                )));
            }
            db.approve_run_row(run_id, &approver)?;
            info!(run_id, approver = %approver, "Run approved");
            if !run.status.is_terminal() {
                state::enqueue_roots(db, run_id, fx)?;
            }
            Ok(db
                .get_run(run_id)?
                .ok_or_else(|| ActionsError::not_found("run", run_id))?)
        })
        .await
    }

    /// Delete a finished run with its jobs, tasks, outputs and log blobs.
    pub async fn delete_run(&self, run_id: i64) -> ActionsResult<()> {
        self.transact(move |db, fx| {
            let run = db
                .get_run(run_id)?
                .ok_or_else(|| ActionsError::not_found("run", run_id))?;
            if !run.status.is_terminal() {
                return Err(ActionsError::InvalidState(format!(
                    "run {} is still running",
                    run_id
                )));
            }
            delete_run_rows(db, run_id, fx)?;
            info!(run_id, repo_id = run.repo_id, "Deleted run");
            Ok(())
        })
        .await
    }

    /// Remove every run, schedule and runner belonging to a repository.
    pub async fn purge_repository(&self, repo_id: i64) -> ActionsResult<usize> {
        self.transact(move |db, fx| {
            let runs = db.list_run_ids_for_repo(repo_id)?;
            for &run_id in &runs {
                delete_run_rows(db, run_id, fx)?;
            }
            db.delete_schedules_for_repo(repo_id)?;
            fx.removed_runners.extend(db.delete_runners_for_repo(repo_id)?);
            state::release_runners(db, fx)?;
            info!(repo_id, runs = runs.len(), "Purged repository actions data");
            Ok(runs.len())
        })
        .await
    }

    /// Remove every run, schedule and runner belonging to an owner.
    pub async fn purge_owner(&self, owner_id: i64) -> ActionsResult<usize> {
        self.transact(move |db, fx| {
            let runs = db.list_run_ids_for_owner(owner_id)?;
            for &run_id in &runs {
                delete_run_rows(db, run_id, fx)?;
            }
            db.delete_schedules_for_owner(owner_id)?;
            fx.removed_runners.extend(db.delete_runners_for_owner(owner_id)?);
            state::release_runners(db, fx)?;
            info!(owner_id, runs = runs.len(), "Purged owner actions data");
            Ok(runs.len())
        })
        .await
    }
}

fn delete_run_rows(db: &ActionsDb, run_id: i64, fx: &mut Effects) -> anyhow::Result<()> {
    fx.removed_logs.extend(db.task_ids_for_run(run_id)?.into_iter().map(|(id, repo)| (repo, id)));
    db.delete_run_row(run_id)?;
    state::release_runners(db, fx)
}
