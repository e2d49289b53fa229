//! Periodic cleanup of work nobody is going to finish.
//!
//! - zombie tasks: lease not renewed within `zombie_task_timeout`
//! - endless tasks: still running after `endless_task_timeout`
//! - abandoned jobs: `Waiting` for longer than `abandoned_job_timeout`
//! - offline ephemeral runners without a task
//! - task logs older than the retention period

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ActionsSettings;
use crate::errors::ActionsResult;
use crate::models::*;
use crate::scheduler::{JobScheduler, state};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub zombie_tasks: usize,
    pub endless_tasks: usize,
    pub abandoned_jobs: usize,
    pub removed_runners: usize,
    pub expired_logs: usize,
}

#[derive(Clone)]
pub struct Reaper {
    scheduler: JobScheduler,
    settings: ActionsSettings,
}

fn before(now: DateTime<Utc>, age: std::time::Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(36_500));
    ts(now - age)
}

impl Reaper {
    pub fn new(scheduler: JobScheduler, settings: ActionsSettings) -> Self {
        Self {
            scheduler,
            settings,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.settings.reaper_interval.as_millis() as u64,
            "Reaper started"
        );
        let mut interval = tokio::time::interval(self.settings.reaper_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reaper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.reap(Utc::now()).await {
                        Ok(report) if report != ReapReport::default() => {
                            info!(?report, "Reaper pass finished");
                        }
                        Ok(_) => debug!("Reaper pass found nothing"),
                        Err(e) => error!(error = %e, "Reaper pass failed"),
                    }
                }
            }
        }
    }

    /// One full pass at `now`.
    pub async fn reap(&self, now: DateTime<Utc>) -> ActionsResult<ReapReport> {
        Ok(ReapReport {
            zombie_tasks: self.reap_zombie_tasks(now).await?,
            endless_tasks: self.reap_endless_tasks(now).await?,
            abandoned_jobs: self.reap_abandoned_jobs(now).await?,
            removed_runners: self.reap_offline_runners(now).await?,
            expired_logs: self.expire_logs(now).await?,
        })
    }

    pub async fn reap_zombie_tasks(&self, now: DateTime<Utc>) -> ActionsResult<usize> {
        let cutoff = ts(now);
        self.scheduler
            .transact(move |db, fx| {
                let mut reaped = 0;
                for task in db.tasks_with_expired_lease(&cutoff)? {
                    info!(task_id = task.id, runner_id = ?task.runner_id, "Failing zombie task");
                    if state::complete_task(db, &task, TaskStatus::Failed, fx)? {
                        reaped += 1;
                    }
                }
                Ok(reaped)
            })
            .await
    }

    pub async fn reap_endless_tasks(&self, now: DateTime<Utc>) -> ActionsResult<usize> {
        let cutoff = before(now, self.settings.endless_task_timeout);
        self.scheduler
            .transact(move |db, fx| {
                let mut reaped = 0;
                for task in db.tasks_started_before(&cutoff)? {
                    info!(task_id = task.id, started = ?task.started_at, "Failing endless task");
                    if state::complete_task(db, &task, TaskStatus::Failed, fx)? {
                        reaped += 1;
                    }
                }
                Ok(reaped)
            })
            .await
    }

    pub async fn reap_abandoned_jobs(&self, now: DateTime<Utc>) -> ActionsResult<usize> {
        let cutoff = before(now, self.settings.abandoned_job_timeout);
        self.scheduler
            .transact(move |db, fx| {
                let mut reaped = 0;
                for job in db.waiting_jobs_queued_before(&cutoff)? {
                    info!(job_id = job.id, run_id = job.run_id, "Cancelling abandoned job");
                    if state::finish_job(db, job.id, JobStatus::Cancelled, None, fx)? {
                        reaped += 1;
                    }
                }
                Ok(reaped)
            })
            .await
    }

    /// Offline status is derived at read time; only ephemeral runners that
    /// went away without taking a task are deleted.
    pub async fn reap_offline_runners(&self, now: DateTime<Utc>) -> ActionsResult<usize> {
        let cutoff = before(now, self.settings.runner_offline_after);
        self.scheduler
            .transact(move |db, fx| {
                let mut removed = 0;
                for runner in db.runners_offline_since(&cutoff)? {
                    if !runner.ephemeral || runner.is_busy() {
                        debug!(runner = %runner.uuid, name = %runner.name, "Runner offline");
                        continue;
                    }
                    if db.delete_runner(runner.id)? {
                        info!(runner = %runner.uuid, name = %runner.name, "Deleted offline ephemeral runner");
                        fx.removed_runners.push(runner.uuid);
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await
    }

    pub async fn expire_logs(&self, now: DateTime<Utc>) -> ActionsResult<usize> {
        let cutoff = before(now, self.settings.log_retention);
        self.scheduler
            .transact(move |db, fx| {
                let tasks = db.tasks_with_logs_before(&cutoff)?;
                for task in &tasks {
                    db.mark_task_log_expired(task.id)?;
                    fx.removed_logs.push((task.repo_id, task.id));
                }
                if !tasks.is_empty() {
                    info!(count = tasks.len(), "Expired task logs");
                }
                Ok(tasks.len())
            })
            .await
    }
}
