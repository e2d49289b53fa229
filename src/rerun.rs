//! RerunController: put finished jobs back into the state machine.

use std::collections::{BTreeSet, VecDeque};

use tracing::info;

use crate::errors::{ActionsError, ActionsResult};
use crate::models::*;
use crate::scheduler::{Effects, JobScheduler, state};
use crate::store::ActionsDb;

#[derive(Clone)]
pub struct RerunController {
    scheduler: JobScheduler,
}

impl RerunController {
    pub fn new(scheduler: JobScheduler) -> Self {
        Self { scheduler }
    }

    /// Rerun one job and everything downstream of it.
    ///
    /// The target goes straight to `Waiting`. Every job reachable through
    /// the reverse edges is reset to `Blocked` with its counters recomputed
    /// from the needs that were not reset.
    pub async fn rerun_job(&self, job_id: i64) -> ActionsResult<Vec<Job>> {
        self.scheduler
            .transact(move |db, fx| {
                let job = db
                    .get_job(job_id)?
                    .ok_or_else(|| ActionsError::not_found("job", job_id))?;
                let run = finished_run(db, job.run_id)?;

                let mut reset = BTreeSet::from([job.id]);
                let mut queue = VecDeque::from([job.id]);
                while let Some(id) = queue.pop_front() {
                    for dependent in db.dependents_of(id)? {
                        if reset.insert(dependent) {
                            queue.push_back(dependent);
                        }
                    }
                }

                for &id in &reset {
                    if id == job.id {
                        continue;
                    }
                    let (mut pending, mut failed) = (0, 0);
                    for need_id in db.needs_of(id)? {
                        if reset.contains(&need_id) {
                            pending += 1;
                        } else if !db.get_job(need_id)?.is_some_and(|n| n.satisfies_needs()) {
                            failed += 1;
                        }
                    }
                    db.reset_job(id, JobStatus::Blocked, pending, failed)?;
                }
                db.reset_job(job.id, JobStatus::Blocked, 0, 0)?;
                state::enqueue(db, &job, fx)?;

                restart_run(db, &run, fx)?;
                info!(job_id, run_id = run.id, reset = reset.len(), "Rerunning job");
                collect_jobs(db, &reset)
            })
            .await
    }

    /// Rerun every job of a finished run from the roots.
    pub async fn rerun_run(&self, run_id: i64) -> ActionsResult<Run> {
        self.scheduler
            .transact(move |db, fx| {
                let run = finished_run(db, run_id)?;
                let jobs = db.list_jobs(run_id)?;
                for job in &jobs {
                    db.reset_job(job.id, JobStatus::Blocked, job.needs.len() as i64, 0)?;
                }
                state::enqueue_roots(db, run_id, fx)?;
                restart_run(db, &run, fx)?;
                info!(run_id, jobs = jobs.len(), "Rerunning run");
                Ok(db
                    .get_run(run_id)?
                    .ok_or_else(|| ActionsError::not_found("run", run_id))?)
            })
            .await
    }
}

/// Reruns are only allowed once every job of the run has finished, so no
/// task of the run can still be executing.
fn finished_run(db: &ActionsDb, run_id: i64) -> ActionsResult<Run> {
    let run = db
        .get_run(run_id)?
        .ok_or_else(|| ActionsError::not_found("run", run_id))?;
    if !run.status.is_terminal() {
        return Err(ActionsError::InvalidState(format!(
            "run {} is still running",
            run_id
        )));
    }
    if run.needs_approval {
        return Err(ActionsError::InvalidState(format!(
            "run {} is waiting for approval",
            run_id
        )));
    }
    Ok(run)
}

fn restart_run(db: &ActionsDb, run: &Run, fx: &mut Effects) -> ActionsResult<()> {
    db.bump_run_attempt(run.id)?;
    state::refresh_run(db, run.id, fx)?;
    Ok(())
}

fn collect_jobs(db: &ActionsDb, ids: &BTreeSet<i64>) -> ActionsResult<Vec<Job>> {
    let mut jobs = Vec::with_capacity(ids.len());
    for &id in ids {
        if let Some(job) = db.get_job(id)? {
            jobs.push(job);
        }
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::config::LogCompression;
    use crate::scheduler::{TracingSink, VersionNotifier};
    use crate::store::{DbHandle, LogStore, NewRun};
    use crate::workflow::build_graph;

    fn setup() -> (JobScheduler, RerunController, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = JobScheduler::new(
            DbHandle::new(ActionsDb::new_in_memory().unwrap()),
            LogStore::new(dir.path(), LogCompression::None),
            VersionNotifier::new(),
            Arc::new(TracingSink),
        );
        let rerun = RerunController::new(scheduler.clone());
        (scheduler, rerun, dir)
    }

    const CHAIN: &str = r#"
on: push
jobs:
  build:
    runs-on: x
  test:
    needs: build
    runs-on: x
  lint:
    runs-on: x
  deploy:
    needs: [test, lint]
    runs-on: x
"#;

    async fn finished(scheduler: &JobScheduler) -> (Run, BTreeMap<String, i64>) {
        let (_, graph) = build_graph(CHAIN).unwrap();
        let new = NewRun {
            repo_id: 1,
            owner_id: 1,
            workflow_id: "ci.yml".into(),
            title: "ci".into(),
            event: TriggerEvent::Push,
            commit_sha: "abc".into(),
            ref_name: "refs/heads/main".into(),
            trigger_user: "alice".into(),
            concurrency_group: None,
            needs_approval: false,
            is_fork_pull_request: false,
            inputs: BTreeMap::new(),
        };
        let run = scheduler.create_run(new, graph).await.unwrap();
        let ids: BTreeMap<String, i64> = scheduler
            .list_jobs(run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|j| (j.job_key, j.id))
            .collect();
        for key in ["build", "lint", "test", "deploy"] {
            let id = ids[key];
            scheduler
                .transact(move |db, fx| {
                    Ok(state::finish_job(db, id, JobStatus::Succeeded, None, fx)?)
                })
                .await
                .unwrap();
        }
        let run = scheduler.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        (run, ids)
    }

    #[tokio::test]
    async fn test_rerun_job_cascades_downstream() {
        let (scheduler, rerun, _dir) = setup();
        let (run, ids) = finished(&scheduler).await;

        let reset = rerun.rerun_job(ids["test"]).await.unwrap();
        assert_eq!(reset.len(), 2);

        let job = |key: &str| {
            let id = ids[key];
            let scheduler = scheduler.clone();
            async move { scheduler.get_job(id).await.unwrap() }
        };
        assert_eq!(job("test").await.status, JobStatus::Waiting);
        let deploy = job("deploy").await;
        assert_eq!(deploy.status, JobStatus::Blocked);
        assert_eq!(deploy.pending_needs, 1);
        assert_eq!(deploy.failed_needs, 0);
        assert_eq!(job("build").await.status, JobStatus::Succeeded);
        assert_eq!(job("lint").await.status, JobStatus::Succeeded);

        let run = scheduler.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.attempt, 2);
        assert!(run.stopped_at.is_none());
    }

    #[tokio::test]
    async fn test_rerun_requires_finished_run() {
        let (scheduler, rerun, _dir) = setup();
        let (run, ids) = finished(&scheduler).await;
        rerun.rerun_job(ids["build"]).await.unwrap();

        let err = rerun.rerun_job(ids["lint"]).await.unwrap_err();
        assert!(matches!(err, ActionsError::InvalidState(_)));
        let err = rerun.rerun_run(run.id).await.unwrap_err();
        assert!(matches!(err, ActionsError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_rerun_run_resets_every_job() {
        let (scheduler, rerun, _dir) = setup();
        let (run, _) = finished(&scheduler).await;

        rerun.rerun_run(run.id).await.unwrap();
        let jobs = scheduler.list_jobs(run.id).await.unwrap();
        let waiting: Vec<&str> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Waiting)
            .map(|j| j.job_key.as_str())
            .collect();
        assert_eq!(waiting, vec!["build", "lint"]);
        assert!(jobs
            .iter()
            .filter(|j| !j.needs.is_empty())
            .all(|j| j.status == JobStatus::Blocked && j.task_id.is_none()));
    }
}
