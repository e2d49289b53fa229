//! ScheduleTicker: fires `on.schedule` workflows.
//!
//! Schedules are bound to a commit of the default branch. On every tick
//! the due specs are grouped per repository; if the default branch moved
//! since the schedules were written they are re-derived from the new head
//! before firing.

pub mod cron;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{CommitInfo, EventDispatcher};
use crate::errors::{ActionsError, ActionsResult};
use crate::models::*;
use crate::scheduler::{Effects, state};
use crate::store::{ActionsDb, NewSchedule};
use crate::workflow::WorkflowDoc;

pub use cron::CronSpec;

/// Where a set of schedules is bound.
pub(crate) struct ScheduleBinding<'a> {
    pub repo_id: i64,
    pub owner_id: i64,
    pub ref_name: &'a str,
    pub commit_sha: &'a str,
    pub trigger_user: &'a str,
}

/// Replace every schedule of a repository with the ones declared by
/// `docs`. Scheduled runs still in flight on the old binding are
/// cancelled. Invalid cron specs are logged and skipped.
pub(crate) fn register_schedules(
    db: &ActionsDb,
    binding: &ScheduleBinding<'_>,
    docs: &[(String, WorkflowDoc)],
    now: DateTime<Utc>,
    fx: &mut Effects,
) -> Result<usize> {
    db.delete_schedules_for_repo(binding.repo_id)?;
    for run in
        db.active_runs_for_event(binding.repo_id, binding.ref_name, &TriggerEvent::Schedule)?
    {
        state::cancel_run(db, run.id, fx)?;
    }

    let mut registered = 0;
    for (path, doc) in docs {
        let mut specs = Vec::new();
        for raw in &doc.triggers.schedules {
            match raw.parse::<CronSpec>() {
                Ok(spec) => match spec.next_after(now) {
                    Some(next) => specs.push((raw.clone(), ts(next))),
                    None => warn!(workflow = %path, spec = %raw, "Cron spec never fires"),
                },
                Err(e) => warn!(workflow = %path, spec = %raw, error = %e, "Skipping invalid cron spec"),
            }
        }
        if specs.is_empty() {
            continue;
        }
        db.replace_schedule(
            &NewSchedule {
                repo_id: binding.repo_id,
                owner_id: binding.owner_id,
                workflow_id: path.clone(),
                title: doc.name.clone().unwrap_or_else(|| path.clone()),
                ref_name: binding.ref_name.to_string(),
                commit_sha: binding.commit_sha.to_string(),
                trigger_user: binding.trigger_user.to_string(),
            },
            &specs,
        )?;
        registered += 1;
    }
    info!(
        repo_id = binding.repo_id,
        commit = %binding.commit_sha,
        schedules = registered,
        "Registered schedules"
    );
    Ok(registered)
}

#[derive(Clone)]
pub struct ScheduleTicker {
    dispatcher: EventDispatcher,
}

impl ScheduleTicker {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Tick until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = self.dispatcher.settings().schedule_tick;
        info!(tick_ms = period.as_millis() as u64, "Schedule ticker started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Schedule ticker shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Schedule tick failed");
                    }
                }
            }
        }
    }

    pub async fn list_schedules(&self, repo_id: i64) -> ActionsResult<Vec<Schedule>> {
        self.dispatcher
            .scheduler()
            .db()
            .call(move |db| Ok::<_, ActionsError>(db.list_schedules_for_repo(repo_id)?))
            .await
    }

    /// Fire every spec due at `now`. Returns the number of runs created.
    pub async fn tick(&self, now: DateTime<Utc>) -> ActionsResult<usize> {
        let cutoff = ts(now);
        let due = self
            .dispatcher
            .scheduler()
            .db()
            .call(move |db| db.due_schedule_specs(&cutoff))
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Found due schedule specs");

        let mut by_repo: BTreeMap<i64, BTreeMap<i64, Vec<ScheduleSpec>>> = BTreeMap::new();
        for spec in due {
            by_repo
                .entry(spec.repo_id)
                .or_default()
                .entry(spec.schedule_id)
                .or_default()
                .push(spec);
        }

        let mut fired = 0;
        for (repo_id, schedules) in by_repo {
            match self.fire_repo(repo_id, schedules, now).await {
                Ok(n) => fired += n,
                Err(e) => error!(repo_id, error = %e, "Failed to fire schedules"),
            }
        }
        Ok(fired)
    }

    async fn fire_repo(
        &self,
        repo_id: i64,
        due: BTreeMap<i64, Vec<ScheduleSpec>>,
        now: DateTime<Utc>,
    ) -> ActionsResult<usize> {
        let ids: Vec<i64> = due.keys().copied().collect();
        let loaded = self
            .dispatcher
            .scheduler()
            .db()
            .call(move |db| {
                let mut loaded = Vec::new();
                for id in ids {
                    if let Some(schedule) = db.get_schedule(id)? {
                        loaded.push(schedule);
                    }
                }
                Ok::<_, anyhow::Error>(loaded)
            })
            .await?;
        let Some(first) = loaded.first() else {
            return Ok(0);
        };

        if let Some(head) = self.dispatcher.git().default_branch(repo_id).await? {
            if head.sha != first.commit_sha {
                let workflows: BTreeSet<String> =
                    loaded.iter().map(|s| s.workflow_id.clone()).collect();
                if let Some(fired) = self
                    .rebind_and_fire(first, &head.ref_name, &head.sha, workflows, now)
                    .await?
                {
                    return Ok(fired);
                }
            }
        }

        let mut fired = 0;
        for schedule in &loaded {
            match self.dispatcher.dispatch_schedule(schedule).await {
                Ok(Some(_)) => fired += 1,
                Ok(None) => {}
                Err(e) => warn!(
                    schedule_id = schedule.id,
                    workflow = %schedule.workflow_id,
                    error = %e,
                    "Failed to fire schedule"
                ),
            }
            // Advance regardless so a broken workflow does not fire every tick.
            let specs = due.get(&schedule.id).cloned().unwrap_or_default();
            self.advance(specs, now).await?;
        }
        Ok(fired)
    }

    /// The default branch moved: re-read its workflows, replace the repo's
    /// schedules and fire the ones that were due and still exist. `None`
    /// when the new head is unknown and the old binding should fire.
    async fn rebind_and_fire(
        &self,
        previous: &Schedule,
        ref_name: &str,
        sha: &str,
        due_workflows: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> ActionsResult<Option<usize>> {
        let repo_id = previous.repo_id;
        let Some(commit) = self.dispatcher.git().commit(repo_id, sha).await? else {
            warn!(repo_id, commit = %sha, "Default branch head is unknown; keeping schedules");
            return Ok(None);
        };
        info!(
            repo_id,
            from = %previous.commit_sha,
            to = %commit.sha,
            "Default branch moved; re-deriving schedules"
        );
        self.sync(previous, ref_name, &commit, now).await?;

        let fresh = self
            .dispatcher
            .scheduler()
            .db()
            .call(move |db| db.list_schedules_for_repo(repo_id))
            .await?;
        let mut fired = 0;
        for schedule in fresh.iter().filter(|s| due_workflows.contains(&s.workflow_id)) {
            match self.dispatcher.dispatch_schedule(schedule).await {
                Ok(Some(_)) => fired += 1,
                Ok(None) => {}
                Err(e) => warn!(schedule_id = schedule.id, error = %e, "Failed to fire schedule"),
            }
        }
        Ok(Some(fired))
    }

    async fn sync(
        &self,
        previous: &Schedule,
        ref_name: &str,
        commit: &CommitInfo,
        now: DateTime<Utc>,
    ) -> ActionsResult<()> {
        let docs = self.dispatcher.parse_workflows(commit).ok;
        let (repo_id, owner_id) = (previous.repo_id, previous.owner_id);
        let (ref_name, sha, actor) = (
            ref_name.to_string(),
            commit.sha.clone(),
            previous.trigger_user.clone(),
        );
        self.dispatcher
            .scheduler()
            .transact(move |db, fx| {
                let binding = ScheduleBinding {
                    repo_id,
                    owner_id,
                    ref_name: &ref_name,
                    commit_sha: &sha,
                    trigger_user: &actor,
                };
                register_schedules(db, &binding, &docs, now, fx)?;
                Ok(())
            })
            .await
    }

    async fn advance(&self, specs: Vec<ScheduleSpec>, now: DateTime<Utc>) -> ActionsResult<()> {
        self.dispatcher
            .scheduler()
            .db()
            .call(move |db| {
                for spec in specs {
                    let next = spec
                        .spec
                        .parse::<CronSpec>()
                        .ok()
                        .and_then(|s| s.next_after(now));
                    match next {
                        Some(next) => {
                            db.advance_schedule_spec(spec.id, &spec.next_fire, &ts(next))?;
                        }
                        None => {
                            warn!(spec_id = spec.id, spec = %spec.spec, "Dropping unusable cron spec");
                            db.delete_schedule_spec(spec.id)?;
                        }
                    }
                }
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::config::{ActionsSettings, LogCompression};
    use crate::dispatch::{RepoEvent, SnapshotGitSource};
    use crate::scheduler::{JobScheduler, TracingSink, VersionNotifier};
    use crate::store::{DbHandle, LogStore};

    const HOURLY: &str = "on:\n  schedule:\n    - cron: '@every 1h'\njobs:\n  sweep:\n    runs-on: linux\n";
    const DAILY: &str = "name: Daily\non:\n  schedule:\n    - cron: '@daily'\njobs:\n  sweep:\n    runs-on: linux\n";
    const PATH: &str = ".gitea/workflows/cron.yml";

    fn setup() -> (ScheduleTicker, Arc<SnapshotGitSource>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = JobScheduler::new(
            DbHandle::new(ActionsDb::new_in_memory().unwrap()),
            LogStore::new(dir.path(), LogCompression::None),
            VersionNotifier::new(),
            Arc::new(TracingSink),
        );
        let git = Arc::new(SnapshotGitSource::new());
        let dispatcher = EventDispatcher::new(scheduler, git.clone(), ActionsSettings::default());
        (ScheduleTicker::new(dispatcher), git, dir)
    }

    async fn push_default(
        ticker: &ScheduleTicker,
        git: &SnapshotGitSource,
        sha: &str,
        content: &str,
    ) {
        let commit = CommitInfo {
            sha: sha.to_string(),
            message: "update".to_string(),
            changed_files: None,
            workflows: BTreeMap::from([(PATH.to_string(), content.to_string())]),
        };
        git.record_commit(1, Some("refs/heads/main"), commit).await;
        git.set_default_branch(1, "refs/heads/main").await;
        ticker
            .dispatcher
            .dispatch(RepoEvent {
                repo_id: 1,
                owner_id: 5,
                event: TriggerEvent::Push,
                action: None,
                ref_name: "refs/heads/main".to_string(),
                commit_sha: sha.to_string(),
                actor: "alice".to_string(),
                is_fork_pull_request: false,
                inputs: BTreeMap::new(),
            })
            .await
            .unwrap();
    }

    async fn schedules(ticker: &ScheduleTicker) -> Vec<Schedule> {
        ticker
            .dispatcher
            .scheduler()
            .db()
            .call(|db| db.list_schedules_for_repo(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_fires_due_schedule_once() {
        let (ticker, git, _dir) = setup();
        push_default(&ticker, &git, "a1", HOURLY).await;

        assert_eq!(ticker.tick(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + Duration::minutes(61);
        assert_eq!(ticker.tick(later).await.unwrap(), 1);
        assert_eq!(ticker.tick(later).await.unwrap(), 0);

        let runs = ticker.dispatcher.scheduler().list_runs(1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].event, TriggerEvent::Schedule);
        assert_eq!(runs[0].commit_sha, "a1");
        assert_eq!(runs[0].trigger_user, "alice");

        let spec = &schedules(&ticker).await[0].specs[0];
        assert!(spec.prev_fire.is_some());
        assert!(parse_ts(&spec.next_fire).unwrap() > later);
    }

    #[tokio::test]
    async fn test_tick_rebinds_when_default_branch_moves() {
        let (ticker, git, _dir) = setup();
        push_default(&ticker, &git, "a1", HOURLY).await;

        // The branch moves without a push event reaching the dispatcher.
        let moved = CommitInfo {
            sha: "b2".to_string(),
            message: "switch to daily".to_string(),
            changed_files: None,
            workflows: BTreeMap::from([(PATH.to_string(), DAILY.to_string())]),
        };
        git.record_commit(1, Some("refs/heads/main"), moved).await;

        let later = Utc::now() + Duration::minutes(61);
        assert_eq!(ticker.tick(later).await.unwrap(), 1);

        let current = schedules(&ticker).await;
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].commit_sha, "b2");
        assert_eq!(current[0].title, "Daily");
        assert_eq!(current[0].specs[0].spec, "@daily");

        let runs = ticker.dispatcher.scheduler().list_runs(1).await.unwrap();
        assert_eq!(runs[0].commit_sha, "b2");
    }

    #[tokio::test]
    async fn test_invalid_specs_are_skipped() {
        let (ticker, git, _dir) = setup();
        let broken = "on:\n  schedule:\n    - cron: 'every tuesday'\njobs:\n  a:\n    runs-on: x\n";
        push_default(&ticker, &git, "a1", broken).await;
        assert!(schedules(&ticker).await.is_empty());
    }
}
