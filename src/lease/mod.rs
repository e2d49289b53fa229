//! TaskLeaseProtocol: the runner-facing RPCs.
//!
//! `FetchTask` long-polls on the per-scope version channel and claims the
//! oldest matching `Waiting` job in one transaction. `UpdateTask` and
//! `UpdateLog` are authorized by the runner credential plus the task's
//! lease token; a mismatch is rejected before anything is written.

pub mod messages;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::ActionsSettings;
use crate::errors::{ActionsError, ActionsResult};
use crate::models::*;
use crate::registry;
use crate::scheduler::{Effects, JobScheduler, state};
use crate::store::ActionsDb;
use crate::token::SaltedToken;

pub use messages::*;

#[derive(Clone)]
pub struct TaskLeaseProtocol {
    scheduler: JobScheduler,
    settings: ActionsSettings,
    log_locks: LogLocks,
}

impl TaskLeaseProtocol {
    pub fn new(scheduler: JobScheduler, settings: ActionsSettings) -> Self {
        Self {
            scheduler,
            settings,
            log_locks: LogLocks::default(),
        }
    }

    pub fn ping(&self, req: PingRequest) -> PingResponse {
        PingResponse {
            data: format!("Hello, {}!", req.data),
        }
    }

    /// Long-poll for work.
    ///
    /// A claim is attempted right away. When nothing is claimable and the
    /// caller's version is current, the call parks until the runner's scope
    /// is bumped or the poll timeout passes, then tries once more.
    pub async fn fetch_task(
        &self,
        uuid: String,
        secret: String,
        req: FetchTaskRequest,
    ) -> ActionsResult<FetchTaskResponse> {
        let runner = self
            .scheduler
            .db()
            .call(move |db| registry::authenticate(db, &uuid, &secret))
            .await?;
        let scope = runner.scope();
        let mut rx = self.scheduler.notifier().subscribe(scope);

        let (task, version) = self.try_claim(runner.id, scope).await?;
        if task.is_some() || version != req.tasks_version {
            return Ok(FetchTaskResponse {
                task,
                tasks_version: version,
            });
        }

        match tokio::time::timeout(self.settings.long_poll_timeout, rx.changed()).await {
            Ok(Ok(())) => {
                let (task, version) = self.try_claim(runner.id, scope).await?;
                Ok(FetchTaskResponse {
                    task,
                    tasks_version: version,
                })
            }
            _ => Ok(FetchTaskResponse {
                task: None,
                tasks_version: version,
            }),
        }
    }

    async fn try_claim(
        &self,
        runner_id: i64,
        scope: Scope,
    ) -> ActionsResult<(Option<TaskPayload>, i64)> {
        let lease_ttl = chrono::Duration::from_std(self.settings.zombie_task_timeout)
            .context("Zombie task timeout out of range")?;
        self.scheduler
            .transact(move |db, fx| {
                let version = db.tasks_version(scope)?;
                let task = claim(db, runner_id, lease_ttl, fx)?;
                Ok((task, version))
            })
            .await
    }

    /// Report progress or the final result of a task.
    pub async fn update_task(
        &self,
        uuid: String,
        secret: String,
        req: UpdateTaskRequest,
    ) -> ActionsResult<UpdateTaskResponse> {
        let lease_ttl = chrono::Duration::from_std(self.settings.zombie_task_timeout)
            .context("Zombie task timeout out of range")?;
        self.scheduler
            .transact(move |db, fx| {
                let runner = registry::authenticate(db, &uuid, &secret)?;
                let task = verify_lease(db, &runner, req.task_id, &req.lease_token)?;

                for (key, value) in &req.outputs {
                    if !db.insert_task_output(task.id, key, value)? {
                        debug!(task_id = task.id, key = %key, "Ignoring repeated output");
                    }
                }

                if !task.status.is_terminal() {
                    db.renew_task_lease(task.id, &ts(Utc::now() + lease_ttl))?;
                    if !req.state.steps.is_empty() {
                        db.set_task_steps(task.id, &req.state.steps)?;
                    }
                    match req.state.result {
                        Some(result) if result.is_terminal() => {
                            state::complete_task(db, &task, result, fx)?;
                        }
                        _ => {
                            if task.status != TaskStatus::Running {
                                db.set_task_status(task.id, TaskStatus::Running)?;
                            }
                        }
                    }
                }

                let current = db
                    .get_task(task.id)?
                    .ok_or_else(|| ActionsError::not_found("task", task.id))?;
                Ok(UpdateTaskResponse {
                    state: TaskStateView {
                        id: current.id,
                        result: current.status,
                    },
                    sent_outputs: db.task_outputs(task.id)?.into_keys().collect(),
                })
            })
            .await
    }

    /// Append log rows at `req.index`.
    ///
    /// Rows must arrive gapless and in order. A batch that lies entirely
    /// below the acknowledged index is a retry and is re-acked without
    /// writing; a batch starting past it, or straddling it, is rejected with
    /// the index the runner should resend from.
    pub async fn update_log(
        &self,
        uuid: String,
        secret: String,
        req: UpdateLogRequest,
    ) -> ActionsResult<UpdateLogResponse> {
        let task_id = req.task_id;
        let lock = self.log_locks.get(task_id);
        let result = {
            let _guard = lock.lock().await;
            self.write_log(uuid, secret, req).await
        };
        drop(lock);
        self.log_locks.release(task_id);
        result
    }

    async fn write_log(
        &self,
        uuid: String,
        secret: String,
        req: UpdateLogRequest,
    ) -> ActionsResult<UpdateLogResponse> {
        let lease_ttl = chrono::Duration::from_std(self.settings.zombie_task_timeout)
            .context("Zombie task timeout out of range")?;
        let (task_id, lease_token) = (req.task_id, req.lease_token.clone());
        let task = self
            .scheduler
            .db()
            .call(move |db| {
                db.transaction(|db| {
                    let runner = registry::authenticate(db, &uuid, &secret)?;
                    let task = verify_lease(db, &runner, task_id, &lease_token)?;
                    db.renew_task_lease(task.id, &ts(Utc::now() + lease_ttl))?;
                    Ok::<_, ActionsError>(task)
                })
            })
            .await?;

        let expected = task.log_index;
        let count = req.rows.len() as i64;
        if req.index > expected {
            return Err(ActionsError::OrderingViolation {
                expected,
                got: req.index,
            });
        }
        let rows = if req.index < expected {
            if req.index + count > expected {
                return Err(ActionsError::OrderingViolation {
                    expected,
                    got: req.index,
                });
            }
            Vec::new()
        } else {
            req.rows
        };
        if task.log_in_storage && !rows.is_empty() {
            return Err(ActionsError::InvalidState(format!(
                "log of task {} is already finalized",
                task.id
            )));
        }

        let ack_index = expected + rows.len() as i64;
        let finalize = req.no_more && !task.log_in_storage;
        if rows.is_empty() && !finalize {
            return Ok(UpdateLogResponse { ack_index });
        }

        let logs = self.scheduler.logs().clone();
        let (repo_id, offset) = (task.repo_id, task.log_length);
        let written = rows.len();
        let (length, stored) = tokio::task::spawn_blocking(move || {
            let length = if rows.is_empty() {
                offset
            } else {
                logs.append(repo_id, task_id, offset, &rows)?
            };
            let stored = if finalize {
                Some(logs.finalize(repo_id, task_id)?)
            } else {
                None
            };
            Ok::<_, anyhow::Error>((length, stored))
        })
        .await
        .context("Log write task panicked")??;

        self.scheduler
            .db()
            .call(move |db| {
                db.set_task_log_progress(task_id, ack_index, length)?;
                if let Some(stored) = stored {
                    db.mark_task_log_in_storage(task_id, stored)?;
                }
                Ok::<_, ActionsError>(())
            })
            .await?;

        debug!(task_id, rows = written, ack_index, "Appended task log");
        if finalize {
            info!(task_id, "Finalized task log");
        }
        Ok(UpdateLogResponse { ack_index })
    }

    /// Read a task's log rows, whether or not the log is finalized.
    pub async fn read_log(&self, task_id: i64) -> ActionsResult<Vec<LogRow>> {
        let task = self.scheduler.get_task(task_id).await?;
        if task.log_expired {
            return Ok(Vec::new());
        }
        let logs = self.scheduler.logs().clone();
        let rows = tokio::task::spawn_blocking(move || logs.read(task.repo_id, task.id))
            .await
            .context("Log read task panicked")??;
        Ok(rows)
    }
}

/// Per-task mutexes serializing `UpdateLog` writes. An entry lives only
/// while some call holds or awaits it.
#[derive(Clone, Default)]
struct LogLocks(Arc<DashMap<i64, Arc<tokio::sync::Mutex<()>>>>);

impl LogLocks {
    fn get(&self, task_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.0
            .entry(task_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the mutex of `task_id` unless a writer still holds or awaits it.
    fn release(&self, task_id: i64) {
        self.0.remove_if(&task_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// The lease token must belong to the task and the task to this runner.
fn verify_lease(
    db: &ActionsDb,
    runner: &Runner,
    task_id: i64,
    lease_token: &str,
) -> ActionsResult<Task> {
    let task = db
        .get_task(task_id)?
        .ok_or_else(|| ActionsError::not_found("task", task_id))?;
    if task.runner_id != Some(runner.id) || !db.verify_task_token(task_id, lease_token)? {
        return Err(ActionsError::Unauthenticated(format!(
            "lease token mismatch for task {}",
            task_id
        )));
    }
    Ok(task)
}

/// Claim the oldest waiting job this runner may run.
///
/// The job row moves `Waiting → Running` through a conditional update, so
/// of any number of concurrent claimers exactly one sees the update apply.
/// Task insert, job link and runner binding happen in the same transaction.
pub(crate) fn claim(
    db: &ActionsDb,
    runner_id: i64,
    lease_ttl: chrono::Duration,
    fx: &mut Effects,
) -> ActionsResult<Option<TaskPayload>> {
    let runner = db
        .get_runner(runner_id)?
        .ok_or_else(|| ActionsError::not_found("runner", runner_id))?;
    if runner.is_busy() {
        return Ok(None);
    }

    for candidate in db.waiting_jobs_for_scope(runner.scope())? {
        if !candidate.labels_match(&runner.labels) {
            continue;
        }
        if !db.claim_job(candidate.id)? {
            continue;
        }
        let job = db
            .get_job(candidate.id)?
            .ok_or_else(|| ActionsError::not_found("job", candidate.id))?;

        let lease = SaltedToken::generate();
        let task_id = db.insert_task(&job, runner.id, &lease, &ts(Utc::now() + lease_ttl))?;
        db.set_job_task(job.id, task_id)?;
        if !db.bind_runner_task(runner.id, task_id)? {
            return Err(ActionsError::InvalidState(format!(
                "runner {} is already busy",
                runner.uuid
            )));
        }

        info!(
            task_id,
            job_id = job.id,
            run_id = job.run_id,
            runner = %runner.uuid,
            attempt = job.attempt,
            "Leased task"
        );
        state::snapshot_job(db, job.id, fx)?;
        state::refresh_run(db, job.run_id, fx)?;
        return Ok(Some(build_payload(db, &job, task_id, lease.token)?));
    }
    Ok(None)
}

fn build_payload(
    db: &ActionsDb,
    job: &Job,
    task_id: i64,
    lease_token: String,
) -> ActionsResult<TaskPayload> {
    let run = db
        .get_run(job.run_id)?
        .ok_or_else(|| ActionsError::not_found("run", job.run_id))?;

    let workflow_payload =
        serde_json::from_str(&job.payload).unwrap_or_else(|_| Value::String(job.payload.clone()));

    let mut context = BTreeMap::new();
    context.insert("task_id".to_string(), json!(task_id));
    context.insert("run_id".to_string(), json!(run.id));
    context.insert("run_number".to_string(), json!(run.run_number));
    context.insert("run_attempt".to_string(), json!(job.attempt));
    context.insert("job".to_string(), json!(job.base_key));
    context.insert("job_name".to_string(), json!(job.name));
    context.insert("repository_id".to_string(), json!(run.repo_id));
    context.insert("repository_owner_id".to_string(), json!(run.owner_id));
    context.insert("sha".to_string(), json!(run.commit_sha));
    context.insert("ref".to_string(), json!(run.ref_name));
    context.insert("event_name".to_string(), json!(run.event.as_str()));
    context.insert("actor".to_string(), json!(run.trigger_user));
    context.insert("workflow".to_string(), json!(run.workflow_id));
    context.insert("inputs".to_string(), json!(run.inputs));
    context.insert("matrix".to_string(), json!(job.matrix));

    let mut needs: BTreeMap<String, TaskNeed> = BTreeMap::new();
    for need_id in db.needs_of(job.id)? {
        let Some(need) = db.get_job(need_id)? else {
            continue;
        };
        let outputs = match need.task_id {
            Some(id) => db.task_outputs(id)?,
            None => BTreeMap::new(),
        };
        let satisfied = need.satisfies_needs();
        needs
            .entry(need.base_key.clone())
            .and_modify(|merged| {
                if !satisfied {
                    merged.result = need.status;
                }
                for (k, v) in &outputs {
                    merged.outputs.entry(k.clone()).or_insert_with(|| v.clone());
                }
            })
            .or_insert(TaskNeed {
                result: need.status,
                outputs,
            });
    }

    Ok(TaskPayload {
        id: task_id,
        lease_token,
        workflow_payload,
        context,
        needs,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::config::LogCompression;
    use crate::registry::RunnerRegistry;
    use crate::scheduler::{TracingSink, VersionNotifier};
    use crate::store::{DbHandle, LogStore, NewRun};
    use crate::workflow::build_graph;

    struct Fixture {
        scheduler: JobScheduler,
        registry: RunnerRegistry,
        lease: TaskLeaseProtocol,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            ActionsSettings::default().with_long_poll_timeout(Duration::from_millis(100));
        let db = DbHandle::new(ActionsDb::new_in_memory().unwrap());
        let scheduler = JobScheduler::new(
            db.clone(),
            LogStore::new(dir.path(), LogCompression::Zstd),
            VersionNotifier::new(),
            Arc::new(TracingSink),
        );
        Fixture {
            registry: RunnerRegistry::new(db, settings.clone()),
            lease: TaskLeaseProtocol::new(scheduler.clone(), settings),
            scheduler,
            _dir: dir,
        }
    }

    async fn runner(f: &Fixture, labels: &[&str], ephemeral: bool) -> (String, String) {
        let reg = f.registry.create_registration_token(Scope::global()).await.unwrap();
        let r = f
            .registry
            .register(
                reg,
                "runner".into(),
                "v1".into(),
                labels.iter().map(|s| s.to_string()).collect(),
                ephemeral,
            )
            .await
            .unwrap();
        (r.runner.uuid, r.token)
    }

    async fn create_run(f: &Fixture, yaml: &str) -> Run {
        let (_, graph) = build_graph(yaml).unwrap();
        let new = NewRun {
            repo_id: 1,
            owner_id: 1,
            workflow_id: ".gitea/workflows/ci.yml".into(),
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
        f.scheduler.create_run(new, graph).await.unwrap()
    }

    const ONE_JOB: &str = "on: push\njobs:\n  build:\n    runs-on: linux\n    steps:\n      - run: make\n";

    async fn fetch(f: &Fixture, creds: &(String, String)) -> Option<TaskPayload> {
        f.lease
            .fetch_task(creds.0.clone(), creds.1.clone(), FetchTaskRequest::default())
            .await
            .unwrap()
            .task
    }

    #[tokio::test]
    async fn test_fetch_task_builds_payload() {
        let f = fixture();
        let run = create_run(&f, ONE_JOB).await;
        let creds = runner(&f, &["linux"], false).await;

        let task = fetch(&f, &creds).await.expect("task");
        assert_eq!(task.context["run_number"], json!(run.run_number));
        assert_eq!(task.context["job"], json!("build"));
        assert_eq!(task.workflow_payload["steps"][0]["run"], json!("make"));

        let job = &f.scheduler.list_jobs(run.id).await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.task_id, Some(task.id));

        // Busy runners get nothing more.
        create_run(&f, ONE_JOB).await;
        assert!(fetch(&f, &creds).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_task_long_polls_until_work_arrives() {
        let f = fixture();
        let creds = runner(&f, &["linux"], false).await;

        let first = f
            .lease
            .fetch_task(creds.0.clone(), creds.1.clone(), FetchTaskRequest::default())
            .await
            .unwrap();
        assert!(first.task.is_none());

        let lease = f.lease.clone();
        let (uuid, secret) = creds.clone();
        let version = first.tasks_version;
        let poll = tokio::spawn(async move {
            lease
                .fetch_task(uuid, secret, FetchTaskRequest { tasks_version: version })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        create_run(&f, ONE_JOB).await;

        let resp = poll.await.unwrap().unwrap();
        assert!(resp.task.is_some());
        assert!(resp.tasks_version > version);
    }

    #[tokio::test]
    async fn test_update_task_rejects_wrong_lease() {
        let f = fixture();
        create_run(&f, ONE_JOB).await;
        let creds = runner(&f, &["linux"], false).await;
        let task = fetch(&f, &creds).await.unwrap();

        let err = f
            .lease
            .update_task(
                creds.0.clone(),
                creds.1.clone(),
                UpdateTaskRequest {
                    task_id: task.id,
                    lease_token: "stale".into(),
                    state: TaskStateReport {
                        result: Some(TaskStatus::Succeeded),
                        steps: vec![],
                    },
                    outputs: BTreeMap::from([("k".to_string(), "v".to_string())]),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionsError::Unauthenticated(_)));

        let stored = f.scheduler.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_update_task_outputs_and_completion() {
        let f = fixture();
        let run = create_run(&f, ONE_JOB).await;
        let creds = runner(&f, &["linux"], false).await;
        let task = fetch(&f, &creds).await.unwrap();

        let update = |result: Option<TaskStatus>, outputs: &[(&str, &str)]| UpdateTaskRequest {
            task_id: task.id,
            lease_token: task.lease_token.clone(),
            state: TaskStateReport { result, steps: vec![] },
            outputs: outputs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        };

        let resp = f
            .lease
            .update_task(creds.0.clone(), creds.1.clone(), update(None, &[("a", "1")]))
            .await
            .unwrap();
        assert_eq!(resp.state.result, TaskStatus::Running);
        assert_eq!(resp.sent_outputs, vec!["a"]);

        let resp = f
            .lease
            .update_task(
                creds.0.clone(),
                creds.1.clone(),
                update(Some(TaskStatus::Succeeded), &[("a", "2"), ("b", "3")]),
            )
            .await
            .unwrap();
        assert_eq!(resp.state.result, TaskStatus::Succeeded);
        assert_eq!(resp.sent_outputs, vec!["a", "b"]);

        // A repeated final report changes nothing.
        let resp = f
            .lease
            .update_task(creds.0.clone(), creds.1.clone(), update(Some(TaskStatus::Failed), &[]))
            .await
            .unwrap();
        assert_eq!(resp.state.result, TaskStatus::Succeeded);

        let run = f.scheduler.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_update_log_ordering() {
        let f = fixture();
        create_run(&f, ONE_JOB).await;
        let creds = runner(&f, &["linux"], false).await;
        let task = fetch(&f, &creds).await.unwrap();

        let rows = |lines: &[&str]| -> Vec<LogRow> {
            lines
                .iter()
                .map(|l| LogRow {
                    time: Utc::now(),
                    content: l.to_string(),
                })
                .collect()
        };
        let send = |index: i64, lines: Vec<LogRow>, no_more: bool| {
            f.lease.update_log(
                creds.0.clone(),
                creds.1.clone(),
                UpdateLogRequest {
                    task_id: task.id,
                    lease_token: task.lease_token.clone(),
                    index,
                    rows: lines,
                    no_more,
                },
            )
        };

        assert_eq!(send(0, rows(&["a", "b"]), false).await.unwrap().ack_index, 2);
        match send(5, rows(&["x"]), false).await.unwrap_err() {
            ActionsError::OrderingViolation { expected, got } => {
                assert_eq!(expected, 2);
                assert_eq!(got, 5);
            }
            other => panic!("Expected OrderingViolation, got {:?}", other),
        }
        // Retry of the first batch is re-acked without duplicating rows.
        assert_eq!(send(0, rows(&["a", "b"]), false).await.unwrap().ack_index, 2);
        assert!(matches!(
            send(1, rows(&["b", "c"]), false).await.unwrap_err(),
            ActionsError::OrderingViolation { expected: 2, .. }
        ));
        assert_eq!(send(2, rows(&["c"]), true).await.unwrap().ack_index, 3);

        let read: Vec<String> = f
            .lease
            .read_log(task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(read, vec!["a", "b", "c"]);

        let stored = f.scheduler.get_task(task.id).await.unwrap();
        assert!(stored.log_in_storage);
        assert!(matches!(
            send(3, rows(&["late"]), false).await.unwrap_err(),
            ActionsError::InvalidState(_)
        ));
    }

    #[test]
    fn test_log_lock_release_keeps_held_locks() {
        let locks = LogLocks::default();
        let held = locks.get(1);
        locks.get(2);

        locks.release(1);
        locks.release(2);
        assert_eq!(locks.len(), 1);

        drop(held);
        locks.release(1);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_log_locks_do_not_outlive_calls() {
        let f = fixture();
        let run = create_run(&f, ONE_JOB).await;
        let creds = runner(&f, &["linux"], false).await;
        let task = fetch(&f, &creds).await.unwrap();

        let send = |index: i64, content: &str| {
            f.lease.update_log(
                creds.0.clone(),
                creds.1.clone(),
                UpdateLogRequest {
                    task_id: task.id,
                    lease_token: task.lease_token.clone(),
                    index,
                    rows: vec![LogRow {
                        time: Utc::now(),
                        content: content.to_string(),
                    }],
                    no_more: false,
                },
            )
        };
        assert_eq!(send(0, "a").await.unwrap().ack_index, 1);
        assert_eq!(f.lease.log_locks.len(), 0);
        assert!(send(7, "gap").await.is_err());
        assert_eq!(f.lease.log_locks.len(), 0);

        // Cancelled before the runner ever closes its log.
        f.scheduler.cancel_run(run.id).await.unwrap();
        assert_eq!(send(1, "b").await.unwrap().ack_index, 2);
        assert_eq!(f.lease.log_locks.len(), 0);
    }
}
