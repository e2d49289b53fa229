//! EventDispatcher: turn repository events into runs.
//!
//! For each workflow file at the event's commit whose `on:` section matches,
//! the job graph is built and the run is persisted with all its jobs in one
//! transaction, together with the cancellations it implies (older pushes to
//! the same ref, `cancel-in-progress` concurrency groups). A workflow whose
//! graph cannot be built is rejected on its own; the others still run.

pub mod git;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{info, warn};

use crate::config::ActionsSettings;
use crate::errors::{ActionsError, ActionsResult, GraphError};
use crate::models::*;
use crate::scheduler::{Effects, JobScheduler, state};
use crate::store::{ActionsDb, NewRun};
use crate::ticker::{ScheduleBinding, register_schedules};
use crate::workflow::trigger::DispatchInput;
use crate::workflow::{EventContext, JobGraph, WorkflowDoc, WorkflowGraphBuilder};

pub use git::{BranchHead, CommitInfo, GitSource, SnapshotGitSource};

/// A repository event as reported by the forge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoEvent {
    pub repo_id: i64,
    pub owner_id: i64,
    pub event: TriggerEvent,
    /// Activity type, e.g. `opened` for pull requests.
    #[serde(default)]
    pub action: Option<String>,
    pub ref_name: String,
    pub commit_sha: String,
    pub actor: String,
    #[serde(default)]
    pub is_fork_pull_request: bool,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedWorkflow {
    pub workflow_id: String,
    #[serde(serialize_with = "display")]
    pub error: GraphError,
}

fn display<S: Serializer>(error: &GraphError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

#[derive(Debug, Default, Serialize)]
pub struct DispatchOutcome {
    pub created: Vec<Run>,
    pub rejected: Vec<RejectedWorkflow>,
    /// The head commit asked for CI to be skipped.
    pub skipped_ci: bool,
}

/// Workflow files of a commit after YAML decoding.
#[derive(Debug, Default)]
pub struct ParsedWorkflows {
    pub ok: Vec<(String, WorkflowDoc)>,
    pub rejected: Vec<RejectedWorkflow>,
}

struct Candidate {
    new_run: NewRun,
    graph: JobGraph,
    cancel_in_progress: bool,
    cancel_previous: bool,
}

#[derive(Clone)]
pub struct EventDispatcher {
    scheduler: JobScheduler,
    git: Arc<dyn GitSource>,
    settings: ActionsSettings,
}

impl EventDispatcher {
    pub fn new(
        scheduler: JobScheduler,
        git: Arc<dyn GitSource>,
        settings: ActionsSettings,
    ) -> Self {
        Self {
            scheduler,
            git,
            settings,
        }
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn git(&self) -> &Arc<dyn GitSource> {
        &self.git
    }

    pub fn settings(&self) -> &ActionsSettings {
        &self.settings
    }

    pub fn parse_workflows(&self, commit: &CommitInfo) -> ParsedWorkflows {
        let mut parsed = ParsedWorkflows::default();
        for (path, content) in commit.workflow_files() {
            match WorkflowDoc::parse(content) {
                Ok(doc) => parsed.ok.push((path.to_string(), doc)),
                Err(error) => {
                    warn!(workflow = %path, commit = %commit.sha, error = %error, "Ignoring unreadable workflow");
                    parsed.rejected.push(RejectedWorkflow {
                        workflow_id: path.to_string(),
                        error,
                    });
                }
            }
        }
        parsed
    }

    fn skips_ci(&self, message: &str) -> bool {
        self.settings
            .skip_workflow_strings
            .iter()
            .any(|s| message.contains(s.as_str()))
    }

    /// Create a run for every workflow at the event's commit that matches it.
    /// A push to the default branch also re-registers the repo's schedules.
    pub async fn dispatch(&self, event: RepoEvent) -> ActionsResult<DispatchOutcome> {
        let commit = self
            .git
            .commit(event.repo_id, &event.commit_sha)
            .await?
            .ok_or_else(|| ActionsError::not_found("commit", &event.commit_sha))?;
        let parsed = self.parse_workflows(&commit);

        let sync_schedules = if event.event == TriggerEvent::Push {
            self.git
                .default_branch(event.repo_id)
                .await?
                .is_some_and(|head| head.ref_name == event.ref_name)
        } else {
            false
        };

        let mut outcome = DispatchOutcome {
            rejected: parsed.rejected,
            ..Default::default()
        };
        let code_event = matches!(
            event.event,
            TriggerEvent::Push | TriggerEvent::PullRequest | TriggerEvent::PullRequestTarget
        );
        outcome.skipped_ci = code_event && self.skips_ci(&commit.message);

        let mut candidates = Vec::new();
        if outcome.skipped_ci {
            info!(repo_id = event.repo_id, commit = %commit.sha, "Commit message skips CI");
        } else {
            let ctx = EventContext {
                event: &event.event,
                ref_name: &event.ref_name,
                action: event.action.as_deref(),
                changed_files: commit.changed_files.as_deref(),
            };
            let title = commit.message.lines().next().unwrap_or_default().to_string();
            for (path, doc) in &parsed.ok {
                if !doc.triggers.matches(&ctx) {
                    continue;
                }
                match WorkflowGraphBuilder::new(doc).build() {
                    Ok(graph) => candidates.push(candidate(&event, &title, path, doc, graph)),
                    Err(error) => {
                        warn!(workflow = %path, error = %error, "Rejected workflow");
                        outcome.rejected.push(RejectedWorkflow {
                            workflow_id: path.clone(),
                            error,
                        });
                    }
                }
            }
        }

        if candidates.is_empty() && !sync_schedules {
            return Ok(outcome);
        }

        let docs = if sync_schedules { parsed.ok } else { Vec::new() };
        outcome.created = self
            .scheduler
            .transact(move |db, fx| {
                let runs = create_runs(db, candidates, fx)?;
                if sync_schedules {
                    let binding = ScheduleBinding {
                        repo_id: event.repo_id,
                        owner_id: event.owner_id,
                        ref_name: &event.ref_name,
                        commit_sha: &event.commit_sha,
                        trigger_user: &event.actor,
                    };
                    register_schedules(db, &binding, &docs, Utc::now(), fx)?;
                }
                Ok(runs)
            })
            .await?;
        Ok(outcome)
    }

    /// Manually dispatch one workflow at `ref_name` with `inputs`.
    pub async fn dispatch_workflow(
        &self,
        repo_id: i64,
        owner_id: i64,
        workflow_id: &str,
        ref_name: &str,
        actor: &str,
        inputs: BTreeMap<String, String>,
    ) -> ActionsResult<Run> {
        let sha = self
            .git
            .resolve_ref(repo_id, ref_name)
            .await?
            .ok_or_else(|| ActionsError::not_found("ref", ref_name))?;
        let commit = self
            .git
            .commit(repo_id, &sha)
            .await?
            .ok_or_else(|| ActionsError::not_found("commit", &sha))?;
        let content = commit
            .workflows
            .get(workflow_id)
            .ok_or_else(|| ActionsError::not_found("workflow", workflow_id))?;

        let doc = WorkflowDoc::parse(content)?;
        if !doc.triggers.has_event(&TriggerEvent::WorkflowDispatch) {
            return Err(ActionsError::BadRequest(format!(
                "workflow {} does not accept workflow_dispatch",
                workflow_id
            )));
        }
        let inputs = resolve_inputs(&doc.triggers.dispatch_inputs, inputs)?;
        let graph = WorkflowGraphBuilder::new(&doc).build()?;

        let full_ref = if ref_name.starts_with("refs/") {
            ref_name.to_string()
        } else {
            format!("refs/heads/{}", ref_name)
        };
        let event = RepoEvent {
            repo_id,
            owner_id,
            event: TriggerEvent::WorkflowDispatch,
            action: None,
            ref_name: full_ref,
            commit_sha: sha,
            actor: actor.to_string(),
            is_fork_pull_request: false,
            inputs,
        };
        let title = doc.name.clone().unwrap_or_else(|| workflow_id.to_string());
        let c = candidate(&event, &title, workflow_id, &doc, graph);
        self.create_one(c).await
    }

    /// Fire a schedule at its bound commit. `None` when the commit or the
    /// workflow file is gone.
    pub async fn dispatch_schedule(&self, schedule: &Schedule) -> ActionsResult<Option<Run>> {
        let Some(commit) = self.git.commit(schedule.repo_id, &schedule.commit_sha).await? else {
            warn!(schedule_id = schedule.id, commit = %schedule.commit_sha, "Scheduled commit is unknown");
            return Ok(None);
        };
        let Some(content) = commit.workflows.get(&schedule.workflow_id) else {
            warn!(schedule_id = schedule.id, workflow = %schedule.workflow_id, "Scheduled workflow is gone");
            return Ok(None);
        };
        let doc = WorkflowDoc::parse(content)?;
        let graph = WorkflowGraphBuilder::new(&doc).build()?;
        let event = RepoEvent {
            repo_id: schedule.repo_id,
            owner_id: schedule.owner_id,
            event: TriggerEvent::Schedule,
            action: None,
            ref_name: schedule.ref_name.clone(),
            commit_sha: schedule.commit_sha.clone(),
            actor: schedule.trigger_user.clone(),
            is_fork_pull_request: false,
            inputs: BTreeMap::new(),
        };
        let c = candidate(&event, &schedule.title, &schedule.workflow_id, &doc, graph);
        let run = self.create_one(c).await?;
        info!(schedule_id = schedule.id, run_id = run.id, "Fired schedule");
        Ok(Some(run))
    }

    async fn create_one(&self, c: Candidate) -> ActionsResult<Run> {
        let mut runs = self
            .scheduler
            .transact(move |db, fx| Ok(create_runs(db, vec![c], fx)?))
            .await?;
        runs.pop()
            .ok_or_else(|| ActionsError::InvalidState("run was not created".to_string()))
    }
}

fn candidate(
    event: &RepoEvent,
    title: &str,
    path: &str,
    doc: &WorkflowDoc,
    graph: JobGraph,
) -> Candidate {
    let concurrency = doc.concurrency.as_ref();
    Candidate {
        new_run: NewRun {
            repo_id: event.repo_id,
            owner_id: event.owner_id,
            workflow_id: path.to_string(),
            title: title.to_string(),
            event: event.event.clone(),
            commit_sha: event.commit_sha.clone(),
            ref_name: event.ref_name.clone(),
            trigger_user: event.actor.clone(),
            concurrency_group: concurrency.map(|c| expand_group(&c.group, event, path)),
            needs_approval: event.is_fork_pull_request && event.event == TriggerEvent::PullRequest,
            is_fork_pull_request: event.is_fork_pull_request,
            inputs: event.inputs.clone(),
        },
        graph,
        cancel_in_progress: concurrency.is_some_and(|c| c.cancel_in_progress),
        cancel_previous: event.event == TriggerEvent::Push,
    }
}

fn create_runs(
    db: &ActionsDb,
    candidates: Vec<Candidate>,
    fx: &mut Effects,
) -> anyhow::Result<Vec<Run>> {
    let mut runs = Vec::with_capacity(candidates.len());
    for c in candidates {
        let new = &c.new_run;
        if c.cancel_previous {
            for old in
                db.active_runs_for_ref(new.repo_id, &new.ref_name, &new.workflow_id, &new.event)?
            {
                info!(run_id = old.id, "Cancelling superseded run");
                state::cancel_run(db, old.id, fx)?;
            }
        }
        if c.cancel_in_progress {
            if let Some(group) = &new.concurrency_group {
                for old in db.active_runs_in_group(new.repo_id, group)? {
                    info!(run_id = old.id, group = %group, "Cancelling run in concurrency group");
                    state::cancel_run(db, old.id, fx)?;
                }
            }
        }
        runs.push(state::insert_run_graph(db, new, &c.graph, fx)?);
    }
    Ok(runs)
}

/// Expand the `github.*` expressions a concurrency group may use.
fn expand_group(group: &str, event: &RepoEvent, workflow_id: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\$\{\{\s*github\.(\w+)\s*\}\}").expect("static regex")
    });
    re.replace_all(group, |caps: &regex::Captures<'_>| match &caps[1] {
        "ref" => event.ref_name.clone(),
        "sha" => event.commit_sha.clone(),
        "workflow" => workflow_id.to_string(),
        "event_name" => event.event.as_str().to_string(),
        "actor" => event.actor.clone(),
        _ => String::new(),
    })
    .into_owned()
}

/// Check dispatch inputs against the workflow's declaration and fill in
/// defaults.
fn resolve_inputs(
    declared: &BTreeMap<String, DispatchInput>,
    mut given: BTreeMap<String, String>,
) -> ActionsResult<BTreeMap<String, String>> {
    if let Some(unknown) = given.keys().find(|k| !declared.contains_key(*k)) {
        return Err(ActionsError::BadRequest(format!("unknown input '{}'", unknown)));
    }
    let mut resolved = BTreeMap::new();
    for (name, decl) in declared {
        match given.remove(name).or_else(|| decl.default.clone()) {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None if decl.required => {
                return Err(ActionsError::BadRequest(format!(
                    "missing required input '{}'",
                    name
                )));
            }
            None => {}
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogCompression;
    use crate::scheduler::{TracingSink, VersionNotifier};
    use crate::store::{DbHandle, LogStore};

    const CI: &str = r#"
name: CI
on:
  push:
    branches: [main]
  pull_request:
concurrency:
  group: ci-${{ github.ref }}
  cancel-in-progress: true
jobs:
  build:
    runs-on: linux
  test:
    needs: build
    runs-on: linux
"#;

    const NIGHTLY: &str = r#"
on:
  schedule:
    - cron: '0 3 * * *'
    - cron: 'bogus'
jobs:
  sweep:
    runs-on: linux
"#;

    const MANUAL: &str = r#"
name: Deploy
on:
  workflow_dispatch:
    inputs:
      target:
        required: true
      level:
        default: info
jobs:
  deploy:
    runs-on: linux
"#;

    const CYCLIC: &str = "on: push\njobs:\n  a:\n    needs: b\n    runs-on: x\n  b:\n    needs: a\n    runs-on: x\n";

    struct Fixture {
        dispatcher: EventDispatcher,
        git: Arc<SnapshotGitSource>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = JobScheduler::new(
            DbHandle::new(ActionsDb::new_in_memory().unwrap()),
            LogStore::new(dir.path(), LogCompression::None),
            VersionNotifier::new(),
            Arc::new(TracingSink),
        );
        let git = Arc::new(SnapshotGitSource::new());
        let dispatcher = EventDispatcher::new(scheduler, git.clone(), ActionsSettings::default());
        Fixture {
            dispatcher,
            git,
            _dir: dir,
        }
    }

    fn commit(sha: &str, message: &str, files: &[(&str, &str)]) -> CommitInfo {
        CommitInfo {
            sha: sha.to_string(),
            message: message.to_string(),
            changed_files: None,
            workflows: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        }
    }

    fn push(sha: &str) -> RepoEvent {
        RepoEvent {
            repo_id: 1,
            owner_id: 10,
            event: TriggerEvent::Push,
            action: None,
            ref_name: "refs/heads/main".to_string(),
            commit_sha: sha.to_string(),
            actor: "alice".to_string(),
            is_fork_pull_request: false,
            inputs: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_push_creates_matching_runs() {
        let f = fixture();
        f.git
            .record_commit(
                1,
                Some("refs/heads/main"),
                commit(
                    "a1",
                    "Add CI\n\nbody",
                    &[(".github/workflows/ci.yml", CI), (".github/workflows/manual.yml", MANUAL)],
                ),
            )
            .await;

        let outcome = f.dispatcher.dispatch(push("a1")).await.unwrap();
        assert_eq!(outcome.created.len(), 1);
        let run = &outcome.created[0];
        assert_eq!(run.title, "Add CI");
        assert_eq!(run.workflow_id, ".github/workflows/ci.yml");
        assert_eq!(run.concurrency_group.as_deref(), Some("ci-refs/heads/main"));

        let jobs = f.dispatcher.scheduler().list_jobs(run.id).await.unwrap();
        let statuses: Vec<JobStatus> = jobs.iter().map(|j| j.status).collect();
        assert_eq!(statuses, vec![JobStatus::Waiting, JobStatus::Blocked]);
    }

    #[tokio::test]
    async fn test_new_push_cancels_previous_run() {
        let f = fixture();
        for sha in ["a1", "b2"] {
            f.git
                .record_commit(
                    1,
                    Some("refs/heads/main"),
                    commit(sha, "wip", &[(".github/workflows/ci.yml", CI)]),
                )
                .await;
        }
        let first = f.dispatcher.dispatch(push("a1")).await.unwrap().created.remove(0);
        f.dispatcher.dispatch(push("b2")).await.unwrap();

        let first = f.dispatcher.scheduler().get_run(first.id).await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);
        let jobs = f.dispatcher.scheduler().list_jobs(first.id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_skip_ci_creates_nothing() {
        let f = fixture();
        f.git
            .record_commit(
                1,
                None,
                commit("a1", "docs only [skip ci]", &[(".github/workflows/ci.yml", CI)]),
            )
            .await;
        let outcome = f.dispatcher.dispatch(push("a1")).await.unwrap();
        assert!(outcome.skipped_ci);
        assert!(outcome.created.is_empty());
        assert!(f.dispatcher.scheduler().list_runs(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cyclic_workflow_is_rejected_alone() {
        let f = fixture();
        f.git
            .record_commit(
                1,
                None,
                commit(
                    "a1",
                    "x",
                    &[
                        (".github/workflows/ci.yml", CI),
                        (".github/workflows/loop.yml", CYCLIC),
                    ],
                ),
            )
            .await;
        let outcome = f.dispatcher.dispatch(push("a1")).await.unwrap();
        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert!(matches!(outcome.rejected[0].error, GraphError::Cycle { .. }));
        assert_eq!(f.dispatcher.scheduler().list_runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fork_pull_request_needs_approval() {
        let f = fixture();
        f.git
            .record_commit(1, None, commit("a1", "x", &[(".github/workflows/ci.yml", CI)]))
            .await;
        let mut event = push("a1");
        event.event = TriggerEvent::PullRequest;
        event.action = Some("opened".to_string());
        event.is_fork_pull_request = true;

        let run = f.dispatcher.dispatch(event).await.unwrap().created.remove(0);
        assert!(run.needs_approval);
        let jobs = f.dispatcher.scheduler().list_jobs(run.id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == JobStatus::Blocked));
    }

    #[tokio::test]
    async fn test_default_branch_push_registers_schedules() {
        let f = fixture();
        f.git
            .record_commit(
                1,
                Some("refs/heads/main"),
                commit("a1", "x", &[(".github/workflows/nightly.yml", NIGHTLY)]),
            )
            .await;
        f.git.set_default_branch(1, "refs/heads/main").await;

        let outcome = f.dispatcher.dispatch(push("a1")).await.unwrap();
        assert!(outcome.created.is_empty());
        let schedules = f
            .dispatcher
            .scheduler()
            .db()
            .call(|db| db.list_schedules_for_repo(1))
            .await
            .unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].commit_sha, "a1");
        assert_eq!(schedules[0].specs.len(), 1);
        assert_eq!(schedules[0].specs[0].spec, "0 3 * * *");
    }

    #[tokio::test]
    async fn test_dispatch_workflow_inputs() {
        let f = fixture();
        f.git
            .record_commit(
                1,
                Some("refs/heads/main"),
                commit("a1", "x", &[(".github/workflows/deploy.yml", MANUAL)]),
            )
            .await;

        let err = f
            .dispatcher
            .dispatch_workflow(
                1,
                10,
                ".github/workflows/deploy.yml",
                "main",
                "bob",
                BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionsError::BadRequest(_)));

        let inputs = BTreeMap::from([("target".to_string(), "prod".to_string())]);
        let run = f
            .dispatcher
            .dispatch_workflow(1, 10, ".github/workflows/deploy.yml", "main", "bob", inputs)
            .await
            .unwrap();
        assert_eq!(run.event, TriggerEvent::WorkflowDispatch);
        assert_eq!(run.title, "Deploy");
        assert_eq!(run.inputs.get("level").map(String::as_str), Some("info"));
        assert_eq!(run.inputs.get("target").map(String::as_str), Some("prod"));

        let err = f
            .dispatcher
            .dispatch_workflow(
                1,
                10,
                ".github/workflows/missing.yml",
                "main",
                "bob",
                BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionsError::NotFound { .. }));
    }

    #[test]
    fn test_expand_group() {
        let event = push("abc");
        assert_eq!(
            expand_group("${{ github.workflow }}-${{github.ref}}", &event, "ci.yml"),
            "ci.yml-refs/heads/main"
        );
    }
}
