use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ── Timestamps ────────────────────────────────────────────────────────

/// Timestamps are stored as fixed-width RFC 3339 strings (UTC, millis) so
/// they sort lexicographically in SQL.
pub fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    ts(Utc::now())
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ── Statuses ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Blocked,
    Waiting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(Self::Blocked),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Why a job ended up `Skipped`. Downstream jobs treat a condition skip as
/// satisfied and an upstream-failure skip as failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    Condition,
    UpstreamFailed,
}

impl SkipCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Condition => "condition",
            Self::UpstreamFailed => "upstream_failed",
        }
    }
}

impl FromStr for SkipCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "condition" => Ok(Self::Condition),
            "upstream_failed" => Ok(Self::UpstreamFailed),
            _ => Err(format!("Invalid skip cause: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// The job status a terminal task result resolves to.
    pub fn job_status(&self) -> JobStatus {
        match self {
            Self::Waiting | Self::Assigned | Self::Running => JobStatus::Running,
            Self::Succeeded => JobStatus::Succeeded,
            Self::Failed => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
            Self::Skipped => JobStatus::Skipped,
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Cached aggregate of a run's job statuses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// `Running` while any job is non-terminal; `Succeeded` iff every job is
    /// terminal and none failed or was cancelled; `Failed` otherwise.
    pub fn aggregate<I>(statuses: I) -> RunStatus
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut any_failed = false;
        for status in statuses {
            match status {
                JobStatus::Failed | JobStatus::Cancelled => any_failed = true,
                s if !s.is_terminal() => return RunStatus::Running,
                _ => {}
            }
        }
        if any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────

/// Repository event kinds that can trigger a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum TriggerEvent {
    Push,
    PullRequest,
    PullRequestTarget,
    Schedule,
    WorkflowDispatch,
    Create,
    Delete,
    Release,
    Other(String),
}

impl TriggerEvent {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::PullRequestTarget => "pull_request_target",
            Self::Schedule => "schedule",
            Self::WorkflowDispatch => "workflow_dispatch",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Release => "release",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for TriggerEvent {
    fn from(s: &str) -> Self {
        match s {
            "push" => Self::Push,
            "pull_request" => Self::PullRequest,
            "pull_request_target" => Self::PullRequestTarget,
            "schedule" => Self::Schedule,
            "workflow_dispatch" => Self::WorkflowDispatch,
            "create" => Self::Create,
            "delete" => Self::Delete,
            "release" => Self::Release,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for TriggerEvent {
    fn from(s: String) -> Self {
        TriggerEvent::from(s.as_str())
    }
}

impl From<TriggerEvent> for String {
    fn from(e: TriggerEvent) -> Self {
        e.as_str().to_string()
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Rows ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    /// Workflow file path relative to the repository root.
    pub workflow_id: String,
    pub title: String,
    pub event: TriggerEvent,
    pub commit_sha: String,
    pub ref_name: String,
    pub trigger_user: String,
    pub run_number: i64,
    pub attempt: i64,
    pub status: RunStatus,
    pub concurrency_group: Option<String>,
    pub needs_approval: bool,
    pub approved_by: Option<String>,
    pub is_fork_pull_request: bool,
    pub inputs: BTreeMap<String, String>,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub run_id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub commit_sha: String,
    pub name: String,
    /// Unique key within the run (base key plus matrix suffix).
    pub job_key: String,
    /// The `jobs.<id>` key this job was expanded from.
    pub base_key: String,
    /// Keys of the expanded jobs this one needs.
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub matrix: BTreeMap<String, String>,
    pub if_expr: Option<String>,
    pub runs_regardless: bool,
    pub depth: i64,
    pub pending_needs: i64,
    pub failed_needs: i64,
    pub status: JobStatus,
    pub skip_cause: Option<SkipCause>,
    pub attempt: i64,
    pub task_id: Option<i64>,
    /// Opaque job definition (steps, env, ...) handed to the runner.
    pub payload: String,
    pub queued_at: Option<String>,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// Whether this job counts as satisfied for jobs that need it.
    pub fn satisfies_needs(&self) -> bool {
        match self.status {
            JobStatus::Succeeded => true,
            JobStatus::Skipped => self.skip_cause == Some(SkipCause::Condition),
            _ => false,
        }
    }

    /// Runner labels are compared case-insensitively; both sides are stored
    /// lowercased.
    pub fn labels_match(&self, runner_labels: &[String]) -> bool {
        self.runs_on.iter().all(|l| runner_labels.contains(l))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub id: i64,
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub log_index: i64,
    #[serde(default)]
    pub log_length: i64,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub job_id: i64,
    pub run_id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub runner_id: Option<i64>,
    pub attempt: i64,
    pub status: TaskStatus,
    pub token_last_eight: String,
    /// Number of log rows acknowledged so far.
    pub log_index: i64,
    /// Bytes of raw log written so far.
    pub log_length: i64,
    pub log_in_storage: bool,
    pub log_expired: bool,
    pub lease_expires_at: Option<String>,
    pub steps: Vec<StepState>,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Visibility scope of a runner or registration token. `repo_id > 0` is a
/// repository scope, `owner_id > 0` an org/user scope, both zero global.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub owner_id: i64,
    pub repo_id: i64,
}

impl Scope {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn owner(owner_id: i64) -> Self {
        Self {
            owner_id,
            repo_id: 0,
        }
    }

    pub fn repo(repo_id: i64) -> Self {
        Self {
            owner_id: 0,
            repo_id,
        }
    }

    pub fn is_global(&self) -> bool {
        self.owner_id == 0 && self.repo_id == 0
    }

    /// Whether a runner in this scope may run jobs of `repo_id` owned by
    /// `owner_id`.
    pub fn can_run(&self, owner_id: i64, repo_id: i64) -> bool {
        if self.repo_id > 0 {
            self.repo_id == repo_id
        } else if self.owner_id > 0 {
            self.owner_id == owner_id
        } else {
            true
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.repo_id > 0 {
            write!(f, "repo:{}", self.repo_id)
        } else if self.owner_id > 0 {
            write!(f, "owner:{}", self.owner_id)
        } else {
            write!(f, "global")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub owner_id: i64,
    pub repo_id: i64,
    pub version: String,
    pub labels: Vec<String>,
    pub ephemeral: bool,
    /// Task currently (or, for ephemeral runners, last) leased to the runner.
    pub task_id: Option<i64>,
    pub token_last_eight: String,
    pub last_online: Option<String>,
    pub last_active: Option<String>,
    pub created_at: String,
}

impl Runner {
    pub fn scope(&self) -> Scope {
        Scope {
            owner_id: self.owner_id,
            repo_id: self.repo_id,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.task_id.is_some()
    }

    pub fn is_online(&self, now: DateTime<Utc>, offline_after: std::time::Duration) -> bool {
        let Some(seen) = self.last_online.as_deref().and_then(parse_ts) else {
            return false;
        };
        let window = chrono::Duration::from_std(offline_after)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        now.signed_duration_since(seen) < window
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub id: i64,
    pub owner_id: i64,
    pub repo_id: i64,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRow {
    pub time: DateTime<Utc>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub workflow_id: String,
    pub title: String,
    pub ref_name: String,
    pub commit_sha: String,
    pub trigger_user: String,
    pub specs: Vec<ScheduleSpec>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub id: i64,
    pub schedule_id: i64,
    pub repo_id: i64,
    pub spec: String,
    pub next_fire: String,
    pub prev_fire: Option<String>,
}
