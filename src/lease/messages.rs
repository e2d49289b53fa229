//! Runner RPC messages, encoded as JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{JobStatus, LogRow, Runner, StepState, TaskStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub ephemeral: bool,
}

/// Runner identity returned by `Register` and `Declare`. `token` is only
/// populated on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub id: i64,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub name: String,
    pub version: String,
    pub labels: Vec<String>,
    pub ephemeral: bool,
}

impl RunnerInfo {
    pub fn from_runner(runner: &Runner, token: Option<String>) -> Self {
        Self {
            id: runner.id,
            uuid: runner.uuid.clone(),
            token,
            name: runner.name.clone(),
            version: runner.version.clone(),
            labels: runner.labels.clone(),
            ephemeral: runner.ephemeral,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub runner: RunnerInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeclareRequest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareResponse {
    pub runner: RunnerInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchTaskRequest {
    #[serde(default)]
    pub tasks_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchTaskResponse {
    pub task: Option<TaskPayload>,
    pub tasks_version: i64,
}

/// Everything a runner needs to execute a leased job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub id: i64,
    pub lease_token: String,
    /// The job definition (steps, env, container, ...) as written in the
    /// workflow, with the matrix combination filled in.
    pub workflow_payload: serde_json::Value,
    pub context: BTreeMap<String, serde_json::Value>,
    pub needs: BTreeMap<String, TaskNeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskNeed {
    pub result: JobStatus,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStateReport {
    /// A terminal value finishes the task; anything else is progress.
    #[serde(default)]
    pub result: Option<TaskStatus>,
    #[serde(default)]
    pub steps: Vec<StepState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    pub task_id: i64,
    pub lease_token: String,
    #[serde(default)]
    pub state: TaskStateReport,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateView {
    pub id: i64,
    pub result: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTaskResponse {
    /// Server-side task state; `cancelled` tells the runner to stop.
    pub state: TaskStateView,
    pub sent_outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLogRequest {
    pub task_id: i64,
    pub lease_token: String,
    pub index: i64,
    #[serde(default)]
    pub rows: Vec<LogRow>,
    #[serde(default)]
    pub no_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLogResponse {
    pub ack_index: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_task_request_defaults() {
        let req: UpdateTaskRequest =
            serde_json::from_str(r#"{"task_id": 3, "lease_token": "abc"}"#).unwrap();
        assert!(req.state.result.is_none());
        assert!(req.outputs.is_empty());

        let req: UpdateTaskRequest = serde_json::from_str(
            r#"{"task_id": 3, "lease_token": "abc", "state": {"result": "succeeded"}}"#,
        )
        .unwrap();
        assert_eq!(req.state.result, Some(TaskStatus::Succeeded));
    }

    #[test]
    fn update_log_request_parses_rows() {
        let req: UpdateLogRequest = serde_json::from_str(
            r#"{"task_id": 1, "lease_token": "t", "index": 0,
                "rows": [{"time": "2026-01-01T00:00:00Z", "content": "hi"}]}"#,
        )
        .unwrap();
        assert_eq!(req.rows.len(), 1);
        assert!(!req.no_more);
    }
}
