use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::dispatch::{CommitInfo, RepoEvent, SnapshotGitSource};
use crate::errors::ActionsError;
use crate::lease::messages::*;
use crate::models::{Job, Run, Scope};
use crate::service::ActionsService;

pub const RUNNER_UUID_HEADER: &str = "x-runner-uuid";
pub const RUNNER_TOKEN_HEADER: &str = "x-runner-token";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: ActionsService,
    /// The same source the dispatcher reads, kept concrete so the forge
    /// can push commits into it.
    pub git: Arc<SnapshotGitSource>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RecordCommitRequest {
    #[serde(flatten)]
    pub commit: CommitInfo,
    pub ref_name: Option<String>,
    #[serde(default)]
    pub default_branch: bool,
}

#[derive(Deserialize)]
pub struct DispatchWorkflowRequest {
    pub owner_id: i64,
    pub workflow_id: String,
    pub ref_name: String,
    pub actor: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Deserialize)]
pub struct ApproveRunRequest {
    pub approver: String,
}

#[derive(Deserialize, Default)]
pub struct RegistrationTokenRequest {
    pub owner_id: Option<i64>,
    pub repo_id: Option<i64>,
}

#[derive(Serialize, Deserialize)]
pub struct RegistrationTokenResponse {
    pub token: String,
}

#[derive(Serialize, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    pub jobs: Vec<Job>,
}

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError(pub ActionsError);

impl From<ActionsError> for ApiError {
    fn from(err: ActionsError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            ActionsError::NotFound { .. } => StatusCode::NOT_FOUND,
            ActionsError::Unauthenticated(_)
            | ActionsError::InvalidRegistrationToken
            | ActionsError::RunnerRemoved { .. } => StatusCode::UNAUTHORIZED,
            ActionsError::InvalidState(_) | ActionsError::OrderingViolation { .. } => {
                StatusCode::CONFLICT
            }
            ActionsError::BadRequest(_) | ActionsError::Graph(_) => StatusCode::BAD_REQUEST,
            ActionsError::Store(e) => {
                error!(error = %e, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let mut body = serde_json::json!({"error": err.to_string(), "code": err.code()});
        if let ActionsError::OrderingViolation { expected, .. } = &err {
            body["expected_index"] = (*expected).into();
        }
        (status, Json(body)).into_response()
    }
}

// ── Runner credentials ────────────────────────────────────────────────

/// Runner identity carried in the `x-runner-uuid` / `x-runner-token` headers.
pub struct RunnerAuth {
    pub uuid: String,
    pub token: String,
}

impl<S: Send + Sync> FromRequestParts<S> for RunnerAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        match (header(RUNNER_UUID_HEADER), header(RUNNER_TOKEN_HEADER)) {
            (Some(uuid), Some(token)) => Ok(RunnerAuth { uuid, token }),
            _ => Err(ApiError(ActionsError::Unauthenticated(
                "missing runner credentials".to_string(),
            ))),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

const RPC: &str = "/api/actions/runner.v1.RunnerService";

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(&format!("{RPC}/Ping"), post(rpc_ping))
        .route(&format!("{RPC}/Register"), post(rpc_register))
        .route(&format!("{RPC}/Declare"), post(rpc_declare))
        .route(&format!("{RPC}/FetchTask"), post(rpc_fetch_task))
        .route(&format!("{RPC}/UpdateTask"), post(rpc_update_task))
        .route(&format!("{RPC}/UpdateLog"), post(rpc_update_log))
        .route("/api/events", post(dispatch_event))
        .route("/api/repos/{id}", delete(purge_repository))
        .route("/api/repos/{id}/commits", post(record_commit))
        .route("/api/repos/{id}/dispatch", post(dispatch_workflow))
        .route("/api/repos/{id}/runs", get(list_runs))
        .route("/api/repos/{id}/schedules", get(list_schedules))
        .route("/api/owners/{id}", delete(purge_owner))
        .route("/api/runs/{id}", get(get_run).delete(delete_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/rerun", post(rerun_run))
        .route("/api/runs/{id}/approve", post(approve_run))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/rerun", post(rerun_job))
        .route("/api/jobs/{id}/runners", get(job_candidates))
        .route("/api/tasks/{id}/logs", get(read_task_log))
        .route("/api/runners", get(list_runners))
        .route("/api/runners/{id}", delete(delete_runner))
        .route("/api/runners/registration-token", post(create_registration_token))
        .route("/health", get(health_check))
}

// ── Handlers: runner RPC ──────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn rpc_ping(
    State(state): State<SharedState>,
    Json(req): Json<PingRequest>,
) -> Json<PingResponse> {
    Json(state.service.lease.ping(req))
}

async fn rpc_register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let registered = state
        .service
        .registry
        .register(req.token, req.name, req.version, req.labels, req.ephemeral)
        .await?;
    Ok(Json(RegisterResponse {
        runner: RunnerInfo::from_runner(&registered.runner, Some(registered.token)),
    }))
}

async fn rpc_declare(
    State(state): State<SharedState>,
    auth: RunnerAuth,
    Json(req): Json<DeclareRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = &state.service.registry;
    let runner = registry.authenticate(auth.uuid, auth.token).await?;
    let runner = registry.declare(&runner, req.version, req.labels).await?;
    Ok(Json(DeclareResponse {
        runner: RunnerInfo::from_runner(&runner, None),
    }))
}

async fn rpc_fetch_task(
    State(state): State<SharedState>,
    auth: RunnerAuth,
    Json(req): Json<FetchTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .service
        .lease
        .fetch_task(auth.uuid, auth.token, req)
        .await?;
    Ok(Json(resp))
}

async fn rpc_update_task(
    State(state): State<SharedState>,
    auth: RunnerAuth,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .service
        .lease
        .update_task(auth.uuid, auth.token, req)
        .await?;
    Ok(Json(resp))
}

async fn rpc_update_log(
    State(state): State<SharedState>,
    auth: RunnerAuth,
    Json(req): Json<UpdateLogRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .service
        .lease
        .update_log(auth.uuid, auth.token, req)
        .await?;
    Ok(Json(resp))
}

// ── Handlers: forge events ────────────────────────────────────────────

async fn dispatch_event(
    State(state): State<SharedState>,
    Json(event): Json<RepoEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.service.dispatcher.dispatch(event).await?;
    Ok(Json(outcome))
}

async fn record_commit(
    State(state): State<SharedState>,
    Path(repo_id): Path<i64>,
    Json(req): Json<RecordCommitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.default_branch && req.ref_name.is_none() {
        return Err(ApiError(ActionsError::BadRequest(
            "default_branch requires ref_name".to_string(),
        )));
    }
    if let (true, Some(ref_name)) = (req.default_branch, &req.ref_name) {
        state.git.set_default_branch(repo_id, ref_name).await;
    }
    state
        .git
        .record_commit(repo_id, req.ref_name.as_deref(), req.commit)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn dispatch_workflow(
    State(state): State<SharedState>,
    Path(repo_id): Path<i64>,
    Json(req): Json<DispatchWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .service
        .dispatcher
        .dispatch_workflow(
            repo_id,
            req.owner_id,
            &req.workflow_id,
            &req.ref_name,
            &req.actor,
            req.inputs,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn purge_repository(
    State(state): State<SharedState>,
    Path(repo_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state.service.scheduler.purge_repository(repo_id).await?;
    Ok(Json(serde_json::json!({"deleted_runs": runs})))
}

async fn purge_owner(
    State(state): State<SharedState>,
    Path(owner_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state.service.scheduler.purge_owner(owner_id).await?;
    Ok(Json(serde_json::json!({"deleted_runs": runs})))
}

// ── Handlers: runs, jobs, tasks ───────────────────────────────────────

async fn list_runs(
    State(state): State<SharedState>,
    Path(repo_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.scheduler.list_runs(repo_id).await?))
}

async fn list_schedules(
    State(state): State<SharedState>,
    Path(repo_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.ticker.list_schedules(repo_id).await?))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(run_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let scheduler = &state.service.scheduler;
    let run = scheduler.get_run(run_id).await?;
    let jobs = scheduler.list_jobs(run_id).await?;
    Ok(Json(RunDetail { run, jobs }))
}

async fn delete_run(
    State(state): State<SharedState>,
    Path(run_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.scheduler.delete_run(run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(run_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.scheduler.cancel_run(run_id).await?))
}

async fn rerun_run(
    State(state): State<SharedState>,
    Path(run_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.rerun.rerun_run(run_id).await?))
}

async fn approve_run(
    State(state): State<SharedState>,
    Path(run_id): Path<i64>,
    Json(req): Json<ApproveRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.service.scheduler.approve_run(run_id, req.approver).await?,
    ))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(job_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.scheduler.cancel_job(job_id).await?))
}

async fn rerun_job(
    State(state): State<SharedState>,
    Path(job_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.rerun.rerun_job(job_id).await?))
}

async fn read_task_log(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.lease.read_log(task_id).await?))
}

// ── Handlers: runners ─────────────────────────────────────────────────

/// Runners that could take this job right now.
async fn job_candidates(
    State(state): State<SharedState>,
    Path(job_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.scheduler.get_job(job_id).await?;
    let runners = state
        .service
        .registry
        .match_candidates(job.owner_id, job.repo_id, job.runs_on)
        .await?;
    Ok(Json(runners))
}

async fn list_runners(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.registry.list().await?))
}

async fn delete_runner(
    State(state): State<SharedState>,
    Path(runner_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.registry.delete(runner_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_registration_token(
    State(state): State<SharedState>,
    Json(req): Json<RegistrationTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scope = match (req.repo_id, req.owner_id) {
        (Some(repo_id), _) => Scope::repo(repo_id),
        (None, Some(owner_id)) => Scope::owner(owner_id),
        (None, None) => Scope::global(),
    };
    let token = state.service.registry.create_registration_token(scope).await?;
    Ok((StatusCode::CREATED, Json(RegistrationTokenResponse { token })))
}

// ── Tests ─────────────────────────────────────────────────────────────
