//! Typed error hierarchy for the Actions core.
//!
//! Two top-level enums:
//! - `GraphError` — workflow definitions that cannot become a job DAG
//! - `ActionsError` — every rejection the scheduler, registry and lease
//!   protocol hand back to a caller (runner RPC or operator action)
//!
//! Store code returns `anyhow::Result`; it is folded into
//! `ActionsError::Store` at the service boundary.

use thiserror::Error;

/// Errors raised while turning a workflow document into a job graph.
/// Any of these aborts run creation before anything is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Cycle detected in job dependencies. Involved jobs: {jobs:?}")]
    Cycle { jobs: Vec<String> },

    #[error("Job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Duplicate job key: {0}")]
    DuplicateJob(String),

    #[error("Invalid matrix for job '{job}': {message}")]
    InvalidMatrix { job: String, message: String },

    #[error("Workflow has no jobs")]
    Empty,

    #[error("Invalid workflow document: {0}")]
    Parse(String),
}

/// Errors surfaced by the Actions service to runners and operators.
#[derive(Debug, Error)]
pub enum ActionsError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Stale or forged credential for a runner or a task lease.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Invalid registration token")]
    InvalidRegistrationToken,

    #[error("Runner {uuid} has been removed")]
    RunnerRemoved { uuid: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Log rows out of order: expected start index {expected}, got {got}")]
    OrderingViolation { expected: i64, got: i64 },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ActionsError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ActionsError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Short machine-readable code used in RPC error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ActionsError::NotFound { .. } => "not_found",
            ActionsError::Unauthenticated(_) => "unauthenticated",
            ActionsError::InvalidRegistrationToken => "invalid_registration_token",
            ActionsError::RunnerRemoved { .. } => "runner_removed",
            ActionsError::InvalidState(_) => "invalid_state",
            ActionsError::OrderingViolation { .. } => "ordering_violation",
            ActionsError::BadRequest(_) => "bad_request",
            ActionsError::Graph(_) => "graph_error",
            ActionsError::Store(_) => "internal",
        }
    }
}

pub type ActionsResult<T> = Result<T, ActionsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_cycle_lists_jobs() {
        let err = GraphError::Cycle {
            jobs: vec!["a".to_string(), "b".to_string()],
        };
        match &err {
            GraphError::Cycle { jobs } => assert_eq!(jobs.len(), 2),
            _ => panic!("Expected Cycle"),
        }
        assert!(err.to_string().contains("Cycle"));
        assert!(err.to_string().contains("\"a\""));
    }

    #[test]
    fn graph_error_converts_into_actions_error() {
        let inner = GraphError::UnknownDependency {
            job: "test".to_string(),
            dependency: "build".to_string(),
        };
        let err: ActionsError = inner.into();
        match &err {
            ActionsError::Graph(GraphError::UnknownDependency { job, dependency }) => {
                assert_eq!(job, "test");
                assert_eq!(dependency, "build");
            }
            _ => panic!("Expected ActionsError::Graph(UnknownDependency)"),
        }
        assert_eq!(err.code(), "graph_error");
    }

    #[test]
    fn ordering_violation_carries_expected_index() {
        let err = ActionsError::OrderingViolation {
            expected: 7,
            got: 3,
        };
        match &err {
            ActionsError::OrderingViolation { expected, got } => {
                assert_eq!(*expected, 7);
                assert_eq!(*got, 3);
            }
            _ => panic!("Expected OrderingViolation"),
        }
        assert!(err.to_string().contains("expected start index 7"));
    }

    #[test]
    fn store_error_wraps_anyhow() {
        let err: ActionsError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, ActionsError::Store(_)));
        assert_eq!(err.code(), "internal");
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn not_found_formats_kind_and_id() {
        let err = ActionsError::not_found("Task", 42);
        assert_eq!(err.to_string(), "Task 42 not found");
    }
}
