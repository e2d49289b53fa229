//! Workflow documents and the job graph built from them.
//!
//! - `doc` decodes the YAML into the handful of keys scheduling cares about
//! - `trigger` parses `on:` and decides whether an event fires a workflow
//! - `matrix` expands `strategy.matrix` into concrete combinations
//! - `graph` turns the expanded jobs into an index-based DAG

pub mod doc;
pub mod graph;
pub mod matrix;
pub mod trigger;

pub use doc::{Concurrency, JobDef, WorkflowDoc};
pub use graph::{JobGraph, JobIndex, JobNode, WorkflowGraphBuilder, build_graph};
pub use trigger::{EventContext, EventFilter, Triggers};

/// Directories scanned for workflow files, in priority order.
pub const WORKFLOW_DIRS: &[&str] = &[".gitea/workflows", ".github/workflows"];

/// Whether `path` names a workflow file.
pub fn is_workflow_path(path: &str) -> bool {
    WORKFLOW_DIRS.iter().any(|dir| {
        path.strip_prefix(dir)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|name| {
                !name.contains('/') && (name.ends_with(".yml") || name.ends_with(".yaml"))
            })
    })
}
