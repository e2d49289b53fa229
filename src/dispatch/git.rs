//! Git object store collaborator.
//!
//! The dispatcher only needs three questions answered: what a commit
//! touched and which workflow files it carries, what a ref points at, and
//! where the default branch head is. [`SnapshotGitSource`] answers them from
//! commit snapshots pushed in by the forge.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::workflow::is_workflow_path;

/// What the dispatcher needs to know about one commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    #[serde(default)]
    pub message: String,
    /// `None` when the forge could not compute a diff; path filters pass.
    #[serde(default)]
    pub changed_files: Option<Vec<String>>,
    /// Workflow file path -> YAML content at this commit.
    #[serde(default)]
    pub workflows: BTreeMap<String, String>,
}

impl CommitInfo {
    /// Workflow files in a stable order, ignoring anything outside the
    /// workflow directories.
    pub fn workflow_files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.workflows
            .iter()
            .filter(|(path, _)| is_workflow_path(path))
            .map(|(path, content)| (path.as_str(), content.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHead {
    /// Full ref, e.g. `refs/heads/main`.
    pub ref_name: String,
    pub sha: String,
}

#[async_trait]
pub trait GitSource: Send + Sync {
    async fn commit(&self, repo_id: i64, sha: &str) -> Result<Option<CommitInfo>>;
    async fn resolve_ref(&self, repo_id: i64, ref_name: &str) -> Result<Option<String>>;
    async fn default_branch(&self, repo_id: i64) -> Result<Option<BranchHead>>;
}

#[derive(Debug, Default)]
struct RepoSnapshot {
    commits: HashMap<String, CommitInfo>,
    refs: HashMap<String, String>,
    default_branch: Option<String>,
}

/// In-memory git view fed through `POST /api/repos/{id}/commits`.
#[derive(Debug, Default)]
pub struct SnapshotGitSource {
    repos: RwLock<HashMap<i64, RepoSnapshot>>,
}

impl SnapshotGitSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a commit. When `ref_name` is given the ref is moved to it.
    pub async fn record_commit(&self, repo_id: i64, ref_name: Option<&str>, commit: CommitInfo) {
        let mut repos = self.repos.write().await;
        let repo = repos.entry(repo_id).or_default();
        if let Some(ref_name) = ref_name {
            repo.refs.insert(ref_name.to_string(), commit.sha.clone());
        }
        repo.commits.insert(commit.sha.clone(), commit);
    }

    pub async fn set_default_branch(&self, repo_id: i64, ref_name: &str) {
        let mut repos = self.repos.write().await;
        repos.entry(repo_id).or_default().default_branch = Some(ref_name.to_string());
    }
}

#[async_trait]
impl GitSource for SnapshotGitSource {
    async fn commit(&self, repo_id: i64, sha: &str) -> Result<Option<CommitInfo>> {
        let repos = self.repos.read().await;
        Ok(repos
            .get(&repo_id)
            .and_then(|r| r.commits.get(sha))
            .cloned())
    }

    async fn resolve_ref(&self, repo_id: i64, ref_name: &str) -> Result<Option<String>> {
        let repos = self.repos.read().await;
        let Some(repo) = repos.get(&repo_id) else {
            return Ok(None);
        };
        let full = if ref_name.starts_with("refs/") {
            ref_name.to_string()
        } else {
            format!("refs/heads/{}", ref_name)
        };
        Ok(repo
            .refs
            .get(&full)
            .or_else(|| repo.commits.get(ref_name).map(|c| &c.sha))
            .cloned())
    }

    async fn default_branch(&self, repo_id: i64) -> Result<Option<BranchHead>> {
        let repos = self.repos.read().await;
        let Some(repo) = repos.get(&repo_id) else {
            return Ok(None);
        };
        Ok(repo.default_branch.as_ref().and_then(|name| {
            repo.refs.get(name).map(|sha| BranchHead {
                ref_name: name.clone(),
                sha: sha.clone(),
            })
        }))
    }
}
