//! Runner registration tokens — `cinder token`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cinder::config::CinderConfig;
use cinder::models::Scope;
use cinder::registry::RunnerRegistry;
use cinder::store::{ActionsDb, DbHandle};

use super::super::TokenCommands;

pub async fn cmd_token(config_path: Option<&Path>, command: TokenCommands) -> Result<()> {
    match command {
        TokenCommands::Create {
            owner,
            repo,
            db_path,
        } => create_token(config_path, owner, repo, db_path).await,
    }
}

async fn create_token(
    config_path: Option<&Path>,
    owner: Option<i64>,
    repo: Option<i64>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    let config = CinderConfig::load(config_path)?.with_cli_args(None, db_path);
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = ActionsDb::new(&config.db_path)?;
    let registry = RunnerRegistry::new(DbHandle::new(db), config.actions);

    let scope = match (repo, owner) {
        (Some(repo_id), _) => Scope::repo(repo_id),
        (None, Some(owner_id)) => Scope::owner(owner_id),
        (None, None) => Scope::global(),
    };
    let token = registry.create_registration_token(scope).await?;
    eprintln!("Registration token for {} (older tokens of this scope are retired):", scope);
    println!("{}", token);
    Ok(())
}
