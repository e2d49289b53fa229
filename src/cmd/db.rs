//! Database initialization — `cinder init-db`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cinder::config::CinderConfig;
use cinder::store::ActionsDb;

pub fn cmd_init_db(config_path: Option<&Path>, db_path: Option<PathBuf>) -> Result<()> {
    let config = CinderConfig::load(config_path)?.with_cli_args(None, db_path);
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    ActionsDb::new(&config.db_path)?;
    println!("Actions database initialized at {}", config.db_path.display());
    Ok(())
}
