//! Runner RPC and operator API server — `cinder serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use cinder::config::CinderConfig;

pub async fn cmd_serve(
    config_path: Option<&Path>,
    listen: Option<String>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    let config = CinderConfig::load(config_path)?.with_cli_args(listen, db_path);
    if let Some(source) = &config.source {
        tracing::info!(config = %source.display(), "Loaded configuration");
    }
    cinder::server::start_server(config).await
}
