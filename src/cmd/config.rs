//! Configuration view and validation commands — `cinder config`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use cinder::config::{CinderConfig, CinderToml};

use super::super::ConfigCommands;

const DEFAULT_CONFIG: &str = "cinder.toml";

pub fn cmd_config(config_path: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => show(config_path),
        Some(ConfigCommands::Validate) => validate(config_path),
        Some(ConfigCommands::Init) => init(config_path),
    }
}

fn show(config_path: Option<&Path>) -> Result<()> {
    let config = CinderConfig::load(config_path)?;
    println!();
    println!("Cinder Configuration");
    println!("====================");
    println!();
    match &config.source {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("No config file found, using defaults"),
    }
    println!();

    println!("[server]");
    println!("  listen = \"{}\"", config.listen);
    println!("  cors = {}", config.cors);
    println!();
    println!("[store]");
    println!("  db_path = \"{}\"", config.db_path.display());
    println!("  log_dir = \"{}\"", config.log_dir.display());
    println!();

    let a = &config.actions;
    println!("[actions]");
    println!("  long_poll_timeout = {:?}", a.long_poll_timeout);
    println!("  schedule_tick = {:?}", a.schedule_tick);
    println!("  reaper_interval = {:?}", a.reaper_interval);
    println!("  runner_offline_after = {:?}", a.runner_offline_after);
    println!("  zombie_task_timeout = {:?}", a.zombie_task_timeout);
    println!("  endless_task_timeout = {:?}", a.endless_task_timeout);
    println!("  abandoned_job_timeout = {:?}", a.abandoned_job_timeout);
    println!("  log_compression = \"{}\"", a.log_compression);
    println!("  log_retention_days = {}", a.log_retention.as_secs() / 86_400);
    println!("  skip_workflow_strings = {:?}", a.skip_workflow_strings);
    println!();
    Ok(())
}

fn validate(config_path: Option<&Path>) -> Result<()> {
    let config = CinderConfig::load(config_path)?;
    let mut warnings = Vec::new();

    let a = &config.actions;
    if a.long_poll_timeout >= a.zombie_task_timeout {
        warnings.push(
            "long_poll_timeout is not shorter than zombie_task_timeout; idle leases may expire mid-poll"
                .to_string(),
        );
    }
    if a.runner_offline_after < a.long_poll_timeout {
        warnings.push(
            "runner_offline_after is shorter than long_poll_timeout; polling runners may show offline"
                .to_string(),
        );
    }
    if config.listen.parse::<std::net::SocketAddr>().is_err() {
        warnings.push(format!("listen address '{}' is not an ip:port pair", config.listen));
    }

    match &config.source {
        Some(path) => println!("Configuration OK: {}", path.display()),
        None => println!("Configuration OK: built-in defaults"),
    }
    for warning in &warnings {
        println!("  warning: {}", warning);
    }
    Ok(())
}

fn init(config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let content = toml::to_string_pretty(&CinderToml::default())
        .context("Failed to render default configuration")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
