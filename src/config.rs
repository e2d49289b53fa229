//! Configuration for the cinder server, read from `cinder.toml`.
//!
//! Layered the usual way: built-in defaults, then the TOML file, then
//! environment variables (`CINDER_LISTEN`, `CINDER_DB`, `CINDER_LOG_DIR`),
//! then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:3142"
//! cors = false
//!
//! [store]
//! db_path = ".cinder/actions.db"
//! log_dir = ".cinder/logs"
//!
//! [actions]
//! long_poll_timeout = "30s"
//! schedule_tick = "1m"
//! reaper_interval = "1m"
//! runner_offline_after = "1m"
//! zombie_task_timeout = "10m"
//! endless_task_timeout = "3h"
//! abandoned_job_timeout = "24h"
//! log_compression = "zstd"
//! log_retention_days = 365
//! skip_workflow_strings = ["[skip ci]", "[ci skip]"]
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ── File format ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CinderToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub actions: ActionsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Permissive CORS for browser-based operator tooling.
    #[serde(default)]
    pub cors: bool,
}

fn default_listen() -> String {
    "127.0.0.1:3142".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".cinder/actions.db")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".cinder/logs")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_dir: default_log_dir(),
        }
    }
}

/// Log blob compression applied when a task's log is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCompression {
    #[default]
    Zstd,
    None,
}

impl std::fmt::Display for LogCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogCompression::Zstd => write!(f, "zstd"),
            LogCompression::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for LogCompression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zstd" => Ok(LogCompression::Zstd),
            "none" | "" => Ok(LogCompression::None),
            _ => bail!("Invalid log compression '{}'. Valid values: zstd, none", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsSection {
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout: String,
    #[serde(default = "default_schedule_tick")]
    pub schedule_tick: String,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval: String,
    #[serde(default = "default_runner_offline_after")]
    pub runner_offline_after: String,
    #[serde(default = "default_zombie_task_timeout")]
    pub zombie_task_timeout: String,
    #[serde(default = "default_endless_task_timeout")]
    pub endless_task_timeout: String,
    #[serde(default = "default_abandoned_job_timeout")]
    pub abandoned_job_timeout: String,
    #[serde(default)]
    pub log_compression: LogCompression,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
    #[serde(default = "default_skip_workflow_strings")]
    pub skip_workflow_strings: Vec<String>,
}

fn default_long_poll_timeout() -> String {
    "30s".to_string()
}

fn default_schedule_tick() -> String {
    "1m".to_string()
}

fn default_reaper_interval() -> String {
    "1m".to_string()
}

fn default_runner_offline_after() -> String {
    "1m".to_string()
}

fn default_zombie_task_timeout() -> String {
    "10m".to_string()
}

fn default_endless_task_timeout() -> String {
    "3h".to_string()
}

fn default_abandoned_job_timeout() -> String {
    "24h".to_string()
}

fn default_log_retention_days() -> u32 {
    365
}

fn default_skip_workflow_strings() -> Vec<String> {
    ["[skip ci]", "[ci skip]", "[no ci]", "[skip actions]", "[actions skip]"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ActionsSection {
    fn default() -> Self {
        Self {
            long_poll_timeout: default_long_poll_timeout(),
            schedule_tick: default_schedule_tick(),
            reaper_interval: default_reaper_interval(),
            runner_offline_after: default_runner_offline_after(),
            zombie_task_timeout: default_zombie_task_timeout(),
            endless_task_timeout: default_endless_task_timeout(),
            abandoned_job_timeout: default_abandoned_job_timeout(),
            log_compression: LogCompression::default(),
            log_retention_days: default_log_retention_days(),
            skip_workflow_strings: default_skip_workflow_strings(),
        }
    }
}

impl ActionsSection {
    /// Parse every duration string into the runtime settings.
    pub fn resolve(&self) -> Result<ActionsSettings> {
        let field = |name: &str, value: &str| -> Result<Duration> {
            let d = parse_duration(value).with_context(|| format!("[actions] {}", name))?;
            if d.is_zero() {
                bail!("[actions] {} must be greater than zero", name);
            }
            Ok(d)
        };
        Ok(ActionsSettings {
            long_poll_timeout: field("long_poll_timeout", &self.long_poll_timeout)?,
            schedule_tick: field("schedule_tick", &self.schedule_tick)?,
            reaper_interval: field("reaper_interval", &self.reaper_interval)?,
            runner_offline_after: field("runner_offline_after", &self.runner_offline_after)?,
            zombie_task_timeout: field("zombie_task_timeout", &self.zombie_task_timeout)?,
            endless_task_timeout: field("endless_task_timeout", &self.endless_task_timeout)?,
            abandoned_job_timeout: field("abandoned_job_timeout", &self.abandoned_job_timeout)?,
            log_compression: self.log_compression,
            log_retention: Duration::from_secs(u64::from(self.log_retention_days) * 86_400),
            skip_workflow_strings: self.skip_workflow_strings.clone(),
        })
    }
}

impl CinderToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid cinder.toml")
    }
}

// ── Runtime settings ──────────────────────────────────────────────────

/// Resolved `[actions]` settings shared by the scheduler components.
#[derive(Debug, Clone)]
pub struct ActionsSettings {
    pub long_poll_timeout: Duration,
    pub schedule_tick: Duration,
    pub reaper_interval: Duration,
    pub runner_offline_after: Duration,
    /// Lease TTL: a task whose runner stops renewing it is failed after this.
    pub zombie_task_timeout: Duration,
    pub endless_task_timeout: Duration,
    pub abandoned_job_timeout: Duration,
    pub log_compression: LogCompression,
    pub log_retention: Duration,
    pub skip_workflow_strings: Vec<String>,
}

impl Default for ActionsSettings {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(30),
            schedule_tick: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(60),
            runner_offline_after: Duration::from_secs(60),
            zombie_task_timeout: Duration::from_secs(10 * 60),
            endless_task_timeout: Duration::from_secs(3 * 3600),
            abandoned_job_timeout: Duration::from_secs(24 * 3600),
            log_compression: LogCompression::Zstd,
            log_retention: Duration::from_secs(365 * 86_400),
            skip_workflow_strings: default_skip_workflow_strings(),
        }
    }
}

impl ActionsSettings {
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    pub fn with_zombie_task_timeout(mut self, timeout: Duration) -> Self {
        self.zombie_task_timeout = timeout;
        self
    }

    pub fn with_log_compression(mut self, compression: LogCompression) -> Self {
        self.log_compression = compression;
        self
    }
}

/// Fully layered configuration used by `cinder serve`.
#[derive(Debug, Clone)]
pub struct CinderConfig {
    pub listen: String,
    pub cors: bool,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub actions: ActionsSettings,
    pub source: Option<PathBuf>,
}

impl CinderConfig {
    /// Load defaults, then `path` (if given and present), then env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (toml, source) = match path {
            Some(p) if p.exists() => (CinderToml::load(p)?, Some(p.to_path_buf())),
            Some(p) => bail!("Config file not found: {}", p.display()),
            None => {
                let default_path = Path::new("cinder.toml");
                if default_path.exists() {
                    (CinderToml::load(default_path)?, Some(default_path.to_path_buf()))
                } else {
                    (CinderToml::default(), None)
                }
            }
        };
        let mut config = Self::from_toml(&toml)?;
        config.source = source;
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(toml: &CinderToml) -> Result<Self> {
        Ok(Self {
            listen: toml.server.listen.clone(),
            cors: toml.server.cors,
            db_path: toml.store.db_path.clone(),
            log_dir: toml.store.log_dir.clone(),
            actions: toml.actions.resolve()?,
            source: None,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var("CINDER_LISTEN") {
            self.listen = listen;
        }
        if let Ok(db) = std::env::var("CINDER_DB") {
            self.db_path = PathBuf::from(db);
        }
        if let Ok(dir) = std::env::var("CINDER_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
    }

    /// CLI flags win over everything else.
    pub fn with_cli_args(mut self, listen: Option<String>, db_path: Option<PathBuf>) -> Self {
        if let Some(listen) = listen {
            self.listen = listen;
        }
        if let Some(db_path) = db_path {
            self.db_path = db_path;
        }
        self
    }
}

// ── Durations ─────────────────────────────────────────────────────────

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)(ms|s|m|h|d)").expect("static regex"))
}

/// Parse a human duration such as `"30s"`, `"10m"` or `"1h30m"`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        bail!("Empty duration");
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in duration_re().captures_iter(&compact) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let n: u64 = caps[1]
            .parse()
            .with_context(|| format!("Invalid number in duration '{}'", input))?;
        total += match &caps[2] {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n * 60),
            "h" => Duration::from_secs(n * 3600),
            _ => Duration::from_secs(n * 86_400),
        };
        consumed += whole.len();
    }

    if consumed != compact.len() {
        bail!("Invalid duration '{}'. Expected forms like 30s, 10m, 1h30m", input);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("3h").unwrap(), Duration::from_secs(10_800));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten minutes").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("10").is_err());
    }

    #[test]
    fn test_defaults_resolve() {
        let settings = ActionsSection::default().resolve().unwrap();
        assert_eq!(settings.zombie_task_timeout, Duration::from_secs(600));
        assert_eq!(settings.endless_task_timeout, Duration::from_secs(3 * 3600));
        assert_eq!(settings.abandoned_job_timeout, Duration::from_secs(24 * 3600));
        assert_eq!(settings.log_compression, LogCompression::Zstd);
        assert_eq!(settings.skip_workflow_strings.len(), 5);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = CinderToml::parse(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [actions]
            long_poll_timeout = "5s"
            log_compression = "none"
            "#,
        )
        .unwrap();
        assert_eq!(toml.server.listen, "0.0.0.0:9000");
        assert_eq!(toml.store.db_path, PathBuf::from(".cinder/actions.db"));

        let config = CinderConfig::from_toml(&toml).unwrap();
        assert_eq!(config.actions.long_poll_timeout, Duration::from_secs(5));
        assert_eq!(config.actions.log_compression, LogCompression::None);
        assert_eq!(config.actions.zombie_task_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_unknown_compression_is_rejected() {
        let result = CinderToml::parse("[actions]\nlog_compression = \"gzip\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_duration_is_rejected() {
        let toml = CinderToml::parse("[actions]\nschedule_tick = \"0s\"\n").unwrap();
        let err = CinderConfig::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("schedule_tick"));
    }

    #[test]
    fn test_cli_args_override() {
        let config = CinderConfig::from_toml(&CinderToml::default())
            .unwrap()
            .with_cli_args(Some("127.0.0.1:1".to_string()), Some(PathBuf::from("x.db")));
        assert_eq!(config.listen, "127.0.0.1:1");
        assert_eq!(config.db_path, PathBuf::from("x.db"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.toml");
        std::fs::write(&path, "[store]\nlog_dir = \"/var/cinder/logs\"\n").unwrap();
        let config = CinderConfig::load(Some(&path)).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/var/cinder/logs"));
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = CinderConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(result.is_err());
    }
}
