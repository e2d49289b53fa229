//! The assembled Actions core.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ActionsSettings, CinderConfig};
use crate::dispatch::{EventDispatcher, GitSource};
use crate::lease::TaskLeaseProtocol;
use crate::reaper::Reaper;
use crate::registry::RunnerRegistry;
use crate::rerun::RerunController;
use crate::scheduler::{JobScheduler, StatusSink, VersionNotifier};
use crate::store::{ActionsDb, DbHandle, LogStore};
use crate::ticker::ScheduleTicker;

/// Every component wired to one database, log store and git source.
#[derive(Clone)]
pub struct ActionsService {
    pub settings: ActionsSettings,
    pub scheduler: JobScheduler,
    pub registry: RunnerRegistry,
    pub lease: TaskLeaseProtocol,
    pub dispatcher: EventDispatcher,
    pub rerun: RerunController,
    pub ticker: ScheduleTicker,
    pub reaper: Reaper,
}

impl ActionsService {
    pub fn new(
        settings: ActionsSettings,
        db: DbHandle,
        logs: LogStore,
        git: Arc<dyn GitSource>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let scheduler = JobScheduler::new(db.clone(), logs, VersionNotifier::new(), sink);
        let dispatcher = EventDispatcher::new(scheduler.clone(), git, settings.clone());
        Self {
            registry: RunnerRegistry::new(db, settings.clone()),
            lease: TaskLeaseProtocol::new(scheduler.clone(), settings.clone()),
            rerun: RerunController::new(scheduler.clone()),
            ticker: ScheduleTicker::new(dispatcher.clone()),
            reaper: Reaper::new(scheduler.clone(), settings.clone()),
            dispatcher,
            scheduler,
            settings,
        }
    }

    /// Open the on-disk database and log directory named by `config`.
    pub fn open(
        config: &CinderConfig,
        git: Arc<dyn GitSource>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory: {}", config.log_dir.display())
        })?;
        let db = ActionsDb::new(&config.db_path).context("Failed to initialize actions database")?;
        let logs = LogStore::new(&config.log_dir, config.actions.log_compression);
        Ok(Self::new(
            config.actions.clone(),
            DbHandle::new(db),
            logs,
            git,
            sink,
        ))
    }

    /// Start the schedule ticker and the reaper.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.ticker.clone().run(shutdown.clone())),
            tokio::spawn(self.reaper.clone().run(shutdown)),
        ]
    }
}
