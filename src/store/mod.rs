//! RunStore: durable state for runs, jobs, tasks, runners and schedules.
//!
//! SQLite holds every row; `ActionsDb` methods are synchronous and are
//! grouped by entity across the submodules. Async callers go through
//! `DbHandle`. Task logs live next to the database in a `LogStore`.

mod db;
pub mod logs;
pub mod runners;
pub mod runs;
pub mod schedules;
pub mod tasks;

pub use db::{ActionsDb, DbHandle};
pub use logs::LogStore;
pub use runners::{NewRunner, RunnerCredentials, normalize_labels};
pub use runs::{NewJob, NewRun};
pub use schedules::NewSchedule;
