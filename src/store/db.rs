use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::models::Scope;

/// Async-safe handle to the Actions database.
///
/// Wraps `ActionsDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ActionsDb>>,
}

impl DbHandle {
    pub fn new(db: ActionsDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&ActionsDb) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used for startup
    /// initialization and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ActionsDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct ActionsDb {
    pub(crate) conn: Connection,
}

impl ActionsDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS run_index (
                    repo_id INTEGER PRIMARY KEY,
                    max_index INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL,
                    owner_id INTEGER NOT NULL,
                    workflow_id TEXT NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    event TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    ref_name TEXT NOT NULL,
                    trigger_user TEXT NOT NULL DEFAULT '',
                    run_number INTEGER NOT NULL,
                    attempt INTEGER NOT NULL DEFAULT 1,
                    status TEXT NOT NULL DEFAULT 'running',
                    concurrency_group TEXT,
                    needs_approval INTEGER NOT NULL DEFAULT 0,
                    approved_by TEXT,
                    is_fork_pull_request INTEGER NOT NULL DEFAULT 0,
                    inputs TEXT NOT NULL DEFAULT '{}',
                    started_at TEXT,
                    stopped_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (repo_id, run_number)
                );
                CREATE INDEX IF NOT EXISTS idx_runs_repo_status ON runs(repo_id, status);

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    repo_id INTEGER NOT NULL,
                    owner_id INTEGER NOT NULL,
                    commit_sha TEXT NOT NULL,
                    name TEXT NOT NULL,
                    job_key TEXT NOT NULL,
                    base_key TEXT NOT NULL,
                    needs TEXT NOT NULL DEFAULT '[]',
                    runs_on TEXT NOT NULL DEFAULT '[]',
                    matrix TEXT NOT NULL DEFAULT '{}',
                    if_expr TEXT,
                    runs_regardless INTEGER NOT NULL DEFAULT 0,
                    depth INTEGER NOT NULL DEFAULT 0,
                    pending_needs INTEGER NOT NULL DEFAULT 0,
                    failed_needs INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'blocked',
                    skip_cause TEXT,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    task_id INTEGER,
                    payload TEXT NOT NULL DEFAULT '{}',
                    queued_at TEXT,
                    started_at TEXT,
                    stopped_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (run_id, job_key)
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_waiting ON jobs(status, queued_at);

                CREATE TABLE IF NOT EXISTS job_needs (
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    need_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    PRIMARY KEY (job_id, need_id)
                );
                CREATE INDEX IF NOT EXISTS idx_job_needs_reverse ON job_needs(need_id);

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    run_id INTEGER NOT NULL,
                    repo_id INTEGER NOT NULL,
                    owner_id INTEGER NOT NULL,
                    runner_id INTEGER,
                    attempt INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    token_hash TEXT NOT NULL UNIQUE,
                    token_salt TEXT NOT NULL,
                    token_last_eight TEXT NOT NULL,
                    log_index INTEGER NOT NULL DEFAULT 0,
                    log_length INTEGER NOT NULL DEFAULT 0,
                    log_in_storage INTEGER NOT NULL DEFAULT 0,
                    log_expired INTEGER NOT NULL DEFAULT 0,
                    lease_expires_at TEXT,
                    steps TEXT NOT NULL DEFAULT '[]',
                    started_at TEXT,
                    stopped_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_one_active_per_job
                    ON tasks(job_id) WHERE status IN ('waiting', 'assigned', 'running');
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

                CREATE TABLE IF NOT EXISTS task_outputs (
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (task_id, key)
                );

                CREATE TABLE IF NOT EXISTS runners (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    owner_id INTEGER NOT NULL DEFAULT 0,
                    repo_id INTEGER NOT NULL DEFAULT 0,
                    version TEXT NOT NULL DEFAULT '',
                    labels TEXT NOT NULL DEFAULT '[]',
                    ephemeral INTEGER NOT NULL DEFAULT 0,
                    task_id INTEGER,
                    token_hash TEXT NOT NULL,
                    token_salt TEXT NOT NULL,
                    token_last_eight TEXT NOT NULL,
                    last_online TEXT,
                    last_active TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runner_tokens (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    token_digest TEXT NOT NULL UNIQUE,
                    owner_id INTEGER NOT NULL DEFAULT 0,
                    repo_id INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks_version (
                    owner_id INTEGER NOT NULL,
                    repo_id INTEGER NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (owner_id, repo_id)
                );

                CREATE TABLE IF NOT EXISTS schedules (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL,
                    owner_id INTEGER NOT NULL,
                    workflow_id TEXT NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    ref_name TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    trigger_user TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (repo_id, workflow_id)
                );

                CREATE TABLE IF NOT EXISTS schedule_specs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    schedule_id INTEGER NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
                    repo_id INTEGER NOT NULL,
                    spec TEXT NOT NULL,
                    next_fire TEXT NOT NULL,
                    prev_fire TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_schedule_specs_next ON schedule_specs(next_fire);
                ",
            )
            .context("Failed to create actions tables")?;
        Ok(())
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// Statements issued through `self` while `f` runs join the transaction,
    /// so helpers called from `f` must not open their own.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&Self) -> Result<R, E>) -> Result<R, E>
    where
        E: From<anyhow::Error>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let value = f(self)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(value)
    }

    // ── Tasks version ─────────────────────────────────────────────────

    /// Current long-poll version for a scope (0 when never bumped).
    pub fn tasks_version(&self, scope: Scope) -> Result<i64> {
        let version = self
            .conn
            .query_row(
                "SELECT version FROM tasks_version WHERE owner_id = ?1 AND repo_id = ?2",
                params![scope.owner_id, scope.repo_id],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(0),
                other => Err(other),
            })
            .context("Failed to read tasks version")?;
        Ok(version)
    }

    /// Bump the global, owner and repo versions for a job that just became
    /// `Waiting`. Returns the scopes that moved.
    pub fn bump_tasks_version(&self, owner_id: i64, repo_id: i64) -> Result<Vec<Scope>> {
        let mut scopes = vec![Scope::global()];
        if owner_id > 0 {
            scopes.push(Scope::owner(owner_id));
        }
        if repo_id > 0 {
            scopes.push(Scope::repo(repo_id));
        }
        for scope in &scopes {
            self.conn
                .execute(
                    "INSERT INTO tasks_version (owner_id, repo_id, version) VALUES (?1, ?2, 1)
                     ON CONFLICT(owner_id, repo_id) DO UPDATE SET version = version + 1",
                    params![scope.owner_id, scope.repo_id],
                )
                .context("Failed to bump tasks version")?;
        }
        Ok(scopes)
    }
}

/// Map `QueryReturnedNoRows` to `None`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> rusqlite::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}
