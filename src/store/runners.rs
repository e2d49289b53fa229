//! Runner and registration-token rows.

use anyhow::{Context, Result};
use rusqlite::{Row, params};

use super::db::{ActionsDb, optional};
use crate::models::*;
use crate::token::SaltedToken;

/// Fields a runner supplies when it registers.
#[derive(Debug, Clone)]
pub struct NewRunner {
    pub name: String,
    pub scope: Scope,
    pub version: String,
    pub labels: Vec<String>,
    pub ephemeral: bool,
}

/// A runner together with the stored hash of its credential.
pub struct RunnerCredentials {
    pub runner: Runner,
    pub token_salt: String,
    pub token_hash: String,
}

const RUNNER_COLUMNS: &str = "r.id, r.uuid, r.name, r.owner_id, r.repo_id, r.version, r.labels,
    r.ephemeral, r.task_id, r.token_last_eight, r.last_online, r.last_active, r.created_at,
    r.token_salt, r.token_hash";

struct RunnerRow {
    id: i64,
    uuid: String,
    name: String,
    owner_id: i64,
    repo_id: i64,
    version: String,
    labels: String,
    ephemeral: bool,
    task_id: Option<i64>,
    token_last_eight: String,
    last_online: Option<String>,
    last_active: Option<String>,
    created_at: String,
    token_salt: String,
    token_hash: String,
}

impl RunnerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uuid: row.get(1)?,
            name: row.get(2)?,
            owner_id: row.get(3)?,
            repo_id: row.get(4)?,
            version: row.get(5)?,
            labels: row.get(6)?,
            ephemeral: row.get(7)?,
            task_id: row.get(8)?,
            token_last_eight: row.get(9)?,
            last_online: row.get(10)?,
            last_active: row.get(11)?,
            created_at: row.get(12)?,
            token_salt: row.get(13)?,
            token_hash: row.get(14)?,
        })
    }

    fn into_credentials(self) -> Result<RunnerCredentials> {
        let labels: Vec<String> =
            serde_json::from_str(&self.labels).context("Failed to parse runner labels JSON")?;
        Ok(RunnerCredentials {
            runner: Runner {
                id: self.id,
                uuid: self.uuid,
                name: self.name,
                owner_id: self.owner_id,
                repo_id: self.repo_id,
                version: self.version,
                labels,
                ephemeral: self.ephemeral,
                task_id: self.task_id,
                token_last_eight: self.token_last_eight,
                last_online: self.last_online,
                last_active: self.last_active,
                created_at: self.created_at,
            },
            token_salt: self.token_salt,
            token_hash: self.token_hash,
        })
    }
}

/// Labels are matched case-insensitively, so they are stored lowercased
/// and deduplicated.
pub fn normalize_labels(labels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = labels
        .iter()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

impl ActionsDb {
    // ── Registration tokens ───────────────────────────────────────────

    /// Store a new registration token for `scope`, retiring older ones.
    pub fn insert_registration_token(&self, digest: &str, scope: Scope) -> Result<i64> {
        self.conn
            .execute(
                "UPDATE runner_tokens SET is_active = 0 WHERE owner_id = ?1 AND repo_id = ?2",
                params![scope.owner_id, scope.repo_id],
            )
            .context("Failed to retire registration tokens")?;
        self.conn
            .execute(
                "INSERT INTO runner_tokens (token_digest, owner_id, repo_id, is_active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![digest, scope.owner_id, scope.repo_id, now_ts()],
            )
            .context("Failed to insert registration token")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_registration_token(&self, digest: &str) -> Result<Option<RegistrationToken>> {
        optional(self.conn.query_row(
            "SELECT id, owner_id, repo_id, is_active, created_at FROM runner_tokens
             WHERE token_digest = ?1",
            params![digest],
            |row| {
                Ok(RegistrationToken {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    repo_id: row.get(2)?,
                    is_active: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        ))
        .context("Failed to query registration token")
    }

    /// Consume a registration token. Returns false if it was already used.
    pub fn deactivate_registration_token(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE runner_tokens SET is_active = 0 WHERE id = ?1 AND is_active = 1",
                params![id],
            )
            .context("Failed to deactivate registration token")?;
        Ok(n == 1)
    }

    // ── Runners ───────────────────────────────────────────────────────

    pub fn insert_runner(
        &self,
        uuid: &str,
        runner: &NewRunner,
        token: &SaltedToken,
    ) -> Result<i64> {
        let labels = serde_json::to_string(&normalize_labels(&runner.labels))
            .context("Failed to encode runner labels")?;
        self.conn
            .execute(
                "INSERT INTO runners (uuid, name, owner_id, repo_id, version, labels, ephemeral,
                    token_hash, token_salt, token_last_eight, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    uuid,
                    runner.name,
                    runner.scope.owner_id,
                    runner.scope.repo_id,
                    runner.version,
                    labels,
                    runner.ephemeral,
                    token.hash,
                    token.salt,
                    token.last_eight,
                    now_ts(),
                ],
            )
            .context("Failed to insert runner")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn runner_credentials(&self, uuid: &str) -> Result<Option<RunnerCredentials>> {
        let row = optional(self.conn.query_row(
            &format!("SELECT {} FROM runners r WHERE r.uuid = ?1", RUNNER_COLUMNS),
            params![uuid],
            RunnerRow::from_row,
        ))
        .context("Failed to query runner")?;
        row.map(RunnerRow::into_credentials).transpose()
    }

    pub fn get_runner(&self, id: i64) -> Result<Option<Runner>> {
        let row = optional(self.conn.query_row(
            &format!("SELECT {} FROM runners r WHERE r.id = ?1", RUNNER_COLUMNS),
            params![id],
            RunnerRow::from_row,
        ))
        .context("Failed to query runner")?;
        Ok(row.map(RunnerRow::into_credentials).transpose()?.map(|c| c.runner))
    }

    pub fn list_runners(&self) -> Result<Vec<Runner>> {
        self.query_runners(
            &format!("SELECT {} FROM runners r ORDER BY r.id", RUNNER_COLUMNS),
            [],
        )
    }

    /// Runners pointing at a task that is terminal or no longer exists.
    pub fn runners_with_finished_tasks(&self) -> Result<Vec<Runner>> {
        self.query_runners(
            &format!(
                "SELECT {} FROM runners r LEFT JOIN tasks t ON t.id = r.task_id
                 WHERE r.task_id IS NOT NULL
                 AND (t.id IS NULL OR t.status NOT IN ('waiting', 'assigned', 'running'))
                 ORDER BY r.id",
                RUNNER_COLUMNS
            ),
            [],
        )
    }

    /// Runners that have not checked in since `cutoff`.
    pub fn runners_offline_since(&self, cutoff: &str) -> Result<Vec<Runner>> {
        self.query_runners(
            &format!(
                "SELECT {} FROM runners r
                 WHERE r.last_online IS NOT NULL AND r.last_online < ?1 ORDER BY r.id",
                RUNNER_COLUMNS
            ),
            params![cutoff],
        )
    }

    fn query_runners(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Runner>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare runner query")?;
        let rows = stmt
            .query_map(params, RunnerRow::from_row)
            .context("Failed to query runners")?;
        let mut runners = Vec::new();
        for row in rows {
            runners.push(row.context("Failed to read runner row")?.into_credentials()?.runner);
        }
        Ok(runners)
    }

    pub fn update_runner_declaration(
        &self,
        id: i64,
        version: &str,
        labels: &[String],
    ) -> Result<()> {
        let labels = serde_json::to_string(&normalize_labels(labels))
            .context("Failed to encode runner labels")?;
        self.conn
            .execute(
                "UPDATE runners SET version = ?1, labels = ?2 WHERE id = ?3",
                params![version, labels, id],
            )
            .context("Failed to update runner declaration")?;
        Ok(())
    }

    /// Stamp `last_online`, and `last_active` too when the runner is working.
    pub fn touch_runner(&self, id: i64, active: bool) -> Result<()> {
        let now = now_ts();
        let sql = if active {
            "UPDATE runners SET last_online = ?1, last_active = ?1 WHERE id = ?2"
        } else {
            "UPDATE runners SET last_online = ?1 WHERE id = ?2"
        };
        self.conn
            .execute(sql, params![now, id])
            .context("Failed to touch runner")?;
        Ok(())
    }

    /// Bind a task to an idle runner. Fails when the runner already holds one.
    pub fn bind_runner_task(&self, id: i64, task_id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE runners SET task_id = ?1, last_active = ?2 WHERE id = ?3 AND task_id IS NULL",
                params![task_id, now_ts(), id],
            )
            .context("Failed to bind runner task")?;
        Ok(n == 1)
    }

    pub fn clear_runner_task(&self, id: i64) -> Result<()> {
        self.conn
            .execute("UPDATE runners SET task_id = NULL WHERE id = ?1", params![id])
            .context("Failed to clear runner task")?;
        Ok(())
    }

    /// Delete the runners registered to a repository. Returns their UUIDs.
    pub fn delete_runners_for_repo(&self, repo_id: i64) -> Result<Vec<String>> {
        self.delete_runners_where("repo_id", repo_id)
    }

    /// Delete owner-scoped runners. Runners registered to one of the
    /// owner's repositories carry `owner_id = 0` and are not touched.
    pub fn delete_runners_for_owner(&self, owner_id: i64) -> Result<Vec<String>> {
        self.delete_runners_where("owner_id", owner_id)
    }

    fn delete_runners_where(&self, column: &str, id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("DELETE FROM runners WHERE {} = ?1 RETURNING uuid", column))
            .context("Failed to prepare runner delete")?;
        let rows = stmt
            .query_map(params![id], |row| row.get(0))
            .context("Failed to delete runners")?;
        let mut uuids = Vec::new();
        for row in rows {
            uuids.push(row.context("Failed to read deleted runner")?);
        }
        Ok(uuids)
    }

    pub fn delete_runner(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM runners WHERE id = ?1", params![id])
            .context("Failed to delete runner")?;
        Ok(n > 0)
    }
}
