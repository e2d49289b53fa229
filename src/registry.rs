//! RunnerRegistry: registration, credentials, liveness and label matching.

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::ActionsSettings;
use crate::errors::{ActionsError, ActionsResult};
use crate::models::{Runner, Scope};
use crate::store::{ActionsDb, DbHandle, NewRunner, normalize_labels};
use crate::token::{self, SaltedToken};

/// A runner as shown to operators, with liveness derived at read time.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerView {
    #[serde(flatten)]
    pub runner: Runner,
    pub online: bool,
    pub busy: bool,
}

/// What a runner gets back from `Register`. The token is shown only here.
#[derive(Debug, Clone, Serialize)]
pub struct Registered {
    pub runner: Runner,
    pub token: String,
}

#[derive(Clone)]
pub struct RunnerRegistry {
    db: DbHandle,
    settings: ActionsSettings,
}

impl RunnerRegistry {
    pub fn new(db: DbHandle, settings: ActionsSettings) -> Self {
        Self { db, settings }
    }

    /// Mint a registration token for `scope`, retiring older ones.
    pub async fn create_registration_token(&self, scope: Scope) -> ActionsResult<String> {
        let secret = token::random_hex(20);
        let digest = token::digest(&secret);
        self.db
            .call(move |db| Ok::<_, ActionsError>(db.insert_registration_token(&digest, scope)?))
            .await?;
        info!(scope = %scope, "Created runner registration token");
        Ok(secret)
    }

    /// Trade a registration token for a runner identity. The token is
    /// single-use and the runner inherits its scope.
    pub async fn register(
        &self,
        registration_token: String,
        name: String,
        version: String,
        labels: Vec<String>,
        ephemeral: bool,
    ) -> ActionsResult<Registered> {
        let digest = token::digest(&registration_token);
        let registered = self
            .db
            .call(move |db| {
                db.transaction(|db| {
                    let reg = db
                        .find_registration_token(&digest)?
                        .filter(|t| t.is_active)
                        .ok_or(ActionsError::InvalidRegistrationToken)?;
                    if !db.deactivate_registration_token(reg.id)? {
                        return Err(ActionsError::InvalidRegistrationToken);
                    }

                    let secret = SaltedToken::generate();
                    let uuid = Uuid::new_v4().to_string();
                    let new = NewRunner {
                        name,
                        scope: Scope {
                            owner_id: reg.owner_id,
                            repo_id: reg.repo_id,
                        },
                        version,
                        labels,
                        ephemeral,
                    };
                    let id = db.insert_runner(&uuid, &new, &secret)?;
                    db.touch_runner(id, false)?;
                    let runner = db
                        .get_runner(id)?
                        .ok_or_else(|| ActionsError::not_found("runner", id))?;
                    Ok(Registered {
                        runner,
                        token: secret.token,
                    })
                })
            })
            .await?;
        info!(
            runner = %registered.runner.uuid,
            name = %registered.runner.name,
            scope = %registered.runner.scope(),
            ephemeral = registered.runner.ephemeral,
            "Registered runner"
        );
        Ok(registered)
    }

    /// Verify runner credentials and record that the runner was seen.
    pub async fn authenticate(&self, uuid: String, secret: String) -> ActionsResult<Runner> {
        self.db
            .call(move |db| authenticate(db, &uuid, &secret))
            .await
    }

    /// Replace the runner's label set and version string.
    pub async fn declare(
        &self,
        runner: &Runner,
        version: String,
        labels: Vec<String>,
    ) -> ActionsResult<Runner> {
        let id = runner.id;
        self.db
            .call(move |db| {
                db.update_runner_declaration(id, &version, &labels)?;
                db.get_runner(id)?
                    .ok_or_else(|| ActionsError::not_found("runner", id))
            })
            .await
    }

    pub async fn list(&self) -> ActionsResult<Vec<RunnerView>> {
        let offline_after = self.settings.runner_offline_after;
        let runners = self
            .db
            .call(|db| Ok::<_, ActionsError>(db.list_runners()?))
            .await?;
        let now = Utc::now();
        Ok(runners
            .into_iter()
            .map(|runner| RunnerView {
                online: runner.is_online(now, offline_after),
                busy: runner.is_busy(),
                runner,
            })
            .collect())
    }

    /// Idle, online runners that may run a job of `repo_id`/`owner_id`
    /// requiring `labels`. Same filter the task claim applies, seen from
    /// the job's side.
    pub async fn match_candidates(
        &self,
        owner_id: i64,
        repo_id: i64,
        labels: Vec<String>,
    ) -> ActionsResult<Vec<Runner>> {
        let required = normalize_labels(&labels);
        let now = Utc::now();
        let offline_after = self.settings.runner_offline_after;
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|v| v.runner)
            .filter(|r| {
                !r.is_busy()
                    && r.is_online(now, offline_after)
                    && r.scope().can_run(owner_id, repo_id)
                    && required.iter().all(|l| r.labels.contains(l))
            })
            .collect())
    }

    pub async fn delete(&self, runner_id: i64) -> ActionsResult<()> {
        let deleted = self
            .db
            .call(move |db| Ok::<_, ActionsError>(db.delete_runner(runner_id)?))
            .await?;
        if !deleted {
            return Err(ActionsError::not_found("runner", runner_id));
        }
        info!(runner_id, "Deleted runner");
        Ok(())
    }
}

/// Credential check shared by every runner-authenticated call.
pub(crate) fn authenticate(db: &ActionsDb, uuid: &str, secret: &str) -> ActionsResult<Runner> {
    let creds = db
        .runner_credentials(uuid)?
        .ok_or_else(|| ActionsError::RunnerRemoved {
            uuid: uuid.to_string(),
        })?;
    if !token::verify(secret, &creds.token_salt, &creds.token_hash) {
        return Err(ActionsError::Unauthenticated(
            "runner token mismatch".to_string(),
        ));
    }
    db.touch_runner(creds.runner.id, creds.runner.is_busy())?;
    Ok(creds.runner)
}
