//! Cron schedule registrations and their spec rows.

use anyhow::{Context, Result};
use rusqlite::{Row, params};

use super::db::{ActionsDb, optional};
use crate::models::*;

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub repo_id: i64,
    pub owner_id: i64,
    pub workflow_id: String,
    pub title: String,
    pub ref_name: String,
    pub commit_sha: String,
    pub trigger_user: String,
}

const SCHEDULE_COLUMNS: &str = "id, repo_id, owner_id, workflow_id, title, ref_name, commit_sha,
    trigger_user, created_at, updated_at";

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        owner_id: row.get(2)?,
        workflow_id: row.get(3)?,
        title: row.get(4)?,
        ref_name: row.get(5)?,
        commit_sha: row.get(6)?,
        trigger_user: row.get(7)?,
        specs: Vec::new(),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn spec_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleSpec> {
    Ok(ScheduleSpec {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        repo_id: row.get(2)?,
        spec: row.get(3)?,
        next_fire: row.get(4)?,
        prev_fire: row.get(5)?,
    })
}

impl ActionsDb {
    /// Replace the registration for `(repo_id, workflow_id)` with a fresh one.
    /// `specs` pairs each cron expression with its first fire time.
    pub fn replace_schedule(
        &self,
        schedule: &NewSchedule,
        specs: &[(String, String)],
    ) -> Result<i64> {
        self.delete_schedule(schedule.repo_id, &schedule.workflow_id)?;
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO schedules (repo_id, owner_id, workflow_id, title, ref_name, commit_sha,
                    trigger_user, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    schedule.repo_id,
                    schedule.owner_id,
                    schedule.workflow_id,
                    schedule.title,
                    schedule.ref_name,
                    schedule.commit_sha,
                    schedule.trigger_user,
                    now,
                ],
            )
            .context("Failed to insert schedule")?;
        let id = self.conn.last_insert_rowid();
        for (spec, next_fire) in specs {
            self.conn
                .execute(
                    "INSERT INTO schedule_specs (schedule_id, repo_id, spec, next_fire)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, schedule.repo_id, spec, next_fire],
                )
                .context("Failed to insert schedule spec")?;
        }
        Ok(id)
    }

    pub fn delete_schedule(&self, repo_id: i64, workflow_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM schedules WHERE repo_id = ?1 AND workflow_id = ?2",
                params![repo_id, workflow_id],
            )
            .context("Failed to delete schedule")?;
        Ok(n > 0)
    }

    pub fn delete_schedules_for_repo(&self, repo_id: i64) -> Result<usize> {
        self.conn
            .execute("DELETE FROM schedules WHERE repo_id = ?1", params![repo_id])
            .context("Failed to delete repository schedules")
    }

    pub fn delete_schedules_for_owner(&self, owner_id: i64) -> Result<usize> {
        self.conn
            .execute("DELETE FROM schedules WHERE owner_id = ?1", params![owner_id])
            .context("Failed to delete owner schedules")
    }

    pub fn get_schedule(&self, id: i64) -> Result<Option<Schedule>> {
        let schedule = optional(self.conn.query_row(
            &format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS),
            params![id],
            schedule_from_row,
        ))
        .context("Failed to query schedule")?;
        schedule.map(|s| self.with_specs(s)).transpose()
    }

    pub fn list_schedules_for_repo(&self, repo_id: i64) -> Result<Vec<Schedule>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM schedules WHERE repo_id = ?1 ORDER BY workflow_id",
                SCHEDULE_COLUMNS
            ))
            .context("Failed to prepare schedule query")?;
        let rows = stmt
            .query_map(params![repo_id], schedule_from_row)
            .context("Failed to query schedules")?;
        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(self.with_specs(row.context("Failed to read schedule row")?)?);
        }
        Ok(schedules)
    }

    fn with_specs(&self, mut schedule: Schedule) -> Result<Schedule> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, schedule_id, repo_id, spec, next_fire, prev_fire FROM schedule_specs
                 WHERE schedule_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare schedule spec query")?;
        let rows = stmt
            .query_map(params![schedule.id], spec_from_row)
            .context("Failed to query schedule specs")?;
        for row in rows {
            schedule.specs.push(row.context("Failed to read schedule spec")?);
        }
        Ok(schedule)
    }

    /// Specs whose next fire time is at or before `now`.
    pub fn due_schedule_specs(&self, now: &str) -> Result<Vec<ScheduleSpec>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, schedule_id, repo_id, spec, next_fire, prev_fire FROM schedule_specs
                 WHERE next_fire <= ?1 ORDER BY next_fire, id",
            )
            .context("Failed to prepare due spec query")?;
        let rows = stmt
            .query_map(params![now], spec_from_row)
            .context("Failed to query due specs")?;
        let mut specs = Vec::new();
        for row in rows {
            specs.push(row.context("Failed to read schedule spec")?);
        }
        Ok(specs)
    }

    pub fn advance_schedule_spec(&self, id: i64, prev_fire: &str, next_fire: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE schedule_specs SET prev_fire = ?1, next_fire = ?2 WHERE id = ?3",
                params![prev_fire, next_fire, id],
            )
            .context("Failed to advance schedule spec")?;
        Ok(())
    }

    pub fn delete_schedule_spec(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM schedule_specs WHERE id = ?1", params![id])
            .context("Failed to delete schedule spec")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(workflow_id: &str) -> NewSchedule {
        NewSchedule {
            repo_id: 1,
            owner_id: 2,
            workflow_id: workflow_id.to_string(),
            title: "nightly".to_string(),
            ref_name: "refs/heads/main".to_string(),
            commit_sha: "c0ffee".to_string(),
            trigger_user: "alice".to_string(),
        }
    }

    #[test]
    fn test_replace_schedule_swaps_specs() {
        let db = ActionsDb::new_in_memory().unwrap();
        let first = db
            .replace_schedule(
                &schedule("nightly.yml"),
                &[("0 3 * * *".to_string(), "2026-01-01T03:00:00.000Z".to_string())],
            )
            .unwrap();
        let second = db
            .replace_schedule(
                &schedule("nightly.yml"),
                &[
                    ("0 4 * * *".to_string(), "2026-01-01T04:00:00.000Z".to_string()),
                    ("@every 1h".to_string(), "2026-01-01T01:00:00.000Z".to_string()),
                ],
            )
            .unwrap();

        assert!(db.get_schedule(first).unwrap().is_none());
        let got = db.get_schedule(second).unwrap().unwrap();
        assert_eq!(got.specs.len(), 2);
        assert_eq!(db.list_schedules_for_repo(1).unwrap().len(), 1);
    }

    #[test]
    fn test_due_specs_and_advance() {
        let db = ActionsDb::new_in_memory().unwrap();
        db.replace_schedule(
            &schedule("a.yml"),
            &[("* * * * *".to_string(), "2026-01-01T00:01:00.000Z".to_string())],
        )
        .unwrap();

        assert!(db.due_schedule_specs("2026-01-01T00:00:30.000Z").unwrap().is_empty());
        let due = db.due_schedule_specs("2026-01-01T00:01:00.000Z").unwrap();
        assert_eq!(due.len(), 1);

        db.advance_schedule_spec(due[0].id, &due[0].next_fire, "2026-01-01T00:02:00.000Z")
            .unwrap();
        assert!(db.due_schedule_specs("2026-01-01T00:01:30.000Z").unwrap().is_empty());
    }

    #[test]
    fn test_delete_schedules_for_repo() {
        let db = ActionsDb::new_in_memory().unwrap();
        db.replace_schedule(&schedule("a.yml"), &[]).unwrap();
        db.replace_schedule(&schedule("b.yml"), &[]).unwrap();
        assert_eq!(db.delete_schedules_for_repo(1).unwrap(), 2);
        assert!(db.list_schedules_for_repo(1).unwrap().is_empty());
    }
}
