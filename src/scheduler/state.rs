//! Synchronous job state transitions.
//!
//! Every function here runs inside a caller-owned transaction and records
//! what it changed in an `Effects` value; nothing in this module notifies
//! runners or talks to the status sink directly.

use std::collections::{BTreeSet, VecDeque};

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::Effects;
use crate::models::*;
use crate::store::{ActionsDb, NewJob, NewRun};
use crate::workflow::JobGraph;

/// Persist a run and all its jobs. Roots become `Waiting` unless the run
/// is held for approval.
pub(crate) fn insert_run_graph(
    db: &ActionsDb,
    new_run: &NewRun,
    graph: &JobGraph,
    fx: &mut Effects,
) -> Result<Run> {
    let number = db.next_run_number(new_run.repo_id)?;
    let run_id = db.insert_run(new_run, number)?;
    let run = db
        .get_run(run_id)?
        .context("Run vanished right after insert")?;

    let mut ids = Vec::with_capacity(graph.len());
    for (index, node) in graph.nodes().iter().enumerate() {
        let job = NewJob {
            name: node.name.clone(),
            job_key: node.key.clone(),
            base_key: node.base_key.clone(),
            needs: graph.need_keys(index),
            runs_on: node.runs_on.clone(),
            matrix: node.matrix.clone(),
            if_expr: node.if_expr.clone(),
            runs_regardless: node.runs_regardless,
            depth: i64::from(node.depth),
            payload: node.payload.clone(),
        };
        ids.push(db.insert_job(&run, &job)?);
    }
    for (index, &job_id) in ids.iter().enumerate() {
        for &need in graph.needs(index) {
            db.insert_job_need(job_id, ids[need])?;
        }
    }

    info!(
        run_id,
        repo_id = run.repo_id,
        run_number = number,
        jobs = ids.len(),
        "Created run"
    );

    if !run.needs_approval {
        enqueue_roots(db, run_id, fx)?;
    }
    refresh_run(db, run_id, fx)?;
    Ok(run)
}

/// Move every dependency-free `Blocked` job of a run to `Waiting`.
pub(crate) fn enqueue_roots(db: &ActionsDb, run_id: i64, fx: &mut Effects) -> Result<()> {
    for job in db.list_jobs(run_id)? {
        if job.status == JobStatus::Blocked && job.needs.is_empty() {
            enqueue(db, &job, fx)?;
        }
    }
    Ok(())
}

/// `Blocked → Waiting`, waking every runner scope that could see the job.
pub(crate) fn enqueue(db: &ActionsDb, job: &Job, fx: &mut Effects) -> Result<()> {
    if db.mark_job_waiting(job.id)? {
        debug!(job_id = job.id, run_id = job.run_id, job = %job.job_key, "Job waiting");
        fx.woken.extend(db.bump_tasks_version(job.owner_id, job.repo_id)?);
        snapshot_job(db, job.id, fx)?;
    }
    Ok(())
}

/// Drive a job to a terminal status and fan out to everything that needs it.
///
/// Dependents are reached through the reverse-edge index; each one has its
/// pending counter decremented and, when it reaches zero, becomes `Waiting`
/// or (with a failed need and no override) `Skipped`, which fans out in turn.
pub(crate) fn finish_job(
    db: &ActionsDb,
    job_id: i64,
    status: JobStatus,
    cause: Option<SkipCause>,
    fx: &mut Effects,
) -> Result<bool> {
    let mut runs = BTreeSet::new();
    let mut worklist = VecDeque::from([(job_id, status, cause)]);
    let mut finished_first = false;

    while let Some((id, status, cause)) = worklist.pop_front() {
        let Some(job) = db.get_job(id)? else {
            continue;
        };
        if !db.finish_job(id, status, cause)? {
            continue;
        }
        if id == job_id {
            finished_first = true;
        }
        info!(job_id = id, run_id = job.run_id, job = %job.job_key, status = status.as_str(), "Job finished");
        runs.insert(job.run_id);
        snapshot_job(db, id, fx)?;

        let satisfied = match status {
            JobStatus::Succeeded => true,
            JobStatus::Skipped => cause == Some(SkipCause::Condition),
            _ => false,
        };
        for dependent in db.dependents_of(id)? {
            let Some((pending, failed)) = db.resolve_one_need(dependent, !satisfied)? else {
                continue;
            };
            if pending > 0 {
                continue;
            }
            let Some(next) = db.get_job(dependent)? else {
                continue;
            };
            if failed == 0 || next.runs_regardless {
                enqueue(db, &next, fx)?;
            } else {
                debug!(job_id = dependent, job = %next.job_key, "Skipping job with failed needs");
                worklist.push_back((
                    dependent,
                    JobStatus::Skipped,
                    Some(SkipCause::UpstreamFailed),
                ));
            }
        }
    }

    for run_id in runs {
        refresh_run(db, run_id, fx)?;
    }
    Ok(finished_first)
}

/// Cancel one job (and its active task); dependents fan out as for a failure.
pub(crate) fn cancel_job(db: &ActionsDb, job: &Job, fx: &mut Effects) -> Result<bool> {
    if job.status.is_terminal() {
        return Ok(false);
    }
    if let Some(task_id) = job.task_id {
        db.set_task_status(task_id, TaskStatus::Cancelled)?;
    }
    let cancelled = finish_job(db, job.id, JobStatus::Cancelled, None, fx)?;
    release_runners(db, fx)?;
    Ok(cancelled)
}

/// Cancel every non-terminal job of a run. Returns how many were cancelled.
pub(crate) fn cancel_run(db: &ActionsDb, run_id: i64, fx: &mut Effects) -> Result<usize> {
    let mut cancelled = 0;
    for job in db.list_jobs(run_id)? {
        if job.status.is_terminal() {
            continue;
        }
        if let Some(task_id) = job.task_id {
            db.set_task_status(task_id, TaskStatus::Cancelled)?;
        }
        if db.finish_job(job.id, JobStatus::Cancelled, None)? {
            cancelled += 1;
            snapshot_job(db, job.id, fx)?;
        }
    }
    if cancelled > 0 {
        info!(run_id, jobs = cancelled, "Cancelled run");
    }
    refresh_run(db, run_id, fx)?;
    release_runners(db, fx)?;
    Ok(cancelled)
}

/// Record a task's final result. The job follows only while this task is
/// still its current attempt. Returns false when the task was already
/// terminal.
pub(crate) fn complete_task(
    db: &ActionsDb,
    task: &Task,
    result: TaskStatus,
    fx: &mut Effects,
) -> Result<bool> {
    if !db.set_task_status(task.id, result)? {
        return Ok(false);
    }
    info!(task_id = task.id, job_id = task.job_id, result = result.as_str(), "Task finished");

    if let Some(job) = db.get_job(task.job_id)? {
        if job.task_id == Some(task.id) && job.status == JobStatus::Running {
            let cause = (result == TaskStatus::Skipped).then_some(SkipCause::Condition);
            finish_job(db, job.id, result.job_status(), cause, fx)?;
        }
    }
    release_runners(db, fx)?;
    Ok(true)
}

/// Ownership-scoped runner cleanup: a runner whose task is terminal or gone
/// is freed, or deleted when ephemeral.
pub(crate) fn release_runners(db: &ActionsDb, fx: &mut Effects) -> Result<()> {
    for runner in db.runners_with_finished_tasks()? {
        if runner.ephemeral {
            if db.delete_runner(runner.id)? {
                info!(runner = %runner.uuid, name = %runner.name, "Deleted ephemeral runner");
                fx.removed_runners.push(runner.uuid);
            }
        } else {
            db.clear_runner_task(runner.id)?;
        }
    }
    Ok(())
}

pub(crate) fn refresh_run(db: &ActionsDb, run_id: i64, fx: &mut Effects) -> Result<()> {
    if let Some(status) = db.refresh_run_status(run_id)? {
        info!(run_id, status = status.as_str(), "Run status changed");
        if let Some(run) = db.get_run(run_id)? {
            fx.runs.retain(|r| r.id != run_id);
            fx.runs.push(run);
        }
    }
    Ok(())
}

pub(crate) fn snapshot_job(db: &ActionsDb, job_id: i64, fx: &mut Effects) -> Result<()> {
    if let Some(job) = db.get_job(job_id)? {
        fx.jobs.retain(|j| j.id != job_id);
        fx.jobs.push(job);
    }
    Ok(())
}
