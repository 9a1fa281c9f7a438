use chrono::Utc;
use redjob_job::{millis, progress_percent, Job, JobState};
use serde_json::{json, Value};

use crate::errors::{RedjobError, Result};
use crate::events::{publish, JobEvent};
use crate::store::{to_sortable_token, Store};

/// Stores how far the job got and publishes `progress`. Returns the percentage.
///
/// An active job also gets its heartbeat refreshed, which keeps the stalled loop away.
pub async fn set_progress(
    store: &Store,
    job: &mut Job,
    completed: u64,
    total: u64,
    data: Option<Value>,
) -> Result<u8> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    let now = Utc::now();
    let percent = progress_percent(completed, total);

    job.set_progress(percent);
    job.set_updated_at(Some(now));

    let mut fields = vec![
        ("progress", percent.to_string()),
        ("updated_at", millis(now)),
    ];
    if let Some(data) = &data {
        fields.push(("progress_data", serde_json::to_string(data)?));
        job.set_progress_data(Some(data.clone()));
    }

    update_fields(store, id, &fields).await?;
    touch_active(store, job).await?;

    publish(
        store,
        id,
        JobEvent::Progress,
        vec![json!(percent), data.unwrap_or(Value::Null)],
    )
    .await?;

    Ok(percent)
}

/// Refreshes the score of an active job: its TTL deadline, or the current time as heartbeat.
///
/// Only updates existing members, so a job the stalled loop already moved on stays where it is.
pub async fn touch_active(store: &Store, job: &Job) -> Result<()> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    let keys = store.keys();
    let token = to_sortable_token(id);
    let score = job.score_for(JobState::Active, Utc::now());

    redis::pipe()
        .atomic()
        .cmd("ZADD")
        .arg(keys.jobs_by_state(JobState::Active))
        .arg("XX")
        .arg(score)
        .arg(&token)
        .ignore()
        .cmd("ZADD")
        .arg(keys.jobs_by_type(job.job_type(), JobState::Active))
        .arg("XX")
        .arg(score)
        .arg(&token)
        .ignore()
        .query_async::<()>(&mut store.conn())
        .await?;
    Ok(())
}

/// Appends a line to the job log. Fails with `JobNotFound` once the job is removed.
pub async fn log(store: &Store, job: &Job, line: &str) -> Result<()> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    let written: i64 = store
        .scripts()
        .log
        .key(store.keys().job(id))
        .key(store.keys().job_log(id))
        .arg(line)
        .arg(millis(Utc::now()))
        .invoke_async(&mut store.conn())
        .await?;
    if written == 0 {
        return Err(RedjobError::JobNotFound(id));
    }
    Ok(())
}

/// The log lines of job `id`, oldest first.
pub async fn logs(store: &Store, id: u64) -> Result<Vec<String>> {
    let lines: Vec<String> = redis::cmd("LRANGE")
        .arg(store.keys().job_log(id))
        .arg(0)
        .arg(-1)
        .query_async(&mut store.conn())
        .await?;
    Ok(lines)
}

/// Stores `error` on the job, logs its first line and publishes `error`.
pub async fn set_error(store: &Store, job: &mut Job, error: &str) -> Result<()> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    job.set_error(Some(error.to_string()));

    update_fields(store, id, &[("error", error.to_string())]).await?;

    let summary = error.lines().next().unwrap_or_default();
    log(store, job, summary).await?;
    publish(store, id, JobEvent::Error, vec![json!(error)]).await
}

/// Writes a few hash fields without touching the indices.
///
/// Nothing is written to a removed job, which is reported as `JobNotFound`.
pub async fn update_fields(store: &Store, id: u64, fields: &[(&str, String)]) -> Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let written: i64 = store
        .scripts()
        .write_fields
        .key(store.keys().job(id))
        .arg(fields)
        .invoke_async(&mut store.conn())
        .await?;
    if written == 0 {
        return Err(RedjobError::JobNotFound(id));
    }
    Ok(())
}
