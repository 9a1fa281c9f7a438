use chrono::Utc;
use redjob_job::{Job, JobState};
use serde_json::json;

use crate::errors::{RedjobError, Result};
use crate::events::{publish, JobEvent};
use crate::store::{to_sortable_token, Store};

use super::progress::update_fields;

/// Moves `job` into `state`.
///
/// One script removes the job from the indices of the state currently stored in its hash,
/// writes the new state and adds it to the indices of `state`, scored for that state. Entering
/// `inactive` also wakes a worker of the job's type and publishes `enqueue`.
#[tracing::instrument(skip_all, err, fields(job_id = job.id(), %state))]
pub async fn transition(store: &Store, job: &mut Job, state: JobState) -> Result<()> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    let now = Utc::now();
    let score = job.score_for(state, now);

    let moved: i64 = store
        .scripts()
        .transition
        .arg(store.keys().prefix())
        .arg(id)
        .arg(to_sortable_token(id))
        .arg(job.job_type())
        .arg(state.as_str())
        .arg(score)
        .arg(now.timestamp_millis())
        .invoke_async(&mut store.conn())
        .await?;

    if moved == 0 {
        return Err(RedjobError::JobNotFound(id));
    }

    job.set_state(Some(state));
    job.set_updated_at(Some(now));

    if state == JobState::Inactive {
        publish(store, id, JobEvent::Enqueue, vec![json!(job.job_type())]).await?;
    }

    Ok(())
}

/// Marks the job finished, with its progress at 100.
pub async fn complete(store: &Store, job: &mut Job) -> Result<()> {
    job.set_progress(100);
    set_field(store, job, "progress", "100").await?;
    transition(store, job, JobState::Complete).await
}

/// Marks the job failed and stamps `failed_at`.
pub async fn failed(store: &Store, job: &mut Job) -> Result<()> {
    let now = Utc::now();
    job.set_failed_at(Some(now));
    set_field(store, job, "failed_at", &redjob_job::millis(now)).await?;
    transition(store, job, JobState::Failed).await
}

pub async fn delayed(store: &Store, job: &mut Job) -> Result<()> {
    transition(store, job, JobState::Delayed).await
}

pub async fn active(store: &Store, job: &mut Job) -> Result<()> {
    transition(store, job, JobState::Active).await
}

pub async fn inactive(store: &Store, job: &mut Job) -> Result<()> {
    transition(store, job, JobState::Inactive).await
}

async fn set_field(store: &Store, job: &Job, field: &str, value: &str) -> Result<()> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    update_fields(store, id, &[(field, value.to_string())]).await
}
