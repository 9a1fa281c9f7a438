use chrono::Utc;
use redjob_job::Job;
use tracing::debug;

use crate::errors::{RedjobError, Result};
use crate::store::{to_sortable_token, Store};

use super::search::index;
use super::transition::transition;

/// Persists `job`, assigning its id on the first save. Returns the id.
///
/// A new job enters `delayed` when it has a positive delay and `inactive` otherwise.
#[tracing::instrument(skip_all, err, fields(job_type = job.job_type()))]
pub async fn save(store: &Store, job: &mut Job, search: bool) -> Result<u64> {
    if let Some(id) = *job.id() {
        update(store, job, search).await?;
        return Ok(id);
    }

    assign_id(store, job).await?;
    insert(store, job, search).await
}

/// Writes a job whose id came from [`assign_id`] for the first time. Returns the id.
pub async fn insert(store: &Store, job: &mut Job, search: bool) -> Result<u64> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    persist(store, job, search, false).await?;
    debug!(job_id = id, job_type = job.job_type(), "Job saved");
    Ok(id)
}

/// Gives an unsaved job its id, creation time and initial state without writing the job.
///
/// Lets a caller attach to the id before [`insert`] writes the job, so that none of its
/// events can be missed.
pub async fn assign_id(store: &Store, job: &mut Job) -> Result<u64> {
    if let Some(id) = *job.id() {
        return Ok(id);
    }

    let keys = store.keys();
    let mut conn = store.conn();

    let id: u64 = redis::cmd("INCR")
        .arg(keys.ids())
        .query_async(&mut conn)
        .await?;
    redis::cmd("SADD")
        .arg(keys.job_types())
        .arg(job.job_type())
        .query_async::<()>(&mut conn)
        .await?;

    job.set_id(Some(id));
    job.set_created_at(Some(Utc::now()));
    if job.state().is_none() {
        job.set_state(Some(job.initial_state()));
    }
    Ok(id)
}

/// Writes every field of a saved job and re-applies its current state.
///
/// `promote_at` is recomputed from the delay and the later of `failed_at`/`created_at`. A job
/// removed in the meantime is not recreated and yields `JobNotFound`.
pub async fn update(store: &Store, job: &mut Job, search: bool) -> Result<()> {
    persist(store, job, search, true).await
}

/// Writes the hash and the global index entry, then applies the state.
///
/// With `must_exist`, a job whose hash is gone is left alone.
async fn persist(
    store: &Store,
    job: &mut Job,
    search: bool,
    must_exist: bool,
) -> Result<()> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    let keys = store.keys();

    job.set_updated_at(Some(Utc::now()));
    job.set_promote_at(job.compute_promote_at());

    // The state field is only ever written by `transition`, which needs the previous value
    let fields: Vec<(&str, String)> = job
        .to_hash_fields()?
        .into_iter()
        .filter(|(field, _)| *field != "state")
        .collect();

    let written: i64 = store
        .scripts()
        .update
        .key(keys.job(id))
        .key(keys.jobs())
        .arg(to_sortable_token(id))
        .arg(*job.priority())
        .arg(if must_exist { "1" } else { "0" })
        .arg(&fields)
        .invoke_async(&mut store.conn())
        .await?;
    if written == 0 {
        return Err(RedjobError::JobNotFound(id));
    }

    let state = job.state().unwrap_or_else(|| job.initial_state());
    transition(store, job, state).await?;

    if search {
        index(store, job).await?;
    }

    Ok(())
}
