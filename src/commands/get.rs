use std::collections::HashMap;

use redjob_job::{Job, JobFieldError, JobState};
use tracing::warn;

use crate::errors::{RedjobError, Result};
use crate::store::{to_sortable_token, Store};

/// Loads the job stored under `id`.
///
/// A missing hash, or one without a type, is cleaned out of every index before the error is
/// returned.
#[tracing::instrument(skip(store), err)]
pub async fn get(store: &Store, id: u64) -> Result<Job> {
    let raw: HashMap<String, String> = redis::cmd("HGETALL")
        .arg(store.keys().job(id))
        .query_async(&mut store.conn())
        .await?;

    if raw.is_empty() {
        remove_bad_job(store, id).await?;
        return Err(RedjobError::JobNotFound(id));
    }

    match Job::from_hash(id, &raw) {
        Ok(job) => Ok(job),
        Err(JobFieldError::MissingType) => {
            remove_bad_job(store, id).await?;
            Err(RedjobError::InvalidJob(id))
        }
        Err(source) => Err(RedjobError::InvalidField { id, source }),
    }
}

/// Best effort removal of every trace of `id`, for ids whose hash is missing or broken.
pub async fn remove_bad_job(store: &Store, id: u64) -> Result<()> {
    let keys = store.keys();
    let token = to_sortable_token(id);
    let mut conn = store.conn();

    let types: Vec<String> = redis::cmd("SMEMBERS")
        .arg(keys.job_types())
        .query_async(&mut conn)
        .await?;
    let words: Vec<String> = redis::cmd("SMEMBERS")
        .arg(keys.search_job(id))
        .query_async(&mut conn)
        .await?;

    let mut pipe = redis::pipe();
    pipe.atomic();
    for state in JobState::ALL {
        pipe.zrem(keys.jobs_by_state(state), &token).ignore();
        for job_type in &types {
            pipe.zrem(keys.jobs_by_type(job_type, state), &token)
                .ignore();
        }
    }
    pipe.zrem(keys.jobs(), &token).ignore();
    pipe.del(keys.job(id)).ignore();
    pipe.del(keys.job_log(id)).ignore();
    for word in &words {
        pipe.srem(keys.search_word(word), id).ignore();
    }
    pipe.del(keys.search_job(id)).ignore();

    if let Err(e) = pipe.query_async::<()>(&mut conn).await {
        warn!(job_id = id, error = %e, "Failed to clean up bad job");
        return Err(e.into());
    }

    Ok(())
}
