use redjob_job::{Job, JobState};
use serde_json::json;
use tracing::{debug, info};

use crate::errors::{RedjobError, Result};
use crate::events::{publish, JobEvent};
use crate::store::Store;

use super::progress::set_error;
use super::save::update;
use super::transition::{failed, inactive};

/// Attempt counters after [`attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Attempt {
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Counts one attempt, unless the job already used them all.
pub async fn attempt(store: &Store, job: &mut Job) -> Result<Attempt> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;

    let counters: Option<(u32, u32)> = store
        .scripts()
        .attempt
        .key(store.keys().job(id))
        .invoke_async(&mut store.conn())
        .await?;
    let (attempts, max_attempts) = counters.ok_or(RedjobError::JobNotFound(id))?;

    job.set_attempts(attempts);
    job.set_max_attempts(max_attempts);
    Ok(Attempt {
        attempts,
        max_attempts,
    })
}

/// Outcome of [`failed_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedAttempt {
    /// The job goes back to `delayed` for `delay` milliseconds, or straight to `inactive`
    Retry { attempts: u32, delay: Option<u64> },
    /// No attempt is left, the job stays `failed`
    Exhausted { attempts: u32 },
}

/// Records `error` and either schedules a reattempt or fails the job for good.
///
/// This is the one recovery path for handler errors, stalled jobs and TTL overruns. With
/// attempts left, the job is delayed by its backoff (or made `inactive` right away without
/// one) and `failed attempt` is published. Otherwise it stays `failed` and `failed` is
/// published.
#[tracing::instrument(skip_all, err, fields(job_id = job.id(), job_type = job.job_type()))]
pub async fn failed_attempt(store: &Store, job: &mut Job, error: &str) -> Result<FailedAttempt> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;

    set_error(store, job, error).await?;
    failed(store, job).await?;
    let counters = attempt(store, job).await?;

    if counters.remaining() == 0 {
        info!(job_id = id, attempts = counters.attempts, error, "Job failed, no attempts left");
        publish(store, id, JobEvent::Failed, vec![json!(error)]).await?;
        return Ok(FailedAttempt::Exhausted {
            attempts: counters.attempts,
        });
    }

    let delay = reattempt(store, job, counters.attempts).await?;
    debug!(job_id = id, attempts = counters.attempts, delay, "Job will be retried");
    publish(
        store,
        id,
        JobEvent::FailedAttempt,
        vec![json!(error), json!(counters.attempts)],
    )
    .await?;

    Ok(FailedAttempt::Retry {
        attempts: counters.attempts,
        delay,
    })
}

/// Puts a failed job back in line. Returns the backoff delay, if any.
async fn reattempt(store: &Store, job: &mut Job, attempts: u32) -> Result<Option<u64>> {
    let Some(backoff) = *job.backoff() else {
        inactive(store, job).await?;
        return Ok(None);
    };

    let delay = backoff.delay_for(attempts, *job.delay());
    if delay == 0 {
        inactive(store, job).await?;
        return Ok(None);
    }

    job.set_delay(Some(delay));
    job.set_state(Some(JobState::Delayed));
    update(store, job, false).await?;
    Ok(Some(delay))
}
