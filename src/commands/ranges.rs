use redjob_job::{Job, JobState};
use tracing::debug;

use crate::errors::{RedjobError, Result};
use crate::store::{from_sortable_token, Store};

use super::get::get;

/// Direction of a range query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    fn command(&self) -> &'static str {
        match self {
            Order::Asc => "ZRANGE",
            Order::Desc => "ZREVRANGE",
        }
    }
}

/// Jobs of every state, ordered by priority then creation.
pub async fn range(store: &Store, from: isize, to: isize, order: Order) -> Result<Vec<Job>> {
    range_of(store, store.keys().jobs(), from, to, order).await
}

pub async fn range_by_state(
    store: &Store,
    state: JobState,
    from: isize,
    to: isize,
    order: Order,
) -> Result<Vec<Job>> {
    range_of(store, store.keys().jobs_by_state(state), from, to, order).await
}

pub async fn range_by_type(
    store: &Store,
    job_type: &str,
    state: JobState,
    from: isize,
    to: isize,
    order: Order,
) -> Result<Vec<Job>> {
    let key = store.keys().jobs_by_type(job_type, state);
    range_of(store, key, from, to, order).await
}

/// Number of jobs in `state`.
pub async fn card(store: &Store, state: JobState) -> Result<u64> {
    zcard(store, store.keys().jobs_by_state(state)).await
}

pub async fn card_by_type(store: &Store, job_type: &str, state: JobState) -> Result<u64> {
    zcard(store, store.keys().jobs_by_type(job_type, state)).await
}

/// Ids of every job in `state`, in index order.
pub async fn state_ids(store: &Store, state: JobState) -> Result<Vec<u64>> {
    ids_in(store, &store.keys().jobs_by_state(state), 0, -1, Order::Asc).await
}

/// Every type a job was ever saved with.
pub async fn types(store: &Store) -> Result<Vec<String>> {
    let mut types: Vec<String> = redis::cmd("SMEMBERS")
        .arg(store.keys().job_types())
        .query_async(&mut store.conn())
        .await?;
    types.sort();
    Ok(types)
}

/// Total milliseconds spent on completed jobs.
pub async fn work_time(store: &Store) -> Result<u64> {
    let total: Option<u64> = redis::cmd("GET")
        .arg(store.keys().work_time())
        .query_async(&mut store.conn())
        .await?;
    Ok(total.unwrap_or_default())
}

async fn zcard(store: &Store, key: String) -> Result<u64> {
    let count: u64 = redis::cmd("ZCARD")
        .arg(key)
        .query_async(&mut store.conn())
        .await?;
    Ok(count)
}

async fn ids_in(
    store: &Store,
    key: &str,
    from: isize,
    to: isize,
    order: Order,
) -> Result<Vec<u64>> {
    let tokens: Vec<String> = redis::cmd(order.command())
        .arg(key)
        .arg(from)
        .arg(to)
        .query_async(&mut store.conn())
        .await?;
    Ok(tokens
        .iter()
        .filter_map(|token| from_sortable_token(token))
        .collect())
}

/// Loads the jobs behind a slice of an index, skipping ids whose hash has gone away.
async fn range_of(
    store: &Store,
    key: String,
    from: isize,
    to: isize,
    order: Order,
) -> Result<Vec<Job>> {
    let ids = ids_in(store, &key, from, to, order).await?;
    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
        match get(store, id).await {
            Ok(job) => jobs.push(job),
            Err(RedjobError::JobNotFound(_) | RedjobError::InvalidJob(_)) => {
                debug!(job_id = id, "Skipping vanished job in range");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_picks_the_command() {
        assert_eq!(Order::default(), Order::Asc);
        assert_eq!(Order::Asc.command(), "ZRANGE");
        assert_eq!(Order::Desc.command(), "ZREVRANGE");
    }
}
