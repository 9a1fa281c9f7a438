use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redjob_job::{Job, JobState};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::QueueConfig;
use crate::commands;
use crate::errors::{RedjobError, Result};
use crate::events::{publish, EventBridge, JobEvent};
use crate::lock::DistributedLock;
use crate::store::{from_sortable_token, Store};
use crate::test_mode::TestMode;

/// What one tick of the stalled loop did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StalledReport {
    /// Active jobs without TTL failed for missing their heartbeat
    pub stalled: Vec<u64>,
    /// Jobs past their TTL that no worker acknowledged, failed by the queue
    pub ttl_exceeded: Vec<u64>,
    /// Jobs past their TTL failed by their own worker
    pub ttl_acknowledged: Vec<u64>,
}

/// Starts the promotion and stalled loops. Both stop when `stop` is cancelled, and skip their
/// ticks while test mode is on.
pub(crate) fn spawn_loops(
    store: Store,
    bridge: Arc<EventBridge>,
    config: Arc<QueueConfig>,
    test_mode: Arc<TestMode>,
    stop: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let promotion_lock = DistributedLock::new(
        store.clone(),
        "promotion",
        *config.promotion_lock_ttl(),
    );
    let stalled_lock = DistributedLock::new(store.clone(), "stalled", *config.stalled_lock_ttl());

    let promotion = {
        let store = store.clone();
        let bridge = bridge.clone();
        let config = config.clone();
        let test_mode = test_mode.clone();
        every(*config.promotion_interval(), stop.clone(), move || {
            let store = store.clone();
            let bridge = bridge.clone();
            let lock = promotion_lock.clone();
            let limit = *config.promotion_limit();
            let skip = test_mode.is_active();
            async move {
                if skip {
                    return;
                }
                match promote_delayed(&store, &lock, limit).await {
                    Ok(0) => (),
                    Ok(promoted) => debug!(promoted, "Promoted delayed jobs"),
                    Err(e) => {
                        error!(error = %e, "Promotion tick failed");
                        bridge.report_error("promotion", &e);
                    }
                }
            }
        })
    };

    let stalled = every(*config.stalled_interval(), stop, move || {
        let store = store.clone();
        let bridge = bridge.clone();
        let lock = stalled_lock.clone();
        let config = config.clone();
        let skip = test_mode.is_active();
        async move {
            if skip {
                return;
            }
            match recover_stalled(&store, &bridge, &lock, &config).await {
                Ok(report) if report == StalledReport::default() => (),
                Ok(report) => info!(?report, "Recovered stalled jobs"),
                Err(e) => {
                    error!(error = %e, "Stalled jobs tick failed");
                    bridge.report_error("stalled", &e);
                }
            }
        }
    });

    vec![tokio::spawn(promotion), tokio::spawn(stalled)]
}

async fn every<F, Fut>(period: Duration, stop: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => tick().await,
        }
    }
}

/// Moves due delayed jobs to `inactive`, at most `limit` of them. Returns how many moved.
///
/// Does nothing when another process holds the promotion lock.
pub async fn promote_delayed(
    store: &Store,
    lock: &DistributedLock,
    limit: usize,
) -> Result<usize> {
    let Some(guard) = lock.try_acquire().await? else {
        return Ok(0);
    };

    let promoted = promote_batch(store, limit).await;
    guard.release().await?;
    promoted
}

async fn promote_batch(store: &Store, limit: usize) -> Result<usize> {
    let ids = due_ids(store, JobState::Delayed, Utc::now().timestamp_millis(), limit).await?;

    let mut promoted = 0;
    for (id, _) in ids {
        match promote_one(store, id).await {
            Ok(true) => promoted += 1,
            Ok(false) => (),
            Err(e) => warn!(job_id = id, error = %e, "Failed to promote job"),
        }
    }
    Ok(promoted)
}

async fn promote_one(store: &Store, id: u64) -> Result<bool> {
    let mut job = commands::get(store, id).await?;
    if *job.state() != Some(JobState::Delayed) {
        return Ok(false);
    }

    publish(store, id, JobEvent::Promotion, vec![]).await?;
    commands::inactive(store, &mut job).await?;
    Ok(true)
}

/// Fails active jobs whose worker stopped reporting, and jobs running past their TTL.
///
/// Jobs with a TTL are first offered to their worker with a `ttl exceeded` event. Those not
/// acknowledged within the configured timeout are failed here.
pub async fn recover_stalled(
    store: &Store,
    bridge: &EventBridge,
    lock: &DistributedLock,
    config: &QueueConfig,
) -> Result<StalledReport> {
    let Some(guard) = lock.try_acquire().await? else {
        return Ok(StalledReport::default());
    };

    let report = recover_batch(store, bridge, config).await;
    guard.release().await?;
    report
}

async fn recover_batch(
    store: &Store,
    bridge: &EventBridge,
    config: &QueueConfig,
) -> Result<StalledReport> {
    let now = Utc::now().timestamp_millis();
    let stale_before = now - config.stalled_threshold().as_millis() as i64;
    let candidates = due_ids(store, JobState::Active, now, *config.stalled_limit()).await?;

    let mut report = StalledReport::default();
    let mut past_ttl = Vec::new();

    for (id, score) in candidates {
        let mut job = match active_job(store, id).await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                warn!(job_id = id, error = %e, "Could not load active job");
                continue;
            }
        };

        if job.ttl().is_some() {
            past_ttl.push(id);
        } else if score <= stale_before as f64 {
            warn!(job_id = id, job_type = job.job_type(), "Job stalled");
            let failed = async {
                publish(store, id, JobEvent::Stalled, vec![]).await?;
                commands::failed_attempt(store, &mut job, "stalled").await
            };
            match failed.await {
                Ok(_) => report.stalled.push(id),
                Err(e) => {
                    warn!(job_id = id, error = %e, "Failed to recover stalled job");
                    bridge.report_error("stalled", &e);
                }
            }
        }
    }

    if !past_ttl.is_empty() {
        let acknowledged =
            notify_ttl_exceeded(store, bridge, &past_ttl, *config.ttl_ack_timeout()).await?;
        for id in past_ttl {
            if acknowledged.contains(&id) {
                report.ttl_acknowledged.push(id);
                continue;
            }
            match fail_past_ttl(store, id).await {
                Ok(true) => report.ttl_exceeded.push(id),
                Ok(false) => (),
                Err(e) => {
                    warn!(job_id = id, error = %e, "Failed to fail job past its TTL");
                    bridge.report_error("stalled", &e);
                }
            }
        }
    }

    Ok(report)
}

/// Publishes `ttl exceeded` for each id and collects the acknowledgements received in time.
async fn notify_ttl_exceeded(
    store: &Store,
    bridge: &EventBridge,
    ids: &[u64],
    ack_timeout: Duration,
) -> Result<HashSet<u64>> {
    // Subscribe first so that no acknowledgement is missed
    let mut events = bridge.queue_events();
    for id in ids {
        publish(store, *id, JobEvent::TtlExceeded, vec![]).await?;
    }

    let mut pending: HashSet<u64> = ids.iter().copied().collect();
    let mut acknowledged = HashSet::new();
    let deadline = tokio::time::sleep(ack_timeout);
    tokio::pin!(deadline);

    while !pending.is_empty() {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) if event.event == JobEvent::TtlExceededAck => {
                    if pending.remove(&event.id) {
                        acknowledged.insert(event.id);
                    }
                }
                Ok(_) => (),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed queue events while waiting for TTL acknowledgements");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(acknowledged)
}

async fn fail_past_ttl(store: &Store, id: u64) -> Result<bool> {
    let Some(mut job) = active_job(store, id).await? else {
        return Ok(false);
    };
    warn!(job_id = id, job_type = job.job_type(), "No worker acknowledged the TTL, failing job");
    commands::failed_attempt(store, &mut job, "TTL exceeded").await?;
    Ok(true)
}

/// The job, if it exists and is still active.
async fn active_job(store: &Store, id: u64) -> Result<Option<Job>> {
    match commands::get(store, id).await {
        Ok(job) if *job.state() == Some(JobState::Active) => Ok(Some(job)),
        Ok(_) | Err(RedjobError::JobNotFound(_) | RedjobError::InvalidJob(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Ids and scores of the members of `state` scored at most `max`, lowest first.
async fn due_ids(
    store: &Store,
    state: JobState,
    max: i64,
    limit: usize,
) -> Result<Vec<(u64, f64)>> {
    let members: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
        .arg(store.keys().jobs_by_state(state))
        .arg("-inf")
        .arg(max)
        .arg("WITHSCORES")
        .arg("LIMIT")
        .arg(0)
        .arg(limit)
        .query_async(&mut store.conn())
        .await?;

    Ok(members
        .into_iter()
        .filter_map(|(token, score)| from_sortable_token(&token).map(|id| (id, score)))
        .collect())
}
