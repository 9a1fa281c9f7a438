use std::sync::Arc;
use std::time::Duration;

use futures::{future::BoxFuture, FutureExt};
use getset::Getters;
use redis::aio::MultiplexedConnection;
use redjob_ctx::{JobReporter, ReportError, WorkerContext, WorkerControl};
use redjob_job::{Job, JobState};
use redjob_task_handler::{spawn_task, JobHandler, RunTaskError, SpawnTaskResult};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::commands::{self, FailedAttempt};
use crate::errors::RedjobError;
use crate::events::{EventBridge, JobEvent};
use crate::store::Store;

/// Pause before waiting again after the wake-up list could not be read.
const WAKE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    WaitingForSignal,
    Claiming,
    Processing,
    /// Processing, with a shutdown requested
    ShuttingDown,
    Stopped,
}

/// Processes the jobs of one type, one at a time.
///
/// The worker blocks on the wake-up list of its type, claims the lowest scored ready job, runs
/// the handler on its own task and writes the outcome back. It keeps claiming without waiting
/// while jobs are ready, so wake-ups lost to a crash never strand a job for long.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Worker {
    /// `<prefix>:<queue hex>:<type>:<n>`
    id: String,
    job_type: String,
    control: WorkerControl,
    #[getset(skip)]
    store: Store,
    #[getset(skip)]
    bridge: Arc<EventBridge>,
    #[getset(skip)]
    handler: Arc<dyn JobHandler>,
    #[getset(skip)]
    reporter: Arc<dyn JobReporter>,
    #[getset(skip)]
    state: watch::Sender<WorkerState>,
    /// Aborts the running handler when the shutdown timeout elapses
    #[getset(skip)]
    force: CancellationToken,
}

/// Errors that can occur while processing a job.
#[derive(Error, Debug)]
pub enum ProcessJobError {
    /// Error occurred when trying to complete or fail a job after processing
    #[error("An error occured while releasing a job : '{0}'")]
    ReleaseJobError(#[from] ReleaseJobError),
    /// Error occurred when trying to claim, load or start a job
    #[error("An error occured while fetching a job to run : '{0}'")]
    GetJobError(#[from] RedjobError),
}

/// Why a handler run did not produce a result. Its message becomes the job error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunJobError {
    #[error("Job handler panicked: {0}")]
    TaskPanic(String),
    #[error("{0}")]
    TaskError(String),
    #[error("Shutdown")]
    TaskAborted,
    #[error("TTL exceeded")]
    TtlExceeded,
}

impl From<RunTaskError> for RunJobError {
    fn from(e: RunTaskError) -> Self {
        match e {
            RunTaskError::TaskPanic(message) => RunJobError::TaskPanic(message),
            RunTaskError::TaskError(message) => RunJobError::TaskError(message),
            RunTaskError::TaskAborted => RunJobError::TaskAborted,
        }
    }
}

/// Error that occurs when trying to mark a job as completed or failed.
#[derive(Error, Debug)]
#[error("Failed to release job '{job_id}'. {source}")]
pub struct ReleaseJobError {
    job_id: u64,
    #[source]
    source: RedjobError,
}

impl Worker {
    pub(crate) fn new(
        id: String,
        job_type: String,
        store: Store,
        bridge: Arc<EventBridge>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Worker {
            id,
            job_type,
            control: WorkerControl::new(),
            reporter: Arc::new(StoreReporter {
                store: store.clone(),
            }),
            store,
            bridge,
            handler,
            state,
            force: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Runs until [`Worker::shutdown`] or a handler calls `shutdown` on its context.
    pub async fn run(self: Arc<Self>) {
        info!(worker_id = self.id, job_type = self.job_type, "Worker started");

        let mut conn = match self.store.blocking_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(worker_id = self.id, error = %e, "Could not open the wake-up connection");
                self.bridge.report_error(&self.id, &e);
                self.set_state(WorkerState::Stopped);
                return;
            }
        };

        let stop = self.control.stop_token().clone();
        let wake_list = self.store.keys().wake_list(&self.job_type);
        // Jobs may already be waiting, with their wake-ups consumed by a worker that died
        let mut claim_without_waiting = true;

        loop {
            self.set_state(WorkerState::Idle);
            self.control.wait_until_resumed().await;
            if stop.is_cancelled() {
                break;
            }

            if !claim_without_waiting {
                self.set_state(WorkerState::WaitingForSignal);
                let popped = tokio::select! {
                    _ = stop.cancelled() => None,
                    r = wait_for_signal(&mut conn, &wake_list) => Some(r),
                };
                match popped {
                    None => break,
                    Some(Ok(())) => trace!(worker_id = self.id, "Woken up"),
                    Some(Err(e)) => {
                        error!(worker_id = self.id, error = %e, "Could not wait for jobs");
                        self.bridge.report_error(&self.id, &e);
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(WAKE_ERROR_BACKOFF) => continue,
                        }
                    }
                }

                self.control.wait_until_resumed().await;
                if stop.is_cancelled() {
                    break;
                }
            }

            self.set_state(WorkerState::Claiming);
            claim_without_waiting = match self.process_next().await {
                Ok(Some(job_id)) => {
                    debug!(worker_id = self.id, job_id, "Job processed");
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "Error while processing job");
                    self.bridge.report_error(&self.id, &e);
                    false
                }
            };
        }

        self.set_state(WorkerState::Stopped);
        info!(worker_id = self.id, job_type = self.job_type, "Worker stopped");
    }

    /// Stops claiming and waits for the running job.
    ///
    /// When `timeout` elapses first, the handler is aborted and its job fails with a
    /// `Shutdown` error; whatever the handler would have returned afterwards is ignored.
    pub async fn shutdown(&self, timeout: Duration) {
        self.control.shutdown();
        self.state.send_if_modified(|state| {
            let processing = *state == WorkerState::Processing;
            if processing {
                *state = WorkerState::ShuttingDown;
            }
            processing
        });

        let mut state = self.state.subscribe();
        let stopped =
            tokio::time::timeout(timeout, state.wait_for(|s| *s == WorkerState::Stopped))
                .await
                .is_ok();

        if !stopped {
            warn!(
                worker_id = self.id,
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timeout elapsed, aborting the running job"
            );
            self.force.cancel();
            let _ = state.wait_for(|s| *s == WorkerState::Stopped).await;
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_if_modified(|current| {
            // A pending shutdown outlives the rest of the job
            if *current == WorkerState::ShuttingDown && state == WorkerState::Processing {
                return false;
            }
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Claims and processes one job. Returns the claimed id, or `None` if nothing was ready.
    ///
    /// The claim already made the job active. Should anything fail before the outcome is
    /// written, the job stays active and the stalled loop recovers it.
    async fn process_next(&self) -> Result<Option<u64>, ProcessJobError> {
        let Some(job_id) = commands::claim(&self.store, &self.job_type, &self.id).await? else {
            return Ok(None);
        };

        let job = match commands::get(&self.store, job_id).await {
            Ok(job) => job,
            Err(e @ (RedjobError::JobNotFound(_) | RedjobError::InvalidJob(_))) => {
                warn!(worker_id = self.id, job_id, error = %e, "Claimed job has vanished");
                return Ok(Some(job_id));
            }
            Err(e) => return Err(e.into()),
        };

        self.process(job).await?;
        Ok(Some(job_id))
    }

    async fn process(&self, job: Job) -> Result<(), ProcessJobError> {
        let job_id = job.id().ok_or(RedjobError::UnsavedJob)?;
        self.set_state(WorkerState::Processing);
        self.bridge
            .emit(job_id, JobEvent::Start, vec![json!(job.job_type())])
            .await?;

        let (duration, result) = self.run_job(&job).await;

        if !self.still_owns(job_id).await? {
            info!(
                worker_id = self.id,
                job_id,
                "Job was removed or recovered while running, ignoring its outcome"
            );
            return Ok(());
        }

        match self.release_job(result, job, duration).await {
            Ok(()) => Ok(()),
            Err(ReleaseJobError {
                source: RedjobError::JobNotFound(_),
                ..
            }) => {
                info!(worker_id = self.id, job_id, "Job was removed while being released");
                Ok(())
            }
            Err(e) => {
                error!("Release job error : {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Whether job `id` is still active under this worker. A job removed, or failed by the
    /// stalled loop and possibly claimed again, no longer is.
    async fn still_owns(&self, job_id: u64) -> Result<bool, RedjobError> {
        let (state, worker_id): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.store.keys().job(job_id))
            .arg(&["state", "workerId"])
            .query_async(&mut self.store.conn())
            .await?;
        Ok(state.as_deref() == Some(JobState::Active.as_str())
            && worker_id.as_deref() == Some(self.id.as_str()))
    }

    /// Runs the handler until it returns, panics, or is aborted by a shutdown timeout or a
    /// TTL notice from the stalled loop.
    #[tracing::instrument(
        "run_job",
        skip_all,
        fields(job_id = job.id(), job_type = job.job_type(), worker_id = self.id)
    )]
    async fn run_job(&self, job: &Job) -> (Duration, Result<Option<Value>, RunJobError>) {
        let job_id = job.id().unwrap_or_default();
        let ctx = WorkerContext::new(
            job.clone(),
            self.id.clone(),
            self.control.clone(),
            self.reporter.clone(),
        );

        let cancel = self.force.child_token();
        let mut ttl_events = job.ttl().map(|_| self.bridge.queue_events());
        let mut ttl_exceeded = false;

        let run = spawn_task(self.handler.clone(), ctx, cancel.clone());
        tokio::pin!(run);

        let SpawnTaskResult { duration, result } = loop {
            tokio::select! {
                r = &mut run => break r,
                event = recv_or_pending(&mut ttl_events) => match event {
                    Ok(event) if event.id == job_id && event.event == JobEvent::TtlExceeded => {
                        warn!(job_id, "TTL exceeded, aborting the handler");
                        ttl_exceeded = true;
                        ttl_events = None;
                        cancel.cancel();
                    }
                    Ok(_) => (),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(job_id, skipped, "Missed queue events while watching the TTL");
                    }
                    Err(RecvError::Closed) => ttl_events = None,
                },
            }
        };

        let result = result.map_err(|e| match e {
            RunTaskError::TaskAborted if ttl_exceeded => RunJobError::TtlExceeded,
            e => RunJobError::from(e),
        });

        if result.is_ok() {
            info!(
                job_id,
                job_type = job.job_type(),
                duration = duration.as_millis() as u64,
                "Completed job with success"
            );
        }

        (duration, result)
    }

    /// Marks the job complete or records the failed attempt.
    async fn release_job(
        &self,
        result: Result<Option<Value>, RunJobError>,
        mut job: Job,
        duration: Duration,
    ) -> Result<(), ReleaseJobError> {
        let job_id = job.id().unwrap_or_default();
        let release_error = |source| ReleaseJobError { job_id, source };

        match result {
            Ok(value) => {
                self.complete_job(&mut job, value, duration)
                    .await
                    .map_err(release_error)?;
            }
            Err(e) => {
                let outcome = commands::failed_attempt(&self.store, &mut job, &e.to_string())
                    .await
                    .map_err(release_error)?;

                match outcome {
                    FailedAttempt::Exhausted { attempts } => error!(
                        error = %e,
                        job_id,
                        job_type = job.job_type(),
                        attempts,
                        "Job max attempts reached"
                    ),
                    FailedAttempt::Retry { attempts, delay } => warn!(
                        error = %e,
                        job_id,
                        job_type = job.job_type(),
                        attempts,
                        delay,
                        "Failed job"
                    ),
                }

                if e == RunJobError::TtlExceeded {
                    self.bridge
                        .emit(job_id, JobEvent::TtlExceededAck, vec![])
                        .await
                        .map_err(release_error)?;
                }
            }
        }

        Ok(())
    }

    async fn complete_job(
        &self,
        job: &mut Job,
        value: Option<Value>,
        duration: Duration,
    ) -> Result<(), RedjobError> {
        let job_id = job.id().ok_or(RedjobError::UnsavedJob)?;
        let duration_ms = duration.as_millis() as u64;

        let mut fields = vec![("duration", duration_ms.to_string())];
        if let Some(value) = &value {
            fields.push(("result", serde_json::to_string(value)?));
        }
        job.set_duration(Some(duration_ms));
        job.set_result(value.clone());

        commands::update_fields(&self.store, job_id, &fields).await?;
        commands::attempt(&self.store, job).await?;
        commands::complete(&self.store, job).await?;
        redis::cmd("INCRBY")
            .arg(self.store.keys().work_time())
            .arg(duration_ms)
            .query_async::<()>(&mut self.store.conn())
            .await?;

        self.bridge
            .emit(job_id, JobEvent::Complete, vec![value.unwrap_or(Value::Null)])
            .await?;

        if *job.remove_on_complete() {
            commands::remove(&self.store, job_id).await?;
        }

        Ok(())
    }
}

async fn wait_for_signal(
    conn: &mut MultiplexedConnection,
    wake_list: &str,
) -> redis::RedisResult<()> {
    let _: Option<(String, String)> = redis::cmd("BLPOP")
        .arg(wake_list)
        .arg(0)
        .query_async(conn)
        .await?;
    Ok(())
}

async fn recv_or_pending<T: Clone>(
    receiver: &mut Option<tokio::sync::broadcast::Receiver<T>>,
) -> Result<T, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Stores what handlers report through their [`WorkerContext`].
struct StoreReporter {
    store: Store,
}

impl JobReporter for StoreReporter {
    fn progress(
        &self,
        job: &Job,
        completed: u64,
        total: u64,
        data: Option<Value>,
    ) -> BoxFuture<'static, Result<u8, ReportError>> {
        let store = self.store.clone();
        let mut job = job.clone();
        async move {
            commands::set_progress(&store, &mut job, completed, total, data)
                .await
                .map_err(|e| report_error(&job, e))
        }
        .boxed()
    }

    fn log(&self, job: &Job, line: String) -> BoxFuture<'static, Result<(), ReportError>> {
        let store = self.store.clone();
        let job = job.clone();
        async move {
            commands::log(&store, &job, &line)
                .await
                .map_err(|e| report_error(&job, e))
        }
        .boxed()
    }
}

fn report_error(job: &Job, e: RedjobError) -> ReportError {
    ReportError {
        job_id: job.id().unwrap_or_default(),
        message: e.to_string(),
    }
}
