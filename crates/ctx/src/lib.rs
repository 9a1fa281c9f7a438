use std::sync::Arc;

use futures::future::BoxFuture;
use getset::Getters;
use redjob_job::Job;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Error returned by a [`JobReporter`] when progress or a log line could not be stored.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to report on job {job_id}: {message}")]
pub struct ReportError {
    pub job_id: u64,
    pub message: String,
}

/// Writes back what a handler reports about the job it is running.
///
/// Implemented by the queue on top of its store. The context only knows the trait so that
/// handlers do not depend on the storage layer.
pub trait JobReporter: Send + Sync {
    /// Stores the progress of `job` and returns the computed percentage.
    fn progress(
        &self,
        job: &Job,
        completed: u64,
        total: u64,
        data: Option<Value>,
    ) -> BoxFuture<'static, Result<u8, ReportError>>;

    /// Appends a line to the log of `job`.
    fn log(&self, job: &Job, line: String) -> BoxFuture<'static, Result<(), ReportError>>;
}

/// Pause and shutdown switches of one worker.
#[derive(Clone, Debug)]
pub struct WorkerControl {
    paused: Arc<watch::Sender<bool>>,
    stop: CancellationToken,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        WorkerControl {
            paused: Arc::new(paused),
            stop: CancellationToken::new(),
        }
    }

    /// The worker stops claiming once its current job is released.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Stops the worker for good. Unlike [`WorkerControl::pause`], it cannot be resumed.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Resolves once the worker is neither paused nor stopped, or once it is stopped.
    pub async fn wait_until_resumed(&self) {
        let mut paused = self.paused.subscribe();
        tokio::select! {
            _ = paused.wait_for(|paused| !*paused) => (),
            _ = self.stop.cancelled() => (),
        }
    }
}

/// What a handler receives for each job it runs.
#[derive(Getters, Clone)]
#[getset(get = "pub")]
pub struct WorkerContext {
    job: Job,
    worker_id: String,
    control: WorkerControl,
    #[getset(skip)]
    reporter: Arc<dyn JobReporter>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("job", &self.job)
            .field("worker_id", &self.worker_id)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    pub fn new(
        job: Job,
        worker_id: String,
        control: WorkerControl,
        reporter: Arc<dyn JobReporter>,
    ) -> Self {
        WorkerContext {
            job,
            worker_id,
            control,
            reporter,
        }
    }

    /// Payload of the job.
    pub fn data(&self) -> &Value {
        self.job.data()
    }

    /// Reports `completed` out of `total` units of work. Returns the stored percentage.
    pub async fn progress(&self, completed: u64, total: u64) -> Result<u8, ReportError> {
        self.reporter
            .progress(&self.job, completed, total, None)
            .await
    }

    /// Same as [`WorkerContext::progress`] with extra data stored alongside.
    pub async fn progress_with_data(
        &self,
        completed: u64,
        total: u64,
        data: Value,
    ) -> Result<u8, ReportError> {
        self.reporter
            .progress(&self.job, completed, total, Some(data))
            .await
    }

    pub async fn log(&self, line: impl Into<String>) -> Result<(), ReportError> {
        self.reporter.log(&self.job, line.into()).await
    }

    /// Pauses this worker after the running job.
    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Stops this worker after the running job.
    pub fn shutdown(&self) {
        self.control.shutdown();
    }
}
