use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::join_all;
use redjob_job::Job;
use redjob_shutdown_signal::shutdown_signal;
use redjob_task_handler::JobHandler;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::builder::{QueueConfig, QueueOptions};
use crate::errors::{RedjobError, Result};
use crate::events::{EventBridge, EventMessage, QueueError, QueueEvent};
use crate::lock::DistributedLock;
use crate::maintenance::{self, StalledReport};
use crate::queue_utils::QueueUtils;
use crate::store::Store;
use crate::test_mode::TestMode;
use crate::worker::Worker;

/// Runs workers for any number of job types, plus the promotion and stalled loops.
///
/// The queue is cheap to clone, every clone drives the same workers. Build one with
/// [`Queue::options`].
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    /// Random hex id, part of every worker id
    id: String,
    store: Store,
    bridge: Arc<EventBridge>,
    config: Arc<QueueConfig>,
    /// Shared with every [`QueueUtils`] created by this queue
    test_mode: Arc<TestMode>,
    workers: Mutex<Vec<WorkerSlot>>,
    /// Stop token and handles of the background loops, once started
    loops: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
    shutting_down: AtomicBool,
    stopped: CancellationToken,
}

struct WorkerSlot {
    worker: Arc<Worker>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("prefix", self.inner.config.prefix())
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Creates a new `QueueOptions` builder with default settings.
    pub fn options() -> QueueOptions {
        QueueOptions::default()
    }

    pub(crate) fn new(
        id: String,
        store: Store,
        bridge: Arc<EventBridge>,
        config: Arc<QueueConfig>,
    ) -> Self {
        let queue = Queue {
            inner: Arc::new(QueueInner {
                id,
                store,
                bridge,
                config,
                test_mode: Arc::new(TestMode::new()),
                workers: Mutex::new(Vec::new()),
                loops: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                stopped: CancellationToken::new(),
            }),
        };

        if *queue.inner.config.listen_os_shutdown_signals() {
            let weak = Arc::downgrade(&queue.inner);
            let stopped = queue.inner.stopped.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stopped.cancelled() => (),
                    _ = shutdown_signal() => shutdown_on_signal(weak).await,
                }
            });
        }

        queue
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.inner.bridge
    }

    /// Creates a [`QueueUtils`] sharing this queue's connection, settings, event bridge and
    /// test mode.
    ///
    /// Use it to create, save, query and remove jobs.
    pub fn create_utils(&self) -> QueueUtils {
        QueueUtils::new(self.inner.store.clone())
            .with_search(!*self.inner.config.disable_search())
            .with_job_events(*self.inner.config.job_events())
            .with_events(self.inner.bridge.clone())
            .with_test_mode(self.inner.test_mode.clone())
    }

    /// In-memory capture of saved jobs, for tests of producer code.
    pub fn test_mode(&self) -> &TestMode {
        &self.inner.test_mode
    }

    /// Receives the events of every job, published by any process sharing the prefix.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.bridge.queue_events()
    }

    /// Receives the failures of this queue's workers and background loops.
    ///
    /// They are also logged. None of them stops the queue.
    pub fn errors(&self) -> broadcast::Receiver<QueueError> {
        self.inner.bridge.errors()
    }

    /// Receives the events of one saved job until it completes or fails for good.
    ///
    /// Returns `None` when events are disabled for the job.
    pub async fn subscribe(
        &self,
        job: &Job,
    ) -> Result<Option<mpsc::UnboundedReceiver<EventMessage>>> {
        self.inner.bridge.subscribe(job).await
    }

    /// Starts `concurrency` workers for `job_type`, and the background loops if they are not
    /// running yet.
    ///
    /// Each worker runs one job at a time, so `concurrency` is the number of jobs of this type
    /// processed in parallel by this queue.
    ///
    /// # Errors
    /// Fails with [`RedjobError::ShutdownInProgress`] once [`Queue::shutdown`] was called.
    pub fn process<H: JobHandler>(
        &self,
        job_type: &str,
        concurrency: usize,
        handler: H,
    ) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RedjobError::ShutdownInProgress);
        }

        self.ensure_loops();

        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        info!(
            job_type,
            concurrency,
            handler = handler.identifier(),
            "Registering workers"
        );

        let mut workers = self.inner.lock_workers();
        let first = workers
            .iter()
            .filter(|slot| slot.worker.job_type() == job_type)
            .count();

        for n in first..first + concurrency {
            let id = format!(
                "{}:{}:{}:{}",
                self.inner.config.worker_id_prefix(),
                self.inner.id,
                job_type,
                n
            );
            let worker = Arc::new(Worker::new(
                id,
                job_type.to_string(),
                self.inner.store.clone(),
                self.inner.bridge.clone(),
                handler.clone(),
            ));
            let handle = tokio::spawn(worker.clone().run());
            workers.push(WorkerSlot { worker, handle });
        }

        Ok(())
    }

    /// Workers started so far, stopped ones included until a shutdown collects them.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.inner
            .lock_workers()
            .iter()
            .map(|slot| slot.worker.clone())
            .collect()
    }

    /// Runs one promotion pass now, under the same lock as the background loop.
    pub async fn promote_delayed_jobs(&self) -> Result<usize> {
        let config = &self.inner.config;
        let lock = DistributedLock::new(
            self.inner.store.clone(),
            "promotion",
            *config.promotion_lock_ttl(),
        );
        maintenance::promote_delayed(&self.inner.store, &lock, *config.promotion_limit()).await
    }

    /// Runs one stalled jobs pass now, under the same lock as the background loop.
    pub async fn recover_stalled_jobs(&self) -> Result<StalledReport> {
        let config = &self.inner.config;
        let lock = DistributedLock::new(
            self.inner.store.clone(),
            "stalled",
            *config.stalled_lock_ttl(),
        );
        maintenance::recover_stalled(&self.inner.store, &self.inner.bridge, &lock, config).await
    }

    /// Shuts every worker down in parallel, then stops the background loops and the events
    /// subscription.
    ///
    /// Jobs still running when `timeout` elapses are aborted and failed with a `Shutdown`
    /// error.
    ///
    /// # Errors
    /// Fails with [`RedjobError::ShutdownInProgress`] if a shutdown already started.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.shutdown(timeout).await
    }

    /// Shuts down the workers of one type. The rest of the queue keeps running.
    pub async fn shutdown_type(&self, job_type: &str, timeout: Duration) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RedjobError::ShutdownInProgress);
        }

        let slots: Vec<WorkerSlot> = {
            let mut workers = self.inner.lock_workers();
            let (matching, rest) = workers
                .drain(..)
                .partition(|slot| slot.worker.job_type() == job_type);
            *workers = rest;
            matching
        };

        info!(job_type, workers = slots.len(), "Shutting down workers");
        stop_workers(slots, timeout).await;
        Ok(())
    }

    /// Resolves once a global shutdown has completed.
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    fn ensure_loops(&self) {
        let Ok(mut loops) = self.inner.loops.lock() else {
            return;
        };
        if loops.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let handles = maintenance::spawn_loops(
            self.inner.store.clone(),
            self.inner.bridge.clone(),
            self.inner.config.clone(),
            self.inner.test_mode.clone(),
            stop.clone(),
        );
        debug!(queue_id = self.inner.id, "Background loops started");
        *loops = Some((stop, handles));
    }
}

impl QueueInner {
    fn lock_workers(&self) -> MutexGuard<'_, Vec<WorkerSlot>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(RedjobError::ShutdownInProgress);
        }

        info!(queue_id = self.id, "Shutting down queue");
        let slots: Vec<WorkerSlot> = self.lock_workers().drain(..).collect();
        stop_workers(slots, timeout).await;

        let loops = self.loops.lock().ok().and_then(|mut loops| loops.take());
        if let Some((stop, handles)) = loops {
            stop.cancel();
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Background loop ended abnormally");
                }
            }
        }

        self.bridge.stop().await;
        self.stopped.cancel();
        info!(queue_id = self.id, "Queue stopped");
        Ok(())
    }
}

async fn stop_workers(slots: Vec<WorkerSlot>, timeout: Duration) {
    join_all(slots.iter().map(|slot| slot.worker.shutdown(timeout))).await;

    for slot in slots {
        if let Err(e) = slot.handle.await {
            error!(worker_id = slot.worker.id(), error = %e, "Worker task ended abnormally");
        }
    }
}

async fn shutdown_on_signal(queue: Weak<QueueInner>) {
    let Some(queue) = queue.upgrade() else {
        return;
    };
    let timeout = *queue.config.shutdown_timeout();
    if let Err(e) = queue.shutdown(timeout).await {
        debug!(error = %e, "Shutdown already handled");
    }
}
