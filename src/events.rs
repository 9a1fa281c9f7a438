use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use redjob_job::Job;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::errors::{RedjobError, Result};
use crate::store::Store;

/// Lifecycle events published for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEvent {
    #[serde(rename = "enqueue")]
    Enqueue,
    #[serde(rename = "promotion")]
    Promotion,
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "progress")]
    Progress,
    #[serde(rename = "failed attempt")]
    FailedAttempt,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "remove")]
    Remove,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "stalled")]
    Stalled,
    /// Sent by the stalled loop to the worker running a job past its TTL
    #[serde(rename = "ttl exceeded")]
    TtlExceeded,
    /// Sent back by that worker once it has failed the job
    #[serde(rename = "ttl exceeded ack")]
    TtlExceededAck,
}

impl JobEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEvent::Enqueue => "enqueue",
            JobEvent::Promotion => "promotion",
            JobEvent::Start => "start",
            JobEvent::Progress => "progress",
            JobEvent::FailedAttempt => "failed attempt",
            JobEvent::Failed => "failed",
            JobEvent::Complete => "complete",
            JobEvent::Remove => "remove",
            JobEvent::Error => "error",
            JobEvent::Stalled => "stalled",
            JobEvent::TtlExceeded => "ttl exceeded",
            JobEvent::TtlExceededAck => "ttl exceeded ack",
        }
    }

    /// After these, no further event is expected for the job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Complete | JobEvent::Failed)
    }
}

impl Display for JobEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Envelope published on the events channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: u64,
    pub event: JobEvent,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// An event re-emitted at queue level, for observers that do not hold the job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEvent {
    pub id: u64,
    pub event: JobEvent,
    pub args: Vec<Value>,
}

impl QueueEvent {
    /// `"job "` followed by the event name, e.g. `"job complete"`.
    pub fn name(&self) -> String {
        format!("job {}", self.event)
    }

    /// Event arguments with the job id in front.
    pub fn args_with_id(&self) -> Vec<Value> {
        std::iter::once(Value::from(self.id))
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl From<EventMessage> for QueueEvent {
    fn from(msg: EventMessage) -> Self {
        QueueEvent {
            id: msg.id,
            event: msg.event,
            args: msg.args,
        }
    }
}

/// A failure inside a worker or a background loop.
///
/// These never stop the queue; the failing step is retried on its next tick or wake-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueError {
    /// Worker id, or the name of the loop (`promotion`, `stalled`, `events`)
    pub origin: String,
    pub message: String,
}

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.origin, self.message)
    }
}

/// Publishes an event for job `id` to every process sharing the store.
pub async fn publish(store: &Store, id: u64, event: JobEvent, args: Vec<Value>) -> Result<()> {
    let payload = serde_json::to_string(&EventMessage { id, event, args })?;
    trace!(job_id = id, %event, "Publishing job event");
    redis::cmd("PUBLISH")
        .arg(store.keys().events())
        .arg(payload)
        .query_async::<()>(&mut store.conn())
        .await?;
    Ok(())
}

type Listeners = HashMap<u64, Vec<mpsc::UnboundedSender<EventMessage>>>;
type Subscribers = Arc<Mutex<Listeners>>;

/// Fans events received on the shared channel out to in-process listeners.
///
/// Listeners are registered per job id and dropped once the job completes or fails. Every
/// event is also re-emitted as a [`QueueEvent`] on a broadcast channel. Failures of workers
/// and loops are broadcast as [`QueueError`]s.
pub struct EventBridge {
    store: Store,
    subscribers: Subscribers,
    queue_events: broadcast::Sender<QueueEvent>,
    errors: broadcast::Sender<QueueError>,
    ready: watch::Receiver<bool>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

const QUEUE_EVENTS_CAPACITY: usize = 1024;
const QUEUE_ERRORS_CAPACITY: usize = 256;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

impl EventBridge {
    /// Subscribes to the events channel and starts delivering messages.
    ///
    /// Returns once the first subscription is confirmed, so that events published afterwards
    /// are never missed.
    pub async fn start(store: Store) -> Result<Arc<EventBridge>> {
        let (ready_tx, ready) = watch::channel(false);
        let (queue_events, _) = broadcast::channel(QUEUE_EVENTS_CAPACITY);
        let (errors, _) = broadcast::channel(QUEUE_ERRORS_CAPACITY);
        let subscribers: Subscribers = Default::default();
        let stop = CancellationToken::new();

        let pubsub = subscribe(&store).await?;
        ready_tx.send_replace(true);

        let task = tokio::spawn(receive_loop(
            store.clone(),
            pubsub,
            subscribers.clone(),
            queue_events.clone(),
            errors.clone(),
            ready_tx,
            stop.clone(),
        ));

        Ok(Arc::new(EventBridge {
            store,
            subscribers,
            queue_events,
            errors,
            ready,
            stop,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Publishes an event for job `id`.
    pub async fn emit(&self, id: u64, event: JobEvent, args: Vec<Value>) -> Result<()> {
        publish(&self.store, id, event, args).await
    }

    /// Receives the events of one job.
    ///
    /// Waits until the bridge is subscribed to the shared channel. Returns `None` when events
    /// are disabled for this job. A job that already completed, failed for good or was removed
    /// gets a receiver that is closed straight away and leaves no listener behind.
    pub async fn subscribe(
        &self,
        job: &Job,
    ) -> Result<Option<mpsc::UnboundedReceiver<EventMessage>>> {
        let id = job.id().ok_or(RedjobError::UnsavedJob)?;
        if !*job.events() {
            return Ok(None);
        }
        let Some((tx, rx)) = self.register(id).await else {
            return Ok(None);
        };

        // Registered before the check, so a terminal event cannot slip in between
        match self.is_finished(id).await {
            Ok(false) => Ok(Some(rx)),
            Ok(true) => {
                self.unregister(id, &tx);
                Ok(Some(rx))
            }
            Err(e) => {
                self.unregister(id, &tx);
                Err(e)
            }
        }
    }

    /// Listens to a job that has an id but is not stored yet, so that no event of its first
    /// save can be missed.
    pub(crate) async fn subscribe_unsaved(
        &self,
        job: &Job,
    ) -> Result<Option<mpsc::UnboundedReceiver<EventMessage>>> {
        let id = job.id().ok_or(RedjobError::UnsavedJob)?;
        if !*job.events() {
            return Ok(None);
        }
        Ok(self.register(id).await.map(|(_, rx)| rx))
    }

    /// Drops the listener `tx` of job `id`, when the job turned out to need none.
    fn unregister(&self, id: u64, tx: &mpsc::UnboundedSender<EventMessage>) {
        let mut subscribers = self.lock_subscribers();
        if let Some(listeners) = subscribers.get_mut(&id) {
            listeners.retain(|listener| !listener.same_channel(tx));
            if listeners.is_empty() {
                subscribers.remove(&id);
            }
        }
    }

    async fn register(
        &self,
        id: u64,
    ) -> Option<(
        mpsc::UnboundedSender<EventMessage>,
        mpsc::UnboundedReceiver<EventMessage>,
    )> {
        let mut ready = self.ready.clone();
        tokio::select! {
            r = ready.wait_for(|ready| *ready) => {
                r.ok()?;
            }
            _ = self.stop.cancelled() => return None,
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock_subscribers();
        prune_closed(&mut subscribers);
        subscribers.entry(id).or_default().push(tx.clone());
        Some((tx, rx))
    }

    /// Whether job `id` can no longer produce events: gone, complete, or failed with no
    /// attempt left.
    async fn is_finished(&self, id: u64) -> Result<bool> {
        let (job_type, state, attempts, max_attempts): (
            Option<String>,
            Option<String>,
            Option<u32>,
            Option<u32>,
        ) = redis::cmd("HMGET")
            .arg(self.store.keys().job(id))
            .arg(&["type", "state", "attempts", "max_attempts"])
            .query_async(&mut self.store.conn())
            .await?;

        if job_type.is_none() {
            return Ok(true);
        }
        Ok(match state.as_deref() {
            Some("complete") => true,
            Some("failed") => attempts.unwrap_or(0) >= max_attempts.unwrap_or(1),
            _ => false,
        })
    }

    /// Every event of every job, as seen by this process.
    pub fn queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue_events.subscribe()
    }

    /// Failures of workers and loops, as seen by this process.
    pub fn errors(&self) -> broadcast::Receiver<QueueError> {
        self.errors.subscribe()
    }

    /// Broadcasts a failure of a worker or loop. Having no observer is fine.
    pub fn report_error(&self, origin: &str, error: &dyn Display) {
        let _ = self.errors.send(QueueError {
            origin: origin.to_string(),
            message: error.to_string(),
        });
    }

    /// Number of job ids with at least one open listener.
    pub fn subscribed_jobs(&self) -> usize {
        let mut subscribers = self.lock_subscribers();
        prune_closed(&mut subscribers);
        subscribers.len()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Stops receiving and drops every listener.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Event bridge task ended abnormally");
            }
        }
        self.lock_subscribers().clear();
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn subscribe(store: &Store) -> Result<redis::aio::PubSub> {
    let mut pubsub = store.pubsub().await?;
    pubsub.subscribe(store.keys().events()).await?;
    debug!(channel = store.keys().events(), "Subscribed to job events");
    Ok(pubsub)
}

async fn receive_loop(
    store: Store,
    mut pubsub: redis::aio::PubSub,
    subscribers: Subscribers,
    queue_events: broadcast::Sender<QueueEvent>,
    errors: broadcast::Sender<QueueError>,
    ready: watch::Sender<bool>,
    stop: CancellationToken,
) {
    loop {
        {
            let mut messages = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    _ = stop.cancelled() => return,
                    msg = messages.next() => msg,
                };
                let Some(msg) = msg else {
                    break;
                };

                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Ignoring non-text job event");
                        continue;
                    }
                };
                match serde_json::from_str::<EventMessage>(&payload) {
                    Ok(msg) => dispatch(&subscribers, &queue_events, msg),
                    Err(e) => warn!(error = %e, payload, "Ignoring malformed job event"),
                }
            }
        }

        ready.send_replace(false);
        error!("Lost the job events subscription, resubscribing");
        let _ = errors.send(QueueError {
            origin: "events".to_string(),
            message: "Lost the job events subscription".to_string(),
        });

        pubsub = loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => (),
            }
            match subscribe(&store).await {
                Ok(pubsub) => break pubsub,
                Err(e) => {
                    warn!(error = %e, "Could not resubscribe to job events");
                    let _ = errors.send(QueueError {
                        origin: "events".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        };
        ready.send_replace(true);
    }
}

/// Forgets listeners whose receiver was dropped, and jobs left without any.
fn prune_closed(subscribers: &mut Listeners) {
    subscribers.retain(|_, listeners| {
        listeners.retain(|listener| !listener.is_closed());
        !listeners.is_empty()
    });
}

/// Delivers one message to the listeners of its job and to queue-level observers.
fn dispatch(
    subscribers: &Subscribers,
    queue_events: &broadcast::Sender<QueueEvent>,
    msg: EventMessage,
) {
    {
        let mut subscribers = subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listeners) = subscribers.get_mut(&msg.id) {
            listeners.retain(|listener| listener.send(msg.clone()).is_ok());
            if listeners.is_empty() || msg.event.is_terminal() {
                subscribers.remove(&msg.id);
            }
        }
    }

    // No receiver is not an error
    let _ = queue_events.send(msg.into());
}
