use std::sync::Arc;
use std::time::Duration;

use getset::Getters;
use rand::RngCore;
use thiserror::Error;
use tracing::info;

use crate::errors::RedjobError;
use crate::events::EventBridge;
use crate::queue::Queue;
use crate::store::Store;

/// Configuration options for initializing a queue.
///
/// QueueOptions provides a builder-style API covering the Redis connection, the key prefix,
/// the background loops and event delivery.
///
/// # Example
///
/// ```no_run
/// use redjob::{Queue, WorkerContext};
/// use std::time::Duration;
///
/// async fn send_email(ctx: WorkerContext) -> Result<(), String> {
///     println!("sending to {}", ctx.data()["to"]);
///     Ok(())
/// }
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let queue = Queue::options()
///         .redis_url("redis://127.0.0.1/")
///         .prefix("myapp")
///         .promotion_interval(Duration::from_millis(500))
///         .init()
///         .await?;
///
///     queue.process("email", 4, send_email)?;
///     queue.stopped().await;
///     Ok(())
/// }
/// ```
#[derive(Default, Debug)]
pub struct QueueOptions {
    /// Redis connection string
    redis_url: Option<String>,

    /// Already configured Redis client
    redis_client: Option<redis::Client>,

    /// Namespace of every key the queue uses
    prefix: Option<String>,

    /// How often delayed jobs are checked for promotion
    promotion_interval: Option<Duration>,

    /// Maximum number of jobs promoted per tick
    promotion_limit: Option<usize>,

    /// How long the promotion lock is held at most
    promotion_lock_ttl: Option<Duration>,

    /// How often active jobs are checked for stalls and TTL overruns
    stalled_interval: Option<Duration>,

    /// How long an active job without TTL may go without heartbeat
    stalled_threshold: Option<Duration>,

    /// Maximum number of active jobs inspected per tick
    stalled_limit: Option<usize>,

    /// How long the stalled lock is held at most
    stalled_lock_ttl: Option<Duration>,

    /// How long workers get to acknowledge a TTL overrun
    ttl_ack_timeout: Option<Duration>,

    /// Whether in-process listeners of individual jobs receive events
    job_events: Option<bool>,

    /// Whether saved jobs are left out of the search index
    disable_search: Option<bool>,

    /// Whether SIGINT/SIGTERM trigger a graceful shutdown
    listen_os_shutdown_signals: Option<bool>,

    /// How long running jobs get to finish on an OS triggered shutdown
    shutdown_timeout: Option<Duration>,

    /// First part of every worker id
    worker_id_prefix: Option<String>,
}

/// Settings of a running queue, with every default filled in.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct QueueConfig {
    prefix: String,
    promotion_interval: Duration,
    promotion_limit: usize,
    promotion_lock_ttl: Duration,
    stalled_interval: Duration,
    stalled_threshold: Duration,
    stalled_limit: usize,
    stalled_lock_ttl: Duration,
    ttl_ack_timeout: Duration,
    job_events: bool,
    disable_search: bool,
    listen_os_shutdown_signals: bool,
    shutdown_timeout: Duration,
    worker_id_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            prefix: String::from("q"),
            promotion_interval: Duration::from_millis(1000),
            promotion_limit: 1000,
            promotion_lock_ttl: Duration::from_millis(2000),
            stalled_interval: Duration::from_millis(10_000),
            stalled_threshold: Duration::from_millis(15_000),
            stalled_limit: 1000,
            stalled_lock_ttl: Duration::from_millis(2000),
            ttl_ack_timeout: Duration::from_millis(1000),
            job_events: true,
            disable_search: true,
            listen_os_shutdown_signals: true,
            shutdown_timeout: Duration::from_secs(5),
            worker_id_prefix: String::from("redjob"),
        }
    }
}

/// Errors that can occur when initializing a queue.
#[derive(Error, Debug)]
pub enum QueueBuildError {
    /// The Redis URL is malformed or the server could not be reached
    #[error("Error occurred while connecting to redis: {0}")]
    ConnectError(#[from] redis::RedisError),

    /// The connection or the event subscription failed during setup
    #[error("Error occurred while starting the queue: {0}")]
    StartError(#[from] RedjobError),

    /// Neither a Redis URL nor a client was provided
    #[error("Missing redis_url configuration - must provide either redis_url or redis_client")]
    MissingRedisUrl,
}

impl QueueOptions {
    /// Initializes a queue with the configured options.
    ///
    /// Process:
    /// 1. Opens the shared Redis connection and pings the server
    /// 2. Subscribes to the job events channel
    /// 3. Generates a random queue id used in worker ids
    /// 4. Starts listening to OS shutdown signals, unless disabled
    ///
    /// Workers and background loops start with the first [`Queue::process`] call.
    ///
    /// # Errors
    /// Can fail if:
    /// * Neither `redis_url` nor `redis_client` was provided
    /// * The URL is invalid or Redis is unreachable
    /// * The events subscription cannot be set up
    pub async fn init(self) -> Result<Queue, QueueBuildError> {
        let client = match self.redis_client {
            Some(client) => client,
            None => {
                let url = self.redis_url.ok_or(QueueBuildError::MissingRedisUrl)?;
                redis::Client::open(url)?
            }
        };

        let defaults = QueueConfig::default();
        let config = QueueConfig {
            prefix: self.prefix.unwrap_or(defaults.prefix),
            promotion_interval: self.promotion_interval.unwrap_or(defaults.promotion_interval),
            promotion_limit: self.promotion_limit.unwrap_or(defaults.promotion_limit),
            promotion_lock_ttl: self.promotion_lock_ttl.unwrap_or(defaults.promotion_lock_ttl),
            stalled_interval: self.stalled_interval.unwrap_or(defaults.stalled_interval),
            stalled_threshold: self.stalled_threshold.unwrap_or(defaults.stalled_threshold),
            stalled_limit: self.stalled_limit.unwrap_or(defaults.stalled_limit),
            stalled_lock_ttl: self.stalled_lock_ttl.unwrap_or(defaults.stalled_lock_ttl),
            ttl_ack_timeout: self.ttl_ack_timeout.unwrap_or(defaults.ttl_ack_timeout),
            job_events: self.job_events.unwrap_or(defaults.job_events),
            disable_search: self.disable_search.unwrap_or(defaults.disable_search),
            listen_os_shutdown_signals: self
                .listen_os_shutdown_signals
                .unwrap_or(defaults.listen_os_shutdown_signals),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(defaults.shutdown_timeout),
            worker_id_prefix: self.worker_id_prefix.unwrap_or(defaults.worker_id_prefix),
        };

        let store = Store::connect(client, &config.prefix)
            .await
            .map_err(|e| match e {
                RedjobError::Redis(e) => QueueBuildError::ConnectError(e),
                e => QueueBuildError::StartError(e),
            })?;
        let bridge = EventBridge::start(store.clone()).await?;

        let mut random_bytes = [0u8; 6];
        rand::rng().fill_bytes(&mut random_bytes);
        let queue_id = hex::encode(random_bytes);

        info!(queue_id, prefix = config.prefix, "Queue initialized");
        Ok(Queue::new(queue_id, store, bridge, Arc::new(config)))
    }

    /// Sets the Redis connection string, e.g. `redis://127.0.0.1:6379/0`.
    ///
    /// Ignored when a client is given with [`QueueOptions::redis_client`].
    pub fn redis_url(mut self, value: &str) -> Self {
        self.redis_url = Some(value.into());
        self
    }

    /// Uses an existing Redis client instead of opening one from a URL.
    pub fn redis_client(mut self, value: redis::Client) -> Self {
        self.redis_client = Some(value);
        self
    }

    /// Sets the prefix of every key, so that several queues can share one Redis database.
    ///
    /// # Default
    /// `"q"`
    pub fn prefix(mut self, value: &str) -> Self {
        self.prefix = Some(value.into());
        self
    }

    /// Sets how often due delayed jobs are promoted to `inactive`.
    ///
    /// # Default
    /// 1 second
    pub fn promotion_interval(mut self, value: Duration) -> Self {
        self.promotion_interval = Some(value);
        self
    }

    /// Sets the maximum number of jobs promoted per tick.
    ///
    /// # Default
    /// 1000
    ///
    /// # Panics
    /// Panics if the value is 0.
    pub fn promotion_limit(mut self, value: usize) -> Self {
        assert!(value > 0, "Promotion limit must be greater than 0");
        self.promotion_limit = Some(value);
        self
    }

    /// Sets the expiry of the promotion lock. A crashed holder blocks promotion this long.
    ///
    /// # Default
    /// 2 seconds
    pub fn promotion_lock_ttl(mut self, value: Duration) -> Self {
        self.promotion_lock_ttl = Some(value);
        self
    }

    /// Sets how often active jobs are checked.
    ///
    /// # Default
    /// 10 seconds
    pub fn stalled_interval(mut self, value: Duration) -> Self {
        self.stalled_interval = Some(value);
        self
    }

    /// Sets how long an active job without TTL may go without progress before it is
    /// considered stalled and failed with the error `stalled`.
    ///
    /// Handlers of long jobs should report progress more often than this.
    ///
    /// # Default
    /// 15 seconds
    pub fn stalled_threshold(mut self, value: Duration) -> Self {
        self.stalled_threshold = Some(value);
        self
    }

    /// Sets the maximum number of active jobs inspected per tick.
    ///
    /// # Default
    /// 1000
    ///
    /// # Panics
    /// Panics if the value is 0.
    pub fn stalled_limit(mut self, value: usize) -> Self {
        assert!(value > 0, "Stalled limit must be greater than 0");
        self.stalled_limit = Some(value);
        self
    }

    /// Sets the expiry of the stalled lock.
    ///
    /// # Default
    /// 2 seconds
    pub fn stalled_lock_ttl(mut self, value: Duration) -> Self {
        self.stalled_lock_ttl = Some(value);
        self
    }

    /// Sets how long the worker running a job past its TTL gets to acknowledge it. Jobs not
    /// acknowledged in time are failed by the queue itself.
    ///
    /// # Default
    /// 1 second
    pub fn ttl_ack_timeout(mut self, value: Duration) -> Self {
        self.ttl_ack_timeout = Some(value);
        self
    }

    /// Enables or disables delivery of events to listeners of individual jobs.
    ///
    /// Queue-level events are delivered either way.
    ///
    /// # Default
    /// `true`
    pub fn job_events(mut self, value: bool) -> Self {
        self.job_events = Some(value);
        self
    }

    /// Disables or enables the search index.
    ///
    /// # Default
    /// `true` (search disabled)
    pub fn disable_search(mut self, value: bool) -> Self {
        self.disable_search = Some(value);
        self
    }

    /// Enables or disables the graceful shutdown on SIGINT/SIGTERM/SIGHUP.
    ///
    /// # Default
    /// `true`
    pub fn listen_os_shutdown_signals(mut self, value: bool) -> Self {
        self.listen_os_shutdown_signals = Some(value);
        self
    }

    /// Sets how long running jobs get to finish when an OS signal stops the queue.
    ///
    /// # Default
    /// 5 seconds
    pub fn shutdown_timeout(mut self, value: Duration) -> Self {
        self.shutdown_timeout = Some(value);
        self
    }

    /// Sets the first part of worker ids, which are `<prefix>:<queue id>:<type>:<n>`.
    ///
    /// # Default
    /// `"redjob"`
    pub fn worker_id_prefix(mut self, value: &str) -> Self {
        self.worker_id_prefix = Some(value.into());
        self
    }
}
