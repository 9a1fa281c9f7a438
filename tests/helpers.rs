#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use redjob::{
    JobEvent, JobState, Queue, QueueEvent, QueueOptions, QueueUtils, RedjobError, Store, Worker,
    WorkerState,
};
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::sync::OnceCell;
use tokio::task::LocalSet;
use tokio::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// A key prefix of its own on the test Redis, removed once the test ends.
#[derive(Clone, Debug)]
pub struct TestRedis {
    pub client: redis::Client,
    pub store: Store,
    pub prefix: String,
}

impl TestRedis {
    /// Options of a queue living under this test's prefix.
    ///
    /// The background loops tick rarely so that tests drive promotion and stalled recovery
    /// explicitly.
    pub fn queue_options(&self) -> QueueOptions {
        Queue::options()
            .redis_client(self.client.clone())
            .prefix(&self.prefix)
            .listen_os_shutdown_signals(false)
            .promotion_interval(Duration::from_secs(60))
            .stalled_interval(Duration::from_secs(60))
    }

    pub async fn create_queue(&self) -> Queue {
        self.queue_options()
            .init()
            .await
            .expect("Failed to create queue")
    }

    pub fn utils(&self) -> QueueUtils {
        QueueUtils::new(self.store.clone())
    }

    /// Overwrites the score of a job in a state set and in its type-state set.
    pub async fn set_score(&self, id: u64, job_type: &str, state: JobState, score: i64) {
        let keys = self.store.keys();
        let token = redjob::to_sortable_token(id);
        redis::pipe()
            .zadd(keys.jobs_by_state(state), &token, score)
            .ignore()
            .zadd(keys.jobs_by_type(job_type, state), &token, score)
            .ignore()
            .query_async::<()>(&mut self.store.conn())
            .await
            .expect("Failed to set score");
    }

    pub async fn score(&self, id: u64, state: JobState) -> Option<f64> {
        redis::cmd("ZSCORE")
            .arg(self.store.keys().jobs_by_state(state))
            .arg(redjob::to_sortable_token(id))
            .query_async(&mut self.store.conn())
            .await
            .expect("Failed to read score")
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut conn = self.store.conn();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}:*", self.prefix))
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .expect("Failed to scan keys");
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys
    }

    async fn cleanup(&self) {
        let keys = self.keys().await;
        if keys.is_empty() {
            return;
        }
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut self.store.conn())
            .await
            .expect("Failed to delete test keys");
    }
}

pub async fn create_test_redis() -> TestRedis {
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let client = redis::Client::open(redis_url).expect("Failed to parse REDIS_URL");

    let test_id = uuid::Uuid::now_v7();
    let prefix = format!("__test_redjob_{}", test_id.simple());
    let store = Store::connect(client.clone(), &prefix)
        .await
        .expect("Failed to connect to redis");

    TestRedis {
        client,
        store,
        prefix,
    }
}

pub async fn with_test_redis<F, Fut>(test_fn: F)
where
    F: FnOnce(TestRedis) -> Fut + 'static,
    Fut: Future<Output = ()>,
{
    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_redis = create_test_redis().await;
            let test_redis_2 = test_redis.clone();

            let result = tokio::task::spawn_local(async move {
                test_fn(test_redis_2).await;
            })
            .await;

            test_redis.cleanup().await;
            result.expect("Test failed");
        })
        .await;
}

/// Polls until the job reaches `state`, panicking after `timeout`.
pub async fn wait_for_state(utils: &QueueUtils, id: u64, state: JobState, timeout: Duration) {
    let start = Instant::now();
    loop {
        match utils.get(id).await {
            Ok(job) if *job.state() == Some(state) => return,
            Ok(_) | Err(RedjobError::JobNotFound(_)) => (),
            Err(e) => panic!("Failed to load job {id}: {e}"),
        }
        if start.elapsed() > timeout {
            panic!("Job {id} did not reach state {state} within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until `counter` reaches `count`, panicking after `timeout`.
pub async fn wait_for_count(counter: &StaticCounter, count: u32, timeout: Duration) {
    let start = Instant::now();
    while counter.get().await < count {
        if start.elapsed() > timeout {
            panic!("Counter did not reach {count} within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until the worker reaches `state`, panicking after `timeout`.
pub async fn wait_for_worker_state(worker: &Worker, state: WorkerState, timeout: Duration) {
    let start = Instant::now();
    while worker.state() != state {
        if start.elapsed() > timeout {
            panic!("Worker {} did not reach {state:?} within {timeout:?}", worker.id());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Collects the events of job `id` until `last` is received, panicking after `timeout`.
pub async fn collect_events_until(
    events: &mut broadcast::Receiver<QueueEvent>,
    id: u64,
    last: JobEvent,
    timeout: Duration,
) -> Vec<QueueEvent> {
    let mut collected = Vec::new();
    let received = tokio::time::timeout(timeout, async {
        loop {
            let event = events.recv().await.expect("Queue events closed");
            if event.id != id {
                continue;
            }
            let done = event.event == last;
            collected.push(event);
            if done {
                break;
            }
        }
    })
    .await;

    if received.is_err() {
        panic!("Did not receive '{last}' for job {id}, got {collected:?}");
    }
    collected
}

pub struct StaticCounter {
    cell: OnceCell<Mutex<u32>>,
}
async fn init_job_count() -> Mutex<u32> {
    Mutex::new(0)
}
impl StaticCounter {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn increment(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        let mut count = cell.lock().await;
        *count += 1;
        *count
    }

    pub async fn get(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        *cell.lock().await
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Debug everywhere except for the redis client itself
        let filter_layer = EnvFilter::try_new("debug,redis=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
