use std::sync::Arc;

use chrono::Utc;
use redjob_job::{Job, JobState};
use redjob_job_spec::JobSpec;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Span;

use crate::commands::{self, Order};
use crate::errors::Result;
use crate::events::{EventBridge, EventMessage};
use crate::store::Store;
use crate::test_mode::{Capture, TestMode};

type JobEvents = mpsc::UnboundedReceiver<EventMessage>;

/// The QueueUtils struct provides a set of utility methods for managing jobs.
///
/// This is the primary interface for adding jobs to the queue, inspecting them and removing
/// them. It does not need any worker to run: a producer process can build one with
/// [`QueueUtils::new`] from a [`Store`], or get one from [`crate::Queue::create_utils`].
#[derive(Clone)]
pub struct QueueUtils {
    store: Store,

    /// Delivers the events of jobs saved with [`QueueUtils::save_subscribed`]
    bridge: Option<Arc<EventBridge>>,

    test_mode: Arc<TestMode>,

    /// Whether saved jobs are added to the search index
    search: bool,

    /// Default of the per-job events flag for jobs created here
    job_events: bool,
}

impl std::fmt::Debug for QueueUtils {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueUtils")
            .field("store", &self.store)
            .field("test_mode", &self.test_mode)
            .field("search", &self.search)
            .field("job_events", &self.job_events)
            .finish_non_exhaustive()
    }
}

impl QueueUtils {
    /// Creates a new instance of QueueUtils, with search disabled and job events enabled.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            bridge: None,
            test_mode: Arc::new(TestMode::new()),
            search: false,
            job_events: true,
        }
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    pub fn with_job_events(mut self, job_events: bool) -> Self {
        self.job_events = job_events;
        self
    }

    /// Lets [`QueueUtils::save_subscribed`] deliver job events through `bridge`.
    pub fn with_events(mut self, bridge: Arc<EventBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub(crate) fn with_test_mode(mut self, test_mode: Arc<TestMode>) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn test_mode(&self) -> &TestMode {
        &self.test_mode
    }

    /// Creates an unsaved job. Configure it with its setters, then [`QueueUtils::save`] it.
    pub fn create_job<P: Serialize>(&self, job_type: &str, data: P) -> Result<Job> {
        let data = serde_json::to_value(data)?;
        Ok(Job::builder()
            .job_type(job_type)
            .data(data)
            .events(self.job_events)
            .build())
    }

    /// Creates a job, applies `spec` and saves it.
    ///
    /// # Example
    /// ```no_run
    /// # use redjob::{QueueUtils, JobSpec, Priority};
    /// # use serde_json::json;
    /// # async fn example(utils: &QueueUtils) -> redjob::Result<()> {
    /// let job = utils.add_job(
    ///     "email",
    ///     json!({ "to": "user@example.com", "subject": "Hello" }),
    ///     JobSpec::builder().priority(Priority::High).max_attempts(3).build(),
    /// ).await?;
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(
        "add_job",
        skip_all,
        fields(job_type = job_type, job_id = tracing::field::Empty)
    )]
    pub async fn add_job<P: Serialize>(
        &self,
        job_type: &str,
        data: P,
        spec: JobSpec,
    ) -> Result<Job> {
        let mut job = self.create_job(job_type, data)?;
        spec.apply(&mut job, Utc::now());
        let id = self.save(&mut job).await?;
        Span::current().record("job_id", id);
        Ok(job)
    }

    /// Like [`QueueUtils::add_job`], also returning the receiver of the job's events.
    ///
    /// The receiver is registered before the job is written, so it sees `enqueue` too.
    #[tracing::instrument(
        "add_job_subscribed",
        skip_all,
        fields(job_type = job_type, job_id = tracing::field::Empty)
    )]
    pub async fn add_job_subscribed<P: Serialize>(
        &self,
        job_type: &str,
        data: P,
        spec: JobSpec,
    ) -> Result<(Job, Option<JobEvents>)> {
        let mut job = self.create_job(job_type, data)?;
        spec.apply(&mut job, Utc::now());
        let (id, events) = self.save_subscribed(&mut job).await?;
        Span::current().record("job_id", id);
        Ok((job, events))
    }

    /// Saves the job, allocating its id on the first call. Returns the id.
    ///
    /// In test mode the job is recorded, and only written when test mode processes jobs.
    pub async fn save(&self, job: &mut Job) -> Result<u64> {
        match self.test_mode.capture() {
            Capture::Off => commands::save(&self.store, job, self.search).await,
            Capture::Record => Ok(self.test_mode.save(job)),
            Capture::RecordAndSave => {
                let id = commands::save(&self.store, job, self.search).await?;
                self.test_mode.record(job);
                Ok(id)
            }
        }
    }

    /// Saves the job and returns the receiver of its events, with the job id.
    ///
    /// A new job gets its id first, then its listener, then is written, so no event of the
    /// save is missed. An already saved job is subscribed as with [`crate::Queue::subscribe`]
    /// before being updated. There is no receiver when events are disabled for the job, when
    /// these utils were built without an [`EventBridge`], or in test mode without processing.
    pub async fn save_subscribed(&self, job: &mut Job) -> Result<(u64, Option<JobEvents>)> {
        let capture = self.test_mode.capture();
        let bridge = match (&self.bridge, capture) {
            (Some(bridge), Capture::Off | Capture::RecordAndSave) => bridge,
            _ => return Ok((self.save(job).await?, None)),
        };

        let (id, events) = match *job.id() {
            Some(id) => {
                let events = bridge.subscribe(job).await?;
                commands::update(&self.store, job, self.search).await?;
                (id, events)
            }
            None => {
                let id = commands::assign_id(&self.store, job).await?;
                let events = bridge.subscribe_unsaved(job).await?;
                commands::insert(&self.store, job, self.search).await?;
                (id, events)
            }
        };

        if capture == Capture::RecordAndSave {
            self.test_mode.record(job);
        }
        Ok((id, events))
    }

    /// Writes every field of a saved job back and re-enters its current state.
    ///
    /// Fails with [`crate::RedjobError::JobNotFound`] once the job has been removed.
    pub async fn update(&self, job: &mut Job) -> Result<()> {
        match self.test_mode.capture() {
            Capture::Off => commands::update(&self.store, job, self.search).await,
            Capture::Record => {
                self.test_mode.save(job);
                Ok(())
            }
            Capture::RecordAndSave => {
                commands::update(&self.store, job, self.search).await?;
                self.test_mode.record(job);
                Ok(())
            }
        }
    }

    pub async fn get(&self, id: u64) -> Result<Job> {
        commands::get(&self.store, id).await
    }

    /// Deletes the job and every index entry pointing at it.
    ///
    /// Fails with [`crate::RedjobError::JobNotFound`] if the job does not exist, so removing
    /// twice is harmless.
    pub async fn remove(&self, id: u64) -> Result<()> {
        commands::remove(&self.store, id).await
    }

    /// Jobs of every state ordered by priority, `from` and `to` being inclusive ranks.
    pub async fn range(&self, from: isize, to: isize, order: Order) -> Result<Vec<Job>> {
        commands::range(&self.store, from, to, order).await
    }

    pub async fn range_by_state(
        &self,
        state: JobState,
        from: isize,
        to: isize,
        order: Order,
    ) -> Result<Vec<Job>> {
        commands::range_by_state(&self.store, state, from, to, order).await
    }

    pub async fn range_by_type(
        &self,
        job_type: &str,
        state: JobState,
        from: isize,
        to: isize,
        order: Order,
    ) -> Result<Vec<Job>> {
        commands::range_by_type(&self.store, job_type, state, from, to, order).await
    }

    pub async fn card(&self, state: JobState) -> Result<u64> {
        commands::card(&self.store, state).await
    }

    pub async fn card_by_type(&self, job_type: &str, state: JobState) -> Result<u64> {
        commands::card_by_type(&self.store, job_type, state).await
    }

    pub async fn inactive_count(&self) -> Result<u64> {
        self.card(JobState::Inactive).await
    }

    pub async fn active_count(&self) -> Result<u64> {
        self.card(JobState::Active).await
    }

    pub async fn delayed_count(&self) -> Result<u64> {
        self.card(JobState::Delayed).await
    }

    pub async fn complete_count(&self) -> Result<u64> {
        self.card(JobState::Complete).await
    }

    pub async fn failed_count(&self) -> Result<u64> {
        self.card(JobState::Failed).await
    }

    pub async fn state_ids(&self, state: JobState) -> Result<Vec<u64>> {
        commands::state_ids(&self.store, state).await
    }

    pub async fn types(&self) -> Result<Vec<String>> {
        commands::types(&self.store).await
    }

    /// Total milliseconds spent on successfully completed jobs.
    pub async fn work_time(&self) -> Result<u64> {
        commands::work_time(&self.store).await
    }

    pub async fn logs(&self, id: u64) -> Result<Vec<String>> {
        commands::logs(&self.store, id).await
    }

    /// Ids of the jobs whose indexed text contains every word of `query`.
    pub async fn search(&self, query: &str) -> Result<Vec<u64>> {
        commands::search(&self.store, query).await
    }
}
