use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::{Getters, MutGetters, Setters};
use redjob_job::{Backoff, Job};

/// Producer-side options of a job. Unset fields keep the job defaults.
#[derive(Getters, Setters, MutGetters, Debug, Default, Clone, Builder)]
#[getset(get = "pub", set = "pub", get_mut = "pub")]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct JobSpec {
    /// Priority, either a raw number or a [`redjob_job::Priority`] level
    #[builder(setter(into))]
    pub priority: Option<i32>,

    /// Delay in milliseconds before the job can be claimed
    pub delay: Option<u64>,

    /// Absolute time at which the job can be claimed, converted to a delay when applied
    #[builder(setter(into))]
    pub run_at: Option<DateTime<Utc>>,

    /// Milliseconds the job may stay active before it is failed with "TTL exceeded"
    pub ttl: Option<u64>,

    pub max_attempts: Option<u32>,

    pub backoff: Option<Backoff>,

    pub remove_on_complete: Option<bool>,

    #[builder(setter(into))]
    pub search_keys: Option<Vec<String>>,

    /// Overrides the queue-wide setting for delivering events to in-process subscribers
    pub events: Option<bool>,
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> JobSpecBuilder {
        JobSpecBuilder::new()
    }

    /// Copies every option that is set onto `job`.
    ///
    /// `run_at` wins over `delay` when both are set; a `run_at` in the past means no delay.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(priority) = self.priority {
            job.set_priority(priority);
        }
        if let Some(delay) = self.delay {
            job.set_delay((delay > 0).then_some(delay));
        }
        if let Some(run_at) = self.run_at {
            let delay = (run_at - now).num_milliseconds();
            job.set_delay((delay > 0).then_some(delay as u64));
        }
        if let Some(ttl) = self.ttl {
            job.set_ttl((ttl > 0).then_some(ttl));
        }
        if let Some(max_attempts) = self.max_attempts {
            job.set_max_attempts(max_attempts.max(1));
        }
        if let Some(backoff) = self.backoff {
            job.set_backoff(Some(backoff));
        }
        if let Some(remove_on_complete) = self.remove_on_complete {
            job.set_remove_on_complete(remove_on_complete);
        }
        if let Some(search_keys) = &self.search_keys {
            job.set_search_keys(search_keys.clone());
        }
        if let Some(events) = self.events {
            job.set_events(events);
        }
    }
}

impl JobSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> JobSpec {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}

impl From<Option<JobSpec>> for JobSpec {
    fn from(spec: Option<JobSpec>) -> Self {
        spec.unwrap_or_default()
    }
}
