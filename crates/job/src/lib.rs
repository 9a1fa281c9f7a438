use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use derive_builder::Builder;
use getset::{Getters, Setters};
use serde_json::Value;

mod backoff;
mod priority;
mod state;

pub use backoff::{Backoff, MAX_DELAY};
pub use priority::{ParsePriorityError, Priority};
pub use state::{JobState, ParseJobStateError};

/// Errors raised while decoding a job hash read back from the store.
#[derive(Debug, thiserror::Error)]
pub enum JobFieldError {
    /// The hash has no `type` field, so it cannot be dispatched to any worker
    #[error("Job hash has no type field")]
    MissingType,
    /// A field holds a value that cannot be parsed into its Rust type
    #[error("Invalid value '{value}' for job field '{field}'")]
    InvalidValue { field: &'static str, value: String },
    /// A JSON encoded field (data, result, progress_data, backoff) is malformed
    #[error("Invalid JSON in job field '{field}': {source}")]
    InvalidJson {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A unit of work of a given type.
///
/// A job is created in memory, gets its id when it is first saved and from then on mirrors
/// the hash stored under that id. Timestamps are stored with millisecond precision.
#[derive(Getters, Setters, Debug, Clone, PartialEq, Builder)]
#[getset(get = "pub", set = "pub")]
#[builder(build_fn(private, name = "build_internal"), pattern = "owned")]
pub struct Job {
    /// Assigned by the id counter on first save
    #[builder(default, setter(strip_option))]
    id: Option<u64>,
    /// Type name, used to route the job to workers
    #[builder(default, setter(into))]
    job_type: String,
    /// Opaque payload
    #[builder(default = "serde_json::json!({})")]
    data: Value,
    /// Lower values are serviced first
    #[builder(default, setter(into))]
    priority: i32,
    /// `None` until the job is saved
    #[builder(default, setter(strip_option))]
    state: Option<JobState>,
    /// Attempts made so far
    #[builder(default)]
    attempts: u32,
    #[builder(default = "1")]
    max_attempts: u32,
    /// Delay in milliseconds before the job becomes claimable
    #[builder(default, setter(strip_option))]
    delay: Option<u64>,
    #[builder(default, setter(strip_option))]
    promote_at: Option<DateTime<Utc>>,
    /// Maximum time in milliseconds the job may stay active
    #[builder(default, setter(strip_option))]
    ttl: Option<u64>,
    #[builder(default, setter(strip_option))]
    backoff: Option<Backoff>,
    #[builder(default)]
    remove_on_complete: bool,
    #[builder(default, setter(strip_option))]
    created_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    updated_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    failed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    started_at: Option<DateTime<Utc>>,
    /// Processing time of the last successful run, in milliseconds
    #[builder(default, setter(strip_option))]
    duration: Option<u64>,
    #[builder(default, setter(strip_option))]
    result: Option<Value>,
    #[builder(default, setter(strip_option))]
    error: Option<String>,
    /// Percentage, 0 to 100
    #[builder(default)]
    progress: u8,
    #[builder(default, setter(strip_option))]
    progress_data: Option<Value>,
    #[builder(default, setter(strip_option))]
    worker_id: Option<String>,
    /// Dotted paths into `data` whose values are indexed for search
    #[builder(default)]
    search_keys: Vec<String>,
    /// Whether lifecycle events are delivered to in-process subscribers of this job
    #[builder(default = "true")]
    events: bool,
}

impl JobBuilder {
    /// Builds the Job with all configured values.
    pub fn build(self) -> Job {
        self.build_internal()
            .expect("All fields have defaults, build should never fail")
    }
}

impl Job {
    /// Creates a new builder for constructing a `Job`.
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Creates an unsaved job with default options.
    pub fn new(job_type: impl Into<String>, data: Value) -> Job {
        Job::builder().job_type(job_type).data(data).build()
    }

    /// State a job enters on its first save.
    pub fn initial_state(&self) -> JobState {
        match self.delay {
            Some(delay) if delay > 0 => JobState::Delayed,
            _ => JobState::Inactive,
        }
    }

    /// `delay` added to the failure time, or the creation time if the job never failed.
    ///
    /// Delays past the representable range promote at [`DateTime::<Utc>::MAX_UTC`].
    pub fn compute_promote_at(&self) -> Option<DateTime<Utc>> {
        let delay = self.delay.filter(|delay| *delay > 0)?;
        let base = self.failed_at.or(self.created_at)?;
        let promote_at = i64::try_from(delay)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|delay| base.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(promote_at)
    }

    /// Score of this job in the ordered set of `state`.
    ///
    /// Delayed jobs are ordered by `promote_at`. Active jobs with a TTL are ordered by their
    /// deadline, other active jobs by the time of their last heartbeat, so the oldest sort
    /// first in both cases. Every other state orders by priority.
    pub fn score_for(&self, state: JobState, now: DateTime<Utc>) -> f64 {
        match state {
            JobState::Delayed => self
                .promote_at
                .map(|at| at.timestamp_millis() as f64)
                .unwrap_or_else(|| now.timestamp_millis() as f64),
            JobState::Active => match self.ttl {
                Some(ttl) if ttl > 0 => now
                    .timestamp_millis()
                    .saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX))
                    as f64,
                _ => now.timestamp_millis() as f64,
            },
            _ => self.priority as f64,
        }
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Text indexed for search: the values behind `search_keys`, or the whole payload.
    pub fn searchable_text(&self) -> Result<Vec<String>, serde_json::Error> {
        if self.search_keys.is_empty() {
            return Ok(vec![serde_json::to_string(&self.data)?]);
        }

        self.search_keys
            .iter()
            .map(|key| {
                let pointer = format!("/{}", key.replace('.', "/"));
                match self.data.pointer(&pointer) {
                    Some(Value::String(s)) => Ok(s.clone()),
                    Some(other) => serde_json::to_string(other),
                    None => Ok(String::new()),
                }
            })
            .collect()
    }

    /// Fields written to the job hash on save/update.
    ///
    /// `attempts` is left out: it is only ever changed by the atomic attempt counter.
    pub fn to_hash_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut fields = vec![
            ("type", self.job_type.clone()),
            ("data", serde_json::to_string(&self.data)?),
            ("priority", self.priority.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            ("progress", self.progress.to_string()),
        ];

        if let Some(state) = self.state {
            fields.push(("state", state.as_str().to_string()));
        }
        if let Some(delay) = self.delay {
            fields.push(("delay", delay.to_string()));
        }
        if let Some(promote_at) = self.promote_at {
            fields.push(("promote_at", millis(promote_at)));
        }
        if let Some(ttl) = self.ttl {
            fields.push(("ttl", ttl.to_string()));
        }
        if let Some(backoff) = &self.backoff {
            fields.push(("backoff", serde_json::to_string(backoff)?));
        }
        if self.remove_on_complete {
            fields.push(("removeOnComplete", "true".to_string()));
        }
        if let Some(created_at) = self.created_at {
            fields.push(("created_at", millis(created_at)));
        }
        if let Some(updated_at) = self.updated_at {
            fields.push(("updated_at", millis(updated_at)));
        }
        if let Some(failed_at) = self.failed_at {
            fields.push(("failed_at", millis(failed_at)));
        }
        if let Some(started_at) = self.started_at {
            fields.push(("started_at", millis(started_at)));
        }
        if let Some(duration) = self.duration {
            fields.push(("duration", duration.to_string()));
        }
        if let Some(result) = &self.result {
            fields.push(("result", serde_json::to_string(result)?));
        }
        if let Some(error) = &self.error {
            fields.push(("error", error.clone()));
        }
        if let Some(progress_data) = &self.progress_data {
            fields.push(("progress_data", serde_json::to_string(progress_data)?));
        }
        if let Some(worker_id) = &self.worker_id {
            fields.push(("workerId", worker_id.clone()));
        }
        if !self.search_keys.is_empty() {
            fields.push(("search_keys", serde_json::to_string(&self.search_keys)?));
        }

        Ok(fields)
    }

    /// Rebuilds a job from the hash stored under `id`.
    pub fn from_hash(id: u64, raw: &HashMap<String, String>) -> Result<Job, JobFieldError> {
        let job_type = raw
            .get("type")
            .filter(|t| !t.is_empty())
            .cloned()
            .ok_or(JobFieldError::MissingType)?;

        Ok(Job {
            id: Some(id),
            job_type,
            data: json_field(raw, "data")?.unwrap_or_else(|| serde_json::json!({})),
            priority: parse_field(raw, "priority")?.unwrap_or_default(),
            state: parse_field(raw, "state")?,
            attempts: parse_field(raw, "attempts")?.unwrap_or_default(),
            max_attempts: parse_field(raw, "max_attempts")?.unwrap_or(1),
            delay: parse_field(raw, "delay")?,
            promote_at: time_field(raw, "promote_at")?,
            ttl: parse_field(raw, "ttl")?,
            backoff: json_field(raw, "backoff")?,
            remove_on_complete: raw
                .get("removeOnComplete")
                .is_some_and(|v| v == "true" || v == "1"),
            created_at: time_field(raw, "created_at")?,
            updated_at: time_field(raw, "updated_at")?,
            failed_at: time_field(raw, "failed_at")?,
            started_at: time_field(raw, "started_at")?,
            duration: parse_field(raw, "duration")?,
            result: json_field(raw, "result")?,
            error: raw.get("error").filter(|e| !e.is_empty()).cloned(),
            progress: parse_field(raw, "progress")?.unwrap_or_default(),
            progress_data: json_field(raw, "progress_data")?,
            worker_id: raw.get("workerId").cloned(),
            search_keys: json_field(raw, "search_keys")?.unwrap_or_default(),
            events: true,
        })
    }
}

/// Percentage of `completed` over `total`, truncated and capped at 100. Zero when `total` is.
pub fn progress_percent(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (completed.saturating_mul(100) / total).min(100) as u8
}

/// Epoch milliseconds as stored in job hashes.
pub fn millis(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn parse_field<T: std::str::FromStr>(
    raw: &HashMap<String, String>,
    field: &'static str,
) -> Result<Option<T>, JobFieldError> {
    match raw.get(field).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| JobFieldError::InvalidValue {
                field,
                value: value.clone(),
            }),
    }
}

fn json_field<T: serde::de::DeserializeOwned>(
    raw: &HashMap<String, String>,
    field: &'static str,
) -> Result<Option<T>, JobFieldError> {
    match raw.get(field).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => serde_json::from_str(value)
            .map(Some)
            .map_err(|source| JobFieldError::InvalidJson { field, source }),
    }
}

fn time_field(
    raw: &HashMap<String, String>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, JobFieldError> {
    let Some(ms) = parse_field::<i64>(raw, field)? else {
        return Ok(None);
    };
    DateTime::from_timestamp_millis(ms)
        .map(Some)
        .ok_or_else(|| JobFieldError::InvalidValue {
            field,
            value: ms.to_string(),
        })
}
