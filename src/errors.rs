use redjob_job::JobFieldError;
use thiserror::Error;

/// Errors that can occur during redjob operations.
#[derive(Error, Debug)]
pub enum RedjobError {
    /// A Redis command or connection failed
    #[error("Error occured while talking to redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// Job data, result or an event could not be encoded or decoded
    #[error("Error while serializing job data: {0}")]
    Json(#[from] serde_json::Error),

    /// No job hash exists under this id
    #[error("Job {0} not found")]
    JobNotFound(u64),

    /// The job hash exists but has no type. Its index entries have been cleaned up.
    #[error("Job {0} is invalid, it has no type")]
    InvalidJob(u64),

    /// A field of the stored job could not be decoded
    #[error("Job {id} has an invalid field: {source}")]
    InvalidField {
        id: u64,
        #[source]
        source: JobFieldError,
    },

    /// The operation needs a job that has been saved
    #[error("Job has not been saved yet")]
    UnsavedJob,

    /// The job already used all of its attempts
    #[error("Job {0} has no attempts left")]
    AttemptsExceeded(u64),

    /// A global shutdown is already running or done
    #[error("Queue is shutting down")]
    ShutdownInProgress,
}

/// A Result type alias for RedjobError.
pub type Result<T> = core::result::Result<T, RedjobError>;
