use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// `Complete` and `Failed` are terminal. A failed job with attempts left is moved on to
/// `Delayed` or `Inactive` by the reattempt path, so `Failed` is only observed at rest once
/// its attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be claimed by a worker
    Inactive,
    /// Claimed and being processed
    Active,
    /// Finished successfully
    Complete,
    /// Finished with an error
    Failed,
    /// Waiting for its `promote_at` time
    Delayed,
}

impl JobState {
    /// Every state, in the order indices are cleaned up.
    pub const ALL: [JobState; 5] = [
        JobState::Inactive,
        JobState::Active,
        JobState::Complete,
        JobState::Failed,
        JobState::Delayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Inactive => "inactive",
            JobState::Active => "active",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown job state '{0}'")]
pub struct ParseJobStateError(pub String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(JobState::Inactive),
            "active" => Ok(JobState::Active),
            "complete" => Ok(JobState::Complete),
            "failed" => Ok(JobState::Failed),
            "delayed" => Ok(JobState::Delayed),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_state_name() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
    }

    #[test]
    fn rejects_unknown_state() {
        assert_eq!(
            "stuck".parse::<JobState>(),
            Err(ParseJobStateError("stuck".to_string()))
        );
    }

    #[test]
    fn only_complete_and_failed_are_terminal() {
        let terminal: Vec<_> = JobState::ALL
            .into_iter()
            .filter(JobState::is_terminal)
            .collect();
        assert_eq!(terminal, vec![JobState::Complete, JobState::Failed]);
    }
}
