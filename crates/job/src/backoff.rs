use serde::{Deserialize, Serialize};

/// Longest delay a backoff yields, in milliseconds.
pub const MAX_DELAY: u64 = i64::MAX as u64;

/// Retry backoff policy of a job.
///
/// When a variant carries no `delay`, the job's own `delay` is used as the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Retry after a constant delay.
    Fixed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u64>,
    },
    /// Retry after `delay/2 * (2^attempts - 1)` milliseconds, capped by
    /// `max_delay - delay/2` when a maximum is configured.
    Exponential {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u64>,
        #[serde(
            default,
            rename = "maxDelay",
            skip_serializing_if = "Option::is_none"
        )]
        max_delay: Option<u64>,
    },
}

impl Backoff {
    pub fn fixed(delay: u64) -> Self {
        Backoff::Fixed { delay: Some(delay) }
    }

    pub fn exponential(delay: u64) -> Self {
        Backoff::Exponential {
            delay: Some(delay),
            max_delay: None,
        }
    }

    pub fn exponential_capped(delay: u64, max_delay: u64) -> Self {
        Backoff::Exponential {
            delay: Some(delay),
            max_delay: Some(max_delay),
        }
    }

    /// Delay in milliseconds before the next attempt, given the number of attempts made so far.
    ///
    /// Never more than [`MAX_DELAY`].
    pub fn delay_for(&self, attempts: u32, job_delay: Option<u64>) -> u64 {
        let delay = match *self {
            Backoff::Fixed { delay } => delay.or(job_delay).unwrap_or(0),
            Backoff::Exponential { delay, max_delay } => {
                let half = delay.or(job_delay).unwrap_or(0) as f64 * 0.5;
                if half == 0.0 {
                    return 0;
                }
                let cap = max_delay
                    .map(|max| max as f64 - half)
                    .unwrap_or(f64::INFINITY);
                let grown = half * (2f64.powi(attempts.min(i32::MAX as u32) as i32) - 1.0);
                cap.min(grown).round().max(0.0) as u64
            }
        };
        delay.min(MAX_DELAY)
    }
}
