//! Priority job queue backed by Redis.
//!
//! Producers save jobs with [`QueueUtils`]; a [`Queue`] runs workers that claim the lowest
//! scored ready job of their type, one at a time, and record the outcome. Failed jobs are
//! retried with an optional backoff until their attempts run out. Delayed jobs are promoted
//! when due, and jobs whose worker died or which run past their TTL are failed by a
//! background loop. Every lifecycle change is published on a Redis channel so that any
//! process sharing the key prefix can observe it.
//!
//! ```no_run
//! use std::time::Duration;
//! use redjob::{JobSpec, Queue, WorkerContext};
//! use serde_json::json;
//!
//! async fn send_email(ctx: WorkerContext) -> Result<(), String> {
//!     ctx.progress(1, 2).await.map_err(|e| e.to_string())?;
//!     Ok(())
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Queue::options().redis_url("redis://127.0.0.1/").init().await?;
//! queue.process("email", 2, send_email)?;
//!
//! let utils = queue.create_utils();
//! utils.add_job("email", json!({ "to": "someone@example.com" }), JobSpec::default()).await?;
//!
//! queue.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod commands;
pub mod errors;
pub mod events;
pub mod lock;
pub mod maintenance;
pub mod queue;
pub mod queue_utils;
pub mod store;
pub mod test_mode;
pub mod worker;

pub use crate::builder::{QueueBuildError, QueueConfig, QueueOptions};
pub use crate::commands::{FailedAttempt, Order};
pub use crate::errors::{RedjobError, Result};
pub use crate::events::{EventBridge, EventMessage, JobEvent, QueueError, QueueEvent};
pub use crate::lock::{DistributedLock, LockGuard};
pub use crate::maintenance::StalledReport;
pub use crate::queue::Queue;
pub use crate::queue_utils::QueueUtils;
pub use crate::store::{from_sortable_token, to_sortable_token, Keys, Store};
pub use crate::test_mode::TestMode;
pub use crate::worker::{Worker, WorkerState};

pub use redjob_ctx::{JobReporter, ReportError, WorkerContext, WorkerControl};
pub use redjob_job::{Backoff, Job, JobBuilder, JobState, Priority, MAX_DELAY};
pub use redjob_job_spec::{JobSpec, JobSpecBuilder};
pub use redjob_task_handler::{IntoJobResult, JobHandler};
