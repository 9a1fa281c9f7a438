mod runner;
mod task_result;

pub use runner::{spawn_task, IntoJobResult, JobHandler};
pub use task_result::{RunTaskError, SpawnTaskResult};
