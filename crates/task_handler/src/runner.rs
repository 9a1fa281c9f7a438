use std::{any::Any, fmt::Display, future::Future, sync::Arc, time::Instant};

use futures::{future::BoxFuture, FutureExt};
use redjob_ctx::WorkerContext;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::task_result::{RunTaskError, SpawnTaskResult};

/// Converts what a handler returns into the stored job result or error message.
pub trait IntoJobResult {
    fn into_job_result(self) -> Result<Option<Value>, String>;
}

impl IntoJobResult for () {
    fn into_job_result(self) -> Result<Option<Value>, String> {
        Ok(None)
    }
}

impl<T, E> IntoJobResult for Result<T, E>
where
    T: Serialize,
    E: Display,
{
    fn into_job_result(self) -> Result<Option<Value>, String> {
        match self {
            Ok(value) => match serde_json::to_value(value) {
                Ok(Value::Null) => Ok(None),
                Ok(value) => Ok(Some(value)),
                Err(e) => Err(format!("Failed to serialize job result: {e}")),
            },
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Processes jobs of one type.
///
/// Implemented for every `Fn(WorkerContext) -> impl Future` whose output implements
/// [`IntoJobResult`], so plain async functions and closures can be registered.
pub trait JobHandler: Send + Sync + 'static {
    fn run(&self, ctx: WorkerContext) -> BoxFuture<'static, Result<Option<Value>, String>>;

    fn identifier(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F, Fut> JobHandler for F
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoJobResult,
{
    fn run(&self, ctx: WorkerContext) -> BoxFuture<'static, Result<Option<Value>, String>> {
        let fut = (self)(ctx);
        async move { fut.await.into_job_result() }.boxed()
    }
}

/// Runs the handler on its own task so that a panic is caught and reported instead of
/// taking the worker down. Cancelling `cancel_token` aborts the task.
pub async fn spawn_task(
    handler: Arc<dyn JobHandler>,
    ctx: WorkerContext,
    cancel_token: CancellationToken,
) -> SpawnTaskResult {
    let start = Instant::now();

    let handle = tokio::spawn(handler.run(ctx));
    let abort_handle = handle.abort_handle();

    let result = tokio::select! {
        _ = cancel_token.cancelled() => {
            abort_handle.abort();
            Err(RunTaskError::TaskAborted)
        }
        r = handle => match r {
            Ok(r) => r.map_err(RunTaskError::TaskError),
            Err(e) if e.is_panic() => Err(RunTaskError::TaskPanic(panic_message(e.into_panic()))),
            Err(_) => Err(RunTaskError::TaskAborted),
        },
    };

    SpawnTaskResult {
        duration: start.elapsed(),
        result,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use redjob_ctx::{JobReporter, ReportError, WorkerControl};
    use redjob_job::Job;
    use serde_json::json;
    use std::time::Duration;

    struct NoopReporter;

    impl JobReporter for NoopReporter {
        fn progress(
            &self,
            _job: &Job,
            _completed: u64,
            _total: u64,
            _data: Option<Value>,
        ) -> BoxFuture<'static, Result<u8, ReportError>> {
            async { Ok(0) }.boxed()
        }

        fn log(&self, _job: &Job, _line: String) -> BoxFuture<'static, Result<(), ReportError>> {
            async { Ok(()) }.boxed()
        }
    }

    fn ctx() -> WorkerContext {
        WorkerContext::new(
            Job::new("test", json!({ "n": 2 })),
            "w".into(),
            WorkerControl::new(),
            Arc::new(NoopReporter),
        )
    }

    async fn unit_handler(_ctx: WorkerContext) {}

    async fn doubling_handler(ctx: WorkerContext) -> Result<i64, String> {
        Ok(ctx.data()["n"].as_i64().unwrap_or_default() * 2)
    }

    async fn anyhow_handler(_ctx: WorkerContext) -> anyhow::Result<()> {
        anyhow::bail!("mail server down")
    }

    #[tokio::test]
    async fn functions_are_handlers() {
        assert_eq!(unit_handler.run(ctx()).await, Ok(None));
        assert_eq!(doubling_handler.run(ctx()).await, Ok(Some(json!(4))));
        assert_eq!(
            anyhow_handler.run(ctx()).await,
            Err("mail server down".to_string())
        );
    }

    #[tokio::test]
    async fn panics_are_captured() {
        let handler = |_ctx: WorkerContext| async move {
            if true {
                panic!("kaboom");
            }
        };
        let result = spawn_task(Arc::new(handler), ctx(), CancellationToken::new()).await;
        assert_eq!(result.result, Err(RunTaskError::TaskPanic("kaboom".into())));
        assert!(result.result.unwrap_err().is_panic());
    }

    #[tokio::test]
    async fn cancellation_aborts_the_task() {
        let handler = |_ctx: WorkerContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
        };
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = spawn_task(Arc::new(handler), ctx(), token).await;
        assert!(result.result.unwrap_err().is_aborted());
        assert!(result.duration < Duration::from_secs(30));
    }
}
