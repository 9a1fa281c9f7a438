use std::time::Duration;

use redjob::{JobSpec, JobState, RedjobError, WorkerContext, WorkerState};
use serde_json::json;
use tokio::time::Instant;

use crate::helpers::{wait_for_state, with_test_redis, StaticCounter};

mod helpers;

#[tokio::test]
async fn shutdown_waits_for_running_jobs() {
    with_test_redis(|test_redis| async move {
        static DONE: StaticCounter = StaticCounter::new();

        let queue = test_redis.create_queue().await;
        let utils = queue.create_utils();

        queue
            .process("short", 2, |_ctx: WorkerContext| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                DONE.increment().await;
            })
            .unwrap();

        let job = utils
            .add_job("short", json!({}), JobSpec::default())
            .await
            .unwrap();
        let id = job.id().unwrap();
        wait_for_state(&utils, id, JobState::Active, Duration::from_secs(5)).await;

        queue.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(DONE.get().await, 1);
        assert_eq!(
            *utils.get(id).await.unwrap().state(),
            Some(JobState::Complete)
        );
    })
    .await;
}

#[tokio::test]
async fn shutdown_timeout_fails_the_running_job() {
    with_test_redis(|test_redis| async move {
        let queue = test_redis.create_queue().await;
        let utils = queue.create_utils();

        queue
            .process("stuck", 1, |_ctx: WorkerContext| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap();

        let job = utils
            .add_job("stuck", json!({}), JobSpec::default())
            .await
            .unwrap();
        let id = job.id().unwrap();
        wait_for_state(&utils, id, JobState::Active, Duration::from_secs(5)).await;

        let workers = queue.workers();
        let start = Instant::now();
        queue.shutdown(Duration::from_millis(200)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        let failed = utils.get(id).await.unwrap();
        assert_eq!(*failed.state(), Some(JobState::Failed));
        assert_eq!(failed.error().as_deref(), Some("Shutdown"));
        assert!(workers
            .iter()
            .all(|worker| worker.state() == WorkerState::Stopped));
    })
    .await;
}

#[tokio::test]
async fn second_shutdown_is_refused() {
    with_test_redis(|test_redis| async move {
        let queue = test_redis.create_queue().await;
        queue
            .process("any", 1, |_ctx: WorkerContext| async move {})
            .unwrap();

        queue.shutdown(Duration::from_secs(1)).await.unwrap();
        queue.stopped().await;

        assert!(matches!(
            queue.shutdown(Duration::from_secs(1)).await,
            Err(RedjobError::ShutdownInProgress)
        ));
        assert!(matches!(
            queue.process("any", 1, |_ctx: WorkerContext| async move {}),
            Err(RedjobError::ShutdownInProgress)
        ));
    })
    .await;
}

#[tokio::test]
async fn shutting_down_one_type_keeps_the_others_running() {
    with_test_redis(|test_redis| async move {
        let queue = test_redis.create_queue().await;
        let utils = queue.create_utils();

        queue
            .process("email", 2, |_ctx: WorkerContext| async move {})
            .unwrap();
        queue
            .process("report", 1, |_ctx: WorkerContext| async move {})
            .unwrap();
        assert_eq!(queue.workers().len(), 3);

        queue
            .shutdown_type("email", Duration::from_secs(1))
            .await
            .unwrap();
        let remaining = queue.workers();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].job_type(), "report");

        let report = utils
            .add_job("report", json!({}), JobSpec::default())
            .await
            .unwrap();
        wait_for_state(
            &utils,
            report.id().unwrap(),
            JobState::Complete,
            Duration::from_secs(5),
        )
        .await;

        let email = utils
            .add_job("email", json!({}), JobSpec::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            *utils.get(email.id().unwrap()).await.unwrap().state(),
            Some(JobState::Inactive)
        );

        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn handler_can_stop_its_own_worker() {
    with_test_redis(|test_redis| async move {
        let queue = test_redis.create_queue().await;
        let utils = queue.create_utils();

        queue
            .process("once", 1, |ctx: WorkerContext| async move {
                ctx.shutdown();
            })
            .unwrap();

        let first = utils
            .add_job("once", json!({}), JobSpec::default())
            .await
            .unwrap();
        wait_for_state(
            &utils,
            first.id().unwrap(),
            JobState::Complete,
            Duration::from_secs(5),
        )
        .await;

        let worker = queue.workers().remove(0);
        let start = Instant::now();
        while worker.state() != WorkerState::Stopped {
            assert!(start.elapsed() < Duration::from_secs(2), "Worker did not stop");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let second = utils
            .add_job("once", json!({}), JobSpec::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            *utils.get(second.id().unwrap()).await.unwrap().state(),
            Some(JobState::Inactive)
        );

        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    })
    .await;
}
