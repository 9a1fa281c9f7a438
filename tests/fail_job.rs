use std::time::Duration;

use redjob::{Backoff, JobEvent, JobSpec, JobState, WorkerContext};
use serde_json::json;

use crate::helpers::{collect_events_until, wait_for_state, with_test_redis, StaticCounter};

mod helpers;

#[tokio::test]
async fn failing_job_is_retried_until_attempts_run_out() {
    with_test_redis(|test_redis| async move {
        static RUNS: StaticCounter = StaticCounter::new();

        let queue = test_redis.create_queue().await;
        let utils = queue.create_utils();
        let mut events = queue.events();

        queue
            .process("flaky", 1, |_ctx: WorkerContext| async move {
                RUNS.increment().await;
                Err::<(), _>("smtp down")
            })
            .unwrap();

        let job = utils
            .add_job("flaky", json!({}), JobSpec::builder().max_attempts(3).build())
            .await
            .unwrap();
        let id = job.id().unwrap();

        let seen =
            collect_events_until(&mut events, id, JobEvent::Failed, Duration::from_secs(5)).await;
        let failures: Vec<(JobEvent, Vec<serde_json::Value>)> = seen
            .into_iter()
            .filter(|event| matches!(event.event, JobEvent::FailedAttempt | JobEvent::Failed))
            .map(|event| (event.event, event.args))
            .collect();
        assert_eq!(
            failures,
            vec![
                (JobEvent::FailedAttempt, vec![json!("smtp down"), json!(1)]),
                (JobEvent::FailedAttempt, vec![json!("smtp down"), json!(2)]),
                (JobEvent::Failed, vec![json!("smtp down")]),
            ]
        );

        let failed = utils.get(id).await.unwrap();
        assert_eq!(*failed.state(), Some(JobState::Failed));
        assert_eq!(*failed.attempts(), 3);
        assert_eq!(failed.error().as_deref(), Some("smtp down"));
        assert!(failed.failed_at().is_some());
        assert_eq!(RUNS.get().await, 3);
        assert_eq!(utils.failed_count().await.unwrap(), 1);
        assert_eq!(
            utils.logs(id).await.unwrap(),
            vec!["smtp down"; 3]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );

        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn backoff_delays_the_next_attempt() {
    with_test_redis(|test_redis| async move {
        static RUNS: StaticCounter = StaticCounter::new();

        let queue = test_redis.create_queue().await;
        let utils = queue.create_utils();

        queue
            .process("backoff", 1, |_ctx: WorkerContext| async move {
                let run = RUNS.increment().await;
                if run == 1 {
                    Err(format!("run {run} failed"))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        let job = utils
            .add_job(
                "backoff",
                json!({}),
                JobSpec::builder()
                    .max_attempts(2)
                    .backoff(Backoff::fixed(200))
                    .build(),
            )
            .await
            .unwrap();
        let id = job.id().unwrap();

        wait_for_state(&utils, id, JobState::Delayed, Duration::from_secs(5)).await;
        let delayed = utils.get(id).await.unwrap();
        assert_eq!(*delayed.delay(), Some(200));
        assert_eq!(delayed.error().as_deref(), Some("run 1 failed"));
        let failed_at = delayed.failed_at().unwrap();
        assert_eq!(
            (delayed.promote_at().unwrap() - failed_at).num_milliseconds(),
            200
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(queue.promote_delayed_jobs().await.unwrap(), 1);

        wait_for_state(&utils, id, JobState::Complete, Duration::from_secs(5)).await;
        assert_eq!(RUNS.get().await, 2);
        assert_eq!(*utils.get(id).await.unwrap().attempts(), 2);

        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn panicking_handler_fails_the_job() {
    with_test_redis(|test_redis| async move {
        let queue = test_redis.create_queue().await;
        let utils = queue.create_utils();

        queue
            .process("panics", 1, |ctx: WorkerContext| async move {
                if ctx.data()["explode"] == json!(true) {
                    panic!("boom");
                }
            })
            .unwrap();

        let job = utils
            .add_job("panics", json!({ "explode": true }), JobSpec::default())
            .await
            .unwrap();
        let id = job.id().unwrap();
        wait_for_state(&utils, id, JobState::Failed, Duration::from_secs(5)).await;
        assert_eq!(
            utils.get(id).await.unwrap().error().as_deref(),
            Some("Job handler panicked: boom")
        );

        // The worker survives the panic
        let next = utils
            .add_job("panics", json!({ "explode": false }), JobSpec::default())
            .await
            .unwrap();
        wait_for_state(
            &utils,
            next.id().unwrap(),
            JobState::Complete,
            Duration::from_secs(5),
        )
        .await;

        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    })
    .await;
}
