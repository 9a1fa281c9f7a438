use std::time::Duration;

use redjob::{JobEvent, JobSpec, JobState, Order, Priority, RedjobError};
use serde_json::json;

use crate::helpers::{collect_events_until, with_test_redis};

mod helpers;

#[tokio::test]
async fn saved_job_round_trips() {
    with_test_redis(|test_redis| async move {
        let utils = test_redis.utils();

        let job = utils
            .add_job(
                "email",
                json!({ "to": "someone@example.com", "attempt": 1 }),
                JobSpec::builder()
                    .priority(Priority::High)
                    .max_attempts(3)
                    .build(),
            )
            .await
            .expect("Failed to add job");
        let id = job.id().expect("Saved job has an id");

        let loaded = utils.get(id).await.expect("Failed to get job");
        assert_eq!(loaded.job_type(), "email");
        assert_eq!(
            loaded.data(),
            &json!({ "to": "someone@example.com", "attempt": 1 })
        );
        assert_eq!(*loaded.priority(), -10);
        assert_eq!(*loaded.max_attempts(), 3);
        assert_eq!(*loaded.attempts(), 0);
        assert_eq!(*loaded.state(), Some(JobState::Inactive));
        assert!(loaded.created_at().is_some());

        assert_eq!(test_redis.score(id, JobState::Inactive).await, Some(-10.0));
        assert_eq!(utils.types().await.unwrap(), vec!["email".to_string()]);
    })
    .await;
}

#[tokio::test]
async fn delayed_job_waits_for_promotion() {
    with_test_redis(|test_redis| async move {
        let utils = test_redis.utils();

        let job = utils
            .add_job("email", json!({}), JobSpec::builder().delay(60_000).build())
            .await
            .expect("Failed to add job");
        let id = job.id().unwrap();

        let loaded = utils.get(id).await.unwrap();
        assert_eq!(*loaded.state(), Some(JobState::Delayed));
        let created_at = loaded.created_at().unwrap();
        let promote_at = loaded.promote_at().unwrap();
        assert_eq!(
            (promote_at - created_at).num_milliseconds(),
            60_000,
            "promote_at should be created_at plus the delay"
        );
        assert_eq!(utils.delayed_count().await.unwrap(), 1);
        assert_eq!(utils.inactive_count().await.unwrap(), 0);
    })
    .await;
}

#[tokio::test]
async fn removing_twice_fails_with_not_found() {
    with_test_redis(|test_redis| async move {
        let queue = test_redis.create_queue().await;
        let utils = queue.create_utils();
        let mut events = queue.events();

        let job = utils
            .add_job("email", json!({ "to": "a" }), JobSpec::default())
            .await
            .unwrap();
        let id = job.id().unwrap();

        utils.remove(id).await.expect("First removal should succeed");
        let events =
            collect_events_until(&mut events, id, JobEvent::Remove, Duration::from_secs(2)).await;
        assert_eq!(events.last().unwrap().name(), "job remove");

        assert!(matches!(
            utils.remove(id).await,
            Err(RedjobError::JobNotFound(removed)) if removed == id
        ));
        assert!(matches!(
            utils.get(id).await,
            Err(RedjobError::JobNotFound(_))
        ));
        assert_eq!(utils.inactive_count().await.unwrap(), 0);
        assert!(utils.range(0, -1, Order::Asc).await.unwrap().is_empty());

        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn get_cleans_up_jobs_without_type() {
    with_test_redis(|test_redis| async move {
        let utils = test_redis.utils();
        let job = utils
            .add_job("email", json!({}), JobSpec::default())
            .await
            .unwrap();
        let id = job.id().unwrap();

        redis::cmd("HDEL")
            .arg(test_redis.store.keys().job(id))
            .arg("type")
            .query_async::<()>(&mut test_redis.store.conn())
            .await
            .unwrap();

        assert!(matches!(
            utils.get(id).await,
            Err(RedjobError::InvalidJob(invalid)) if invalid == id
        ));
        assert_eq!(test_redis.score(id, JobState::Inactive).await, None);
        assert_eq!(utils.inactive_count().await.unwrap(), 0);
    })
    .await;
}

#[tokio::test]
async fn ranges_follow_priority_then_creation_order() {
    with_test_redis(|test_redis| async move {
        let utils = test_redis.utils();

        let mut ids = Vec::new();
        for priority in [Priority::Normal, Priority::Low, Priority::Critical, Priority::Normal] {
            let job = utils
                .add_job(
                    "report",
                    json!({}),
                    JobSpec::builder().priority(priority).build(),
                )
                .await
                .unwrap();
            ids.push(job.id().unwrap());
        }
        utils
            .add_job("email", json!({}), JobSpec::default())
            .await
            .unwrap();

        let ranked: Vec<u64> = utils
            .range_by_type("report", JobState::Inactive, 0, -1, Order::Asc)
            .await
            .unwrap()
            .iter()
            .filter_map(|job| *job.id())
            .collect();
        assert_eq!(ranked, vec![ids[2], ids[0], ids[3], ids[1]]);

        let first_two: Vec<u64> = utils
            .range_by_type("report", JobState::Inactive, 0, 1, Order::Desc)
            .await
            .unwrap()
            .iter()
            .filter_map(|job| *job.id())
            .collect();
        assert_eq!(first_two, vec![ids[1], ids[3]]);

        assert_eq!(utils.card_by_type("report", JobState::Inactive).await.unwrap(), 4);
        assert_eq!(utils.card(JobState::Inactive).await.unwrap(), 5);
        assert_eq!(
            utils.range_by_state(JobState::Inactive, 0, -1, Order::Asc).await.unwrap().len(),
            5
        );
        assert_eq!(utils.state_ids(JobState::Inactive).await.unwrap().len(), 5);
        assert_eq!(
            utils.types().await.unwrap(),
            vec!["email".to_string(), "report".to_string()]
        );
    })
    .await;
}

#[tokio::test]
async fn search_finds_jobs_by_payload_words() {
    with_test_redis(|test_redis| async move {
        let utils = test_redis.utils().with_search(true);

        let welcome = utils
            .add_job(
                "email",
                json!({ "to": "Alice@example.com", "subject": "Welcome aboard" }),
                JobSpec::default(),
            )
            .await
            .unwrap();
        let welcome_id = welcome.id().unwrap();

        let invoice = utils
            .add_job(
                "email",
                json!({ "to": "bob@example.com", "subject": "Your invoice", "secret": "welcome" }),
                JobSpec::builder().search_keys(vec!["to".to_string()]).build(),
            )
            .await
            .unwrap();
        let invoice_id = invoice.id().unwrap();

        assert_eq!(utils.search("welcome").await.unwrap(), vec![welcome_id]);
        assert_eq!(utils.search("ALICE Welcome").await.unwrap(), vec![welcome_id]);
        assert_eq!(utils.search("bob").await.unwrap(), vec![invoice_id]);
        assert_eq!(
            utils.search("example").await.unwrap(),
            vec![welcome_id, invoice_id]
        );
        assert!(utils.search("carol").await.unwrap().is_empty());

        utils.remove(welcome_id).await.unwrap();
        assert!(utils.search("welcome").await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn updating_a_job_moves_it_between_sets() {
    with_test_redis(|test_redis| async move {
        let utils = test_redis.utils();
        let mut job = utils
            .add_job("email", json!({}), JobSpec::default())
            .await
            .unwrap();
        let id = job.id().unwrap();

        job.set_priority(Priority::Low.value());
        job.set_state(Some(JobState::Delayed));
        job.set_delay(Some(5_000));
        utils.update(&mut job).await.unwrap();

        let loaded = utils.get(id).await.unwrap();
        assert_eq!(*loaded.state(), Some(JobState::Delayed));
        assert_eq!(*loaded.priority(), 10);
        assert_eq!(test_redis.score(id, JobState::Inactive).await, None);
        let promote_at = loaded.promote_at().unwrap().timestamp_millis() as f64;
        assert_eq!(test_redis.score(id, JobState::Delayed).await, Some(promote_at));
    })
    .await;
}

#[tokio::test]
async fn updating_a_removed_job_does_not_recreate_it() {
    with_test_redis(|test_redis| async move {
        let utils = test_redis.utils();
        let mut job = utils
            .add_job("email", json!({}), JobSpec::default())
            .await
            .unwrap();
        let id = job.id().unwrap();
        utils.remove(id).await.unwrap();

        job.set_priority(Priority::High.value());
        assert!(matches!(
            utils.update(&mut job).await,
            Err(RedjobError::JobNotFound(missing)) if missing == id
        ));
        assert!(matches!(
            redjob::commands::log(&test_redis.store, &job, "late line").await,
            Err(RedjobError::JobNotFound(_))
        ));

        assert!(matches!(utils.get(id).await, Err(RedjobError::JobNotFound(_))));
        assert_eq!(utils.card(JobState::Inactive).await.unwrap(), 0);
        assert!(utils.range(0, -1, Order::Asc).await.unwrap().is_empty());
        assert!(utils.logs(id).await.unwrap().is_empty());
    })
    .await;
}
