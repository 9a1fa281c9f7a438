use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use redjob::{from_sortable_token, to_sortable_token, Backoff, Job, JobState, Priority};
use serde_json::json;

fn sample_job() -> Job {
    Job::builder()
        .id(42_u64)
        .job_type("email")
        .data(json!({
            "to": "someone@example.com",
            "subject": "Monthly report",
            "attachments": [{ "name": "report.pdf", "size": 10_240 }],
        }))
        .priority(Priority::High)
        .max_attempts(5)
        .backoff(Backoff::exponential(1_000))
        .search_keys(vec!["to".to_string(), "subject".to_string()])
        .build()
}

fn bench_sortable_tokens(c: &mut Criterion) {
    let mut group = c.benchmark_group("sortable_token");
    for id in [7_u64, 123_456, u64::MAX / 2] {
        group.bench_with_input(BenchmarkId::new("encode", id), &id, |b, id| {
            b.iter(|| to_sortable_token(black_box(*id)))
        });
        let token = to_sortable_token(id);
        group.bench_with_input(BenchmarkId::new("decode", id), &token, |b, token| {
            b.iter(|| from_sortable_token(black_box(token)))
        });
    }
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let exponential = Backoff::exponential(1_000);
    let capped = Backoff::exponential_capped(1_000, 60_000);

    c.bench_function("backoff_exponential", |b| {
        b.iter(|| {
            (1..=20)
                .map(|attempts| exponential.delay_for(black_box(attempts), None))
                .sum::<u64>()
        })
    });
    c.bench_function("backoff_exponential_capped", |b| {
        b.iter(|| {
            (1..=20)
                .map(|attempts| capped.delay_for(black_box(attempts), Some(500)))
                .sum::<u64>()
        })
    });
}

fn bench_job_hash(c: &mut Criterion) {
    let job = sample_job();
    let raw: HashMap<String, String> = job
        .to_hash_fields()
        .expect("Job encodes")
        .into_iter()
        .map(|(field, value)| (field.to_string(), value))
        .collect();

    c.bench_function("job_to_hash_fields", |b| {
        b.iter(|| black_box(&job).to_hash_fields())
    });
    c.bench_function("job_from_hash", |b| {
        b.iter(|| Job::from_hash(42, black_box(&raw)))
    });
    c.bench_function("job_searchable_text", |b| {
        b.iter(|| black_box(&job).searchable_text())
    });
    c.bench_function("job_score_for_inactive", |b| {
        let now = chrono::Utc::now();
        b.iter(|| black_box(&job).score_for(JobState::Inactive, now))
    });
}

criterion_group!(benches, bench_sortable_tokens, bench_backoff, bench_job_hash);
criterion_main!(benches);
