use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use outreach_campaigns::{render_placeholders, Credential, Encryption, NewCredential};
use outreach_core::{CampaignId, RecipientId};
use outreach_infra::credentials::{Acquisition, CredentialPool, InMemoryCredentialPool};
use outreach_infra::queue::{InMemoryQueueStore, JobOutcome, QueueStore, RetryPolicy};
use std::collections::BTreeMap;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("tokio runtime")
}

async fn filled_queue(jobs: usize) -> InMemoryQueueStore {
    let store = InMemoryQueueStore::new(RetryPolicy::default());
    let campaign = CampaignId::new();
    let now = Utc::now();
    for i in 0..jobs {
        store
            .enqueue(campaign, RecipientId::new(), (i % 3) as i32, now)
            .await
            .expect("enqueue");
    }
    store
}

/// Lease and complete every job in a queue of the given depth.
fn bench_lease_complete(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_complete");

    for depth in [100usize, 1_000] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || rt.block_on(filled_queue(depth)),
                |store| {
                    rt.block_on(async {
                        let now = Utc::now();
                        let credential_id = outreach_core::CredentialId::new();
                        while let Some(job) = store.lease_next(now).await.expect("lease") {
                            let lease_id = job.lease_id.expect("leased job has a lease id");
                            store
                                .complete_job(job.id, lease_id, JobOutcome::Sent { credential_id }, now)
                                .await
                                .expect("complete");
                        }
                        black_box(store)
                    })
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn credential(n: usize) -> Credential {
    Credential::new(
        NewCredential {
            name: format!("sender-{n}"),
            provider: "smtp".into(),
            host: "smtp.example.test".into(),
            port: 587,
            username: format!("sender-{n}"),
            password: "secret".into(),
            encryption: Encryption::Tls,
            daily_limit: Some(1_000),
        },
        200,
        Utc::now().date_naive(),
        Utc::now(),
    )
    .expect("valid credential")
}

/// Reserve-and-refund against pools of increasing size.
fn bench_credential_acquire(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("credential_acquire");

    for size in [1usize, 10, 100] {
        let pool = InMemoryCredentialPool::new();
        rt.block_on(async {
            for n in 0..size {
                pool.register(credential(n)).await.expect("register");
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    if let Acquisition::Reserved(r) = pool.acquire().await.expect("acquire") {
                        pool.release(&r, false).await.expect("release");
                    }
                })
            });
        });
    }

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut vars = BTreeMap::new();
    vars.insert("first_name".to_string(), "Ada".to_string());
    vars.insert("company_name".to_string(), "Acme".to_string());
    vars.insert("city".to_string(), "Lisbon".to_string());
    let body = "<p>Hi {{first_name}},</p><p>{{company_name}} in {{city}} caught our eye.</p>".repeat(20);

    c.bench_function("render_placeholders", |b| {
        b.iter(|| render_placeholders(black_box(&body), black_box(&vars)))
    });
}

criterion_group!(
    benches,
    bench_lease_complete,
    bench_credential_acquire,
    bench_render
);
criterion_main!(benches);
