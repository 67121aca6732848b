use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use principal_graph::{IdentityEngine, IdentityKind, InMemoryIdentityStore, ObservationBatch};

fn batch(i: u32) -> ObservationBatch {
    ObservationBatch::builder()
        .observe("email", IdentityKind::Email, format!("user{i}@example.com"))
        .observe("sms", IdentityKind::Phone, format!("+1 555 {i:07}"))
        .display_name(format!("User {i}"))
        .build()
        .unwrap()
}

/// Engine seeded with 1024 distinct people plus a shared support mailbox.
fn seeded_engine() -> IdentityEngine {
    let engine = IdentityEngine::new(Arc::new(InMemoryIdentityStore::new()));
    for i in 0..1024u32 {
        engine.resolve_or_create(&batch(i)).unwrap();
    }
    for personal in ["a@personal.com", "b@personal.com", "c@personal.com"] {
        let shared = ObservationBatch::builder()
            .observe("email", IdentityKind::Email, "support@company.com")
            .context("email", IdentityKind::Email, personal, 0.9)
            .build()
            .unwrap();
        engine.resolve_or_create(&shared).unwrap();
    }
    engine
}

fn bench_resolve_corroborated(c: &mut Criterion) {
    let engine = seeded_engine();
    let known = batch(512);
    c.bench_function("resolve/corroborated", |b| {
        b.iter(|| engine.resolve_or_create(&known).unwrap());
    });
}

fn bench_resolve_new(c: &mut Criterion) {
    let engine = seeded_engine();
    let mut next = 1_000_000u32;
    let mut group = c.benchmark_group("resolve");
    group.throughput(Throughput::Elements(1));
    group.bench_function("new_principal", |b| {
        b.iter(|| {
            next += 1;
            engine.resolve_or_create(&batch(next)).unwrap()
        });
    });
    group.finish();
}

fn bench_resolve_scored(c: &mut Criterion) {
    let engine = seeded_engine();
    let contested = ObservationBatch::builder()
        .observe("email", IdentityKind::Email, "support@company.com")
        .context("email", IdentityKind::Email, "a@personal.com", 0.9)
        .observe("chat", IdentityKind::Username, "someone-new")
        .build()
        .unwrap();
    c.bench_function("resolve/scored_candidates", |b| {
        b.iter(|| engine.resolve_or_create(&contested).unwrap());
    });
}

fn bench_lookup(c: &mut Criterion) {
    let engine = seeded_engine();
    c.bench_function("lookup/shared_mailbox", |b| {
        b.iter(|| {
            engine
                .lookup_claim("email", IdentityKind::Email, "support@company.com")
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_resolve_corroborated,
    bench_resolve_new,
    bench_resolve_scored,
    bench_lookup
);
criterion_main!(benches);
