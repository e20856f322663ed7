//! Agent pool performance benchmarks using Criterion.
//!
//! Run with: `cargo bench -p pool-bench`

use chrono::Duration;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pool_proto::{DeployStatus, Instance, PoolState, ProbeResult};
use pool_reconcile::PoolCache;
use pool_status::derive_state;

// ─── bench_status_derivation ─────────────────────────────────────────────────

/// Measure the status deriver's per-call cost. The reconciler calls this
/// once per in-scope service on every tick.
fn bench_status_derivation(c: &mut Criterion) {
    let probe = ProbeResult {
        ready: true,
        conversation_id: None,
        streaming: None,
    };
    let timeout = Duration::minutes(15);

    c.bench_function("status_derivation", |b| {
        b.iter(|| {
            let state = derive_state(
                black_box(DeployStatus::Success),
                black_box(Some(&probe)),
                black_box(Duration::seconds(5)),
                black_box(timeout),
            );
            black_box(state)
        });
    });
}

// ─── bench_cache_counts ───────────────────────────────────────────────────────

/// Aggregate counts across a 1000-instance cache. Called by `GET
/// /pool/counts` and every tick's replenish decision.
fn bench_cache_counts(c: &mut Criterion) {
    let cache = PoolCache::new();
    for i in 0..1000 {
        let mut instance = Instance::starting(format!("i-{i}"), format!("svc-{i}"), format!("agentpool-prod-{i}"));
        instance.state = if i % 3 == 0 { PoolState::Claimed } else { PoolState::Idle };
        cache.insert(instance);
    }

    c.bench_function("cache_counts_1000", |b| {
        b.iter(|| black_box(cache.counts()));
    });
}

// ─── bench_cache_pick_idle ────────────────────────────────────────────────────

/// Scan for one idle candidate in a 1000-instance cache, the hot path of
/// the claim coordinator's step 1.
fn bench_cache_pick_idle(c: &mut Criterion) {
    let cache = PoolCache::new();
    for i in 0..1000 {
        let mut instance = Instance::starting(format!("i-{i}"), format!("svc-{i}"), format!("agentpool-prod-{i}"));
        instance.state = if i == 999 { PoolState::Idle } else { PoolState::Claimed };
        cache.insert(instance);
    }

    c.bench_function("cache_pick_idle_worst_case_1000", |b| {
        b.iter(|| black_box(cache.pick_idle(|_| false)));
    });
}

criterion_group!(benches, bench_status_derivation, bench_cache_counts, bench_cache_pick_idle);
criterion_main!(benches);
