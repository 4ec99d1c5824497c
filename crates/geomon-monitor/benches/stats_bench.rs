//! Criterion benchmarks for window statistics over a full sample history.

use std::hint::black_box;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use criterion::{Criterion, criterion_group, criterion_main};
use geomon_core::{Clock, ManualClock, Window};
use geomon_monitor::{EngineOptions, SampleAggregator};
use geomon_storage::MemoryStore;

const FULL_HISTORY: i64 = 10_000;

#[allow(clippy::cast_precision_loss)]
fn seeded() -> SampleAggregator {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap(),
    ));
    let mut agg = SampleAggregator::new(
        "pressure",
        Arc::new(MemoryStore::new()),
        clock.clone(),
        EngineOptions::default(),
    );
    // One sample per minute, spanning ~7 days.
    let now = clock.now();
    agg.record_batch((0..FULL_HISTORY).map(|i| {
        (
            1000.0 + (i % 97) as f64,
            now - Duration::minutes(FULL_HISTORY - i),
        )
    }));
    agg
}

fn bench_stats_full_history(c: &mut Criterion) {
    let agg = seeded();
    c.bench_function("stats_10k_history", |b| {
        b.iter(|| black_box(agg.stats()));
    });
}

fn bench_summary_12h(c: &mut Criterion) {
    let agg = seeded();
    c.bench_function("summary_12h_10k_history", |b| {
        b.iter(|| black_box(agg.summary(black_box(Window::Last12h))));
    });
}

fn bench_flush_full_history(c: &mut Criterion) {
    let mut agg = seeded();
    let mut v = 0.0;
    c.bench_function("flush_10k_history", |b| {
        b.iter(|| {
            v += 1.0;
            agg.offer(v, Utc::now());
            black_box(agg.flush());
        });
    });
}

criterion_group!(
    benches,
    bench_stats_full_history,
    bench_summary_12h,
    bench_flush_full_history
);
criterion_main!(benches);
