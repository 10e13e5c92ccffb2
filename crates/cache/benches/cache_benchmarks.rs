use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use jobflow_cache::{CacheConfig, CacheManager, EvictionStrategy};
use serde_json::{Value, json};

fn filled(max_size: usize, strategy: EvictionStrategy) -> CacheManager<Value> {
    let cache = CacheManager::new(
        CacheConfig::default()
            .with_max_size(max_size)
            .with_strategy(strategy),
    );
    for i in 0..max_size {
        cache.insert(format!("key:{i}"), json!({ "text": "cached", "index": i }));
    }
    cache
}

/// Inserting new keys into a full cache: every set evicts one entry.
fn bench_set_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_with_eviction");

    for strategy in [EvictionStrategy::Lru, EvictionStrategy::Lfu, EvictionStrategy::Ttl] {
        for size in [100usize, 1_000] {
            group.throughput(Throughput::Elements(1));
            group.bench_with_input(
                BenchmarkId::new(format!("{strategy:?}"), size),
                &size,
                |b, &size| {
                    let cache = filled(size, strategy);
                    let mut next = size;
                    b.iter(|| {
                        next += 1;
                        cache.insert(format!("key:{next}"), black_box(json!(next)));
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_get_hit(c: &mut Criterion) {
    let cache = filled(1_000, EvictionStrategy::Lru);
    c.bench_function("get_hit", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % 1_000;
            black_box(cache.get(&format!("key:{i}")));
        });
    });
}

criterion_group!(benches, bench_set_with_eviction, bench_get_hit);
criterion_main!(benches);
