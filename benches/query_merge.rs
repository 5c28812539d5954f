//! Scatter-gather merge benchmark

use shardhouse::query::aggregate::AggState;
use shardhouse::query::merge::{k_way_merge, sort_rows};
use shardhouse::query::{OrderBy, ResultRow, SortField};
use shardhouse::schema::{Row, StoredRow};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn shard_rows(shard: u32, rows: usize, order: OrderBy) -> Vec<ResultRow> {
    let mut out: Vec<ResultRow> = (0..rows)
        .map(|i| {
            let key = format!("key-{:08}", (i * 7919 + shard as usize * 31) % 1_000_000);
            let row = Row::new(key, 1_704_067_200_000_000_000 + i as i64 * 1_000)
                .with_value((i % 1000) as f64);
            ResultRow {
                shard,
                row: StoredRow {
                    row,
                    seq: i as u64 + 1,
                    ordinal: 0,
                },
            }
        })
        .collect();
    sort_rows(&mut out, order);
    out
}

fn benchmark_k_way_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("k_way_merge");
    for (field, descending) in [(SortField::Key, false), (SortField::Value, true)] {
        let order = OrderBy { field, descending };
        for shards in [4u32, 16, 64] {
            let streams: Vec<Vec<ResultRow>> =
                (0..shards).map(|s| shard_rows(s, 1_000, order)).collect();
            let total = shards as u64 * 1_000;
            group.throughput(Throughput::Elements(total));
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}/desc={}", field, descending), shards),
                &streams,
                |b, streams| {
                    b.iter(|| k_way_merge(black_box(streams.clone()), order, total as usize))
                },
            );
        }
    }
    group.finish();
}

fn benchmark_partial_aggregate_merge(c: &mut Criterion) {
    let partials: Vec<AggState> = (0..1024)
        .map(|s| {
            let mut state = AggState::default();
            for i in 0..100 {
                state.observe(Some((s * 100 + i) as f64));
            }
            state
        })
        .collect();

    let mut group = c.benchmark_group("aggregate_merge");
    group.throughput(Throughput::Elements(partials.len() as u64));
    group.bench_function("merge_1024_partials", |b| {
        b.iter(|| {
            let mut total = AggState::default();
            for partial in &partials {
                total.merge(black_box(partial));
            }
            total
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_k_way_merge, benchmark_partial_aggregate_merge);
criterion_main!(benches);
