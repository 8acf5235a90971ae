//! Benchmarks for the k-way merge
//!
//! Run with: cargo bench -p gridscale-core --bench merge_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gridscale_core::merge::{MergeCursor, RowCursor};
use gridscale_core::Row;

/// `width` sorted cursors over the same tags; every fourth key is duplicated
/// in the next cursor with a newer insert time
fn cursors(width: usize, rows_per_cursor: usize) -> Vec<Vec<Row>> {
    (0..width)
        .map(|c| {
            (0..rows_per_cursor)
                .map(|i| {
                    let shared = i % 4 == 0;
                    let sample_time = if shared { i as i64 } else { (i * width + c) as i64 };
                    Row {
                        sample_time,
                        insert_time: c as i64,
                        numeric: i as f64,
                        other: None,
                        tag: format!("tag-{:04}", i % 16),
                    }
                })
                .collect::<Vec<_>>()
        })
        .map(|mut rows| {
            rows.sort_by(|a, b| a.cmp_key(b));
            rows
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("k_way_merge");
    let rows_per_cursor = 10_000;

    for width in [2usize, 8, 32] {
        let input = cursors(width, rows_per_cursor);
        group.throughput(Throughput::Elements((width * rows_per_cursor) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &input, |b, input| {
            b.iter(|| {
                let cursors: Vec<RowCursor> = input
                    .iter()
                    .map(|rows| Box::new(rows.clone().into_iter().map(Ok)) as RowCursor)
                    .collect();
                let mut merge = MergeCursor::new(cursors);
                let mut total = 0;
                loop {
                    let page = merge.next_page(1000).expect("merge failed");
                    if page.is_empty() {
                        break;
                    }
                    total += page.len();
                }
                black_box(total)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_merge);
criterion_main!(benches);
