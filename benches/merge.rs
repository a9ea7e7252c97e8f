use criterion::{criterion_group, criterion_main, Criterion};
use tundra::merge::Merger;
use tundra::read_stream::VisibilityStream;
use tundra::{Record, ValueKind};

fn records(source: u64, count: u64) -> Vec<Record> {
    (0..count)
        .map(|n| {
            Record::from_components(
                format!("key-{:08}", n * 10 + source),
                b"value".to_vec(),
                n + 1,
                ValueKind::Value,
            )
        })
        .collect()
}

fn merge_sources(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for source_count in [2usize, 4, 8] {
        let sources = (0..source_count as u64)
            .map(|idx| records(idx, 10_000))
            .collect::<Vec<_>>();

        group.bench_function(format!("{source_count} sources"), |b| {
            b.iter(|| {
                let iters = sources
                    .iter()
                    .map(|source| {
                        Box::new(source.iter().cloned().map(Ok)) as tundra::BoxedIterator<'_>
                    })
                    .collect::<Vec<_>>();

                Merger::new(iters).count()
            });
        });
    }

    group.finish();
}

fn merge_with_visibility_filter(c: &mut Criterion) {
    // overlapping keys across sources, so the filter actually dedups
    let newer = (0..10_000u64)
        .map(|n| {
            Record::from_components(
                format!("key-{n:08}"),
                b"new".to_vec(),
                20_000 + n,
                ValueKind::Value,
            )
        })
        .collect::<Vec<_>>();

    let older = (0..10_000u64)
        .map(|n| {
            Record::from_components(format!("key-{n:08}"), b"old".to_vec(), n + 1, ValueKind::Value)
        })
        .collect::<Vec<_>>();

    c.bench_function("merge + visibility fold", |b| {
        b.iter(|| {
            let iters = vec![
                Box::new(newer.iter().cloned().map(Ok)) as tundra::BoxedIterator<'_>,
                Box::new(older.iter().cloned().map(Ok)) as tundra::BoxedIterator<'_>,
            ];

            VisibilityStream::new(Merger::new(iters), u64::MAX, None).count()
        });
    });
}

criterion_group!(benches, merge_sources, merge_with_visibility_filter);
criterion_main!(benches);
