use criterion::{criterion_group, criterion_main, Criterion};
use tundra::memindex::MemIndex;
use tundra::{Lsn, Record, ValueKind};

fn memindex_insert(c: &mut Criterion) {
    c.bench_function("memindex insert", |b| {
        let index = MemIndex::default();
        let mut lsn = 0u64;

        b.iter(|| {
            lsn += 1;
            index.insert(Record::from_components(
                format!("key-{:010}", lsn % 100_000),
                b"value".to_vec(),
                lsn,
                ValueKind::Value,
            ));
        });
    });
}

fn memindex_point_read(c: &mut Criterion) {
    let index = MemIndex::default();

    for n in 0..100_000u64 {
        index.insert(Record::from_components(
            format!("key-{n:010}"),
            b"value".to_vec(),
            n + 1,
            ValueKind::Value,
        ));
    }

    c.bench_function("memindex point read", |b| {
        let mut n = 0u64;

        b.iter(|| {
            n = (n + 7919) % 100_000;
            index.get(format!("key-{n:010}").as_bytes(), Lsn::MAX)
        });
    });
}

fn memindex_mvcc_read(c: &mut Criterion) {
    let index = MemIndex::default();

    // 1000 keys with 100 versions each
    for version in 0..100u64 {
        for key in 0..1000u64 {
            index.insert(Record::from_components(
                format!("key-{key:05}"),
                b"value".to_vec(),
                version * 1000 + key + 1,
                ValueKind::Value,
            ));
        }
    }

    c.bench_function("memindex versioned read", |b| {
        let mut n = 0u64;

        b.iter(|| {
            n = (n + 13) % 1000;
            index.get(format!("key-{n:05}").as_bytes(), 50_000)
        });
    });
}

criterion_group!(
    benches,
    memindex_insert,
    memindex_point_read,
    memindex_mvcc_read
);
criterion_main!(benches);
