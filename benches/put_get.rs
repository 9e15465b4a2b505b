use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;
use vellumdb::{Database, DatabaseFlags, EnvBuilder, Environment, WriteFlags};

fn seeded(n: usize) -> (TempDir, Environment, Database) {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new()
        .map_size(1 << 28)
        .durability(vellumdb::DurabilityMode::WriteBack)
        .open(dir.path())
        .unwrap();
    let db = {
        let mut txn = env.begin_write_txn().unwrap();
        let db: Database = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        for i in 0..n {
            let key = format!("key{i:08}").into_bytes();
            db.put(&mut txn, &key, &vec![0xAB; 100]).unwrap();
        }
        txn.commit().unwrap();
        db
    };
    (dir, env, db)
}

fn bench_sequential_put(c: &mut Criterion) {
    c.bench_function("put/sequential_1k", |b| {
        b.iter_batched(
            || seeded(0),
            |(_dir, env, db)| {
                let mut txn = env.begin_write_txn().unwrap();
                for i in 0..1000 {
                    let key = format!("key{i:08}").into_bytes();
                    db.put_with_flags(&mut txn, &key, &vec![0xCD; 100], WriteFlags::APPEND)
                        .unwrap();
                }
                txn.commit().unwrap();
            },
            BatchSize::PerIteration,
        )
    });
}

fn bench_random_get(c: &mut Criterion) {
    let (_dir, env, db) = seeded(10_000);
    c.bench_function("get/random_from_10k", |b| {
        let txn = env.begin_txn().unwrap();
        let mut i = 0usize;
        b.iter(|| {
            // Stride through the keyspace out of order
            i = (i + 6151) % 10_000;
            let key = format!("key{i:08}").into_bytes();
            criterion::black_box(db.get(&txn, &key).unwrap());
        })
    });
}

fn bench_cursor_scan(c: &mut Criterion) {
    let (_dir, env, db) = seeded(10_000);
    c.bench_function("scan/full_10k", |b| {
        b.iter(|| {
            let txn = env.begin_txn().unwrap();
            let mut cursor = db.cursor(&txn).unwrap();
            let mut count = 0;
            while let Some(_) = cursor.next().unwrap() {
                count += 1;
            }
            criterion::black_box(count)
        })
    });
}

criterion_group!(benches, bench_sequential_put, bench_random_get, bench_cursor_scan);
criterion_main!(benches);
