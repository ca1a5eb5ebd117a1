use criterion::{black_box, criterion_group, criterion_main, Criterion};
use docudb::{Database, IsolationLevel, Options};
use serde_json::json;
use tempfile::tempdir;

fn bench_insert_commit(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    let users = db.create_collection("users").unwrap();
    let mut i = 0u64;

    c.bench_function("insert_commit", |b| {
        b.iter(|| {
            let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
            let doc = json!({"_id": format!("u{}", i), "n": i})
                .as_object()
                .unwrap()
                .clone();
            users.insert(&txn, doc).unwrap();
            db.commit_transaction(&txn).unwrap();
            i += 1;
        })
    });
}

fn bench_point_read(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    let users = db.create_collection("users").unwrap();

    let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    for i in 0..1000u64 {
        let doc = json!({"_id": format!("u{}", i), "n": i})
            .as_object()
            .unwrap()
            .clone();
        users.insert(&txn, doc).unwrap();
    }
    db.commit_transaction(&txn).unwrap();

    c.bench_function("find_by_id", |b| {
        b.iter(|| {
            let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
            black_box(users.find_by_id(&txn, "u500").unwrap());
            db.commit_transaction(&txn).unwrap();
        })
    });
}

criterion_group!(benches, bench_insert_commit, bench_point_read);
criterion_main!(benches);
