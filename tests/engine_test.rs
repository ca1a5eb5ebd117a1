// End-to-end engine scenarios: transactional CRUD, secondary indexes,
// isolation levels, and the group-commit fast paths.

use std::sync::Arc;
use std::thread;

use docudb::{Database, DbError, Document, FindOptions, IsolationLevel, Options, SortOrder};
use serde_json::{json, Value};
use tempfile::tempdir;

/// Route the engine's tracing output through the test harness.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn doc(value: Value) -> Document {
    value.as_object().unwrap().clone()
}

#[test]
fn insert_then_read_in_one_transaction_and_across_reopen() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let db = Database::open(Options::new(dir.path())).unwrap();
        let users = db.create_collection("users").unwrap();

        let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        users
            .insert(&txn, doc(json!({"_id": "u1", "name": "Alice", "age": 30})))
            .unwrap();
        let found = users.find_by_id(&txn, "u1").unwrap().unwrap();
        assert_eq!(found["name"], json!("Alice"));
        assert_eq!(found["age"], json!(30));
        db.commit_transaction(&txn).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(Options::new(dir.path())).unwrap();
    let users = db.get_collection("users").unwrap();
    let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    assert!(users.find_by_id(&txn, "u1").unwrap().is_some());
    db.commit_transaction(&txn).unwrap();
    db.close().unwrap();
}

#[test]
fn secondary_index_maintenance_via_database() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    let users = db.create_collection("users").unwrap();

    let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    users
        .insert(&txn, doc(json!({"_id": "u1", "age": 25})))
        .unwrap();
    db.commit_transaction(&txn).unwrap();

    let t1 = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(users.find(&t1, "age", &json!(25)).unwrap().len(), 1);
    users
        .update(&t1, "u1", doc(json!({"_id": "u1", "age": 26})))
        .unwrap();
    db.commit_transaction(&t1).unwrap();

    let t2 = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(users.find(&t2, "age", &json!(25)).unwrap().len(), 0);
    assert_eq!(users.find(&t2, "age", &json!(26)).unwrap().len(), 1);
    users.delete(&t2, "u1").unwrap();
    db.commit_transaction(&t2).unwrap();

    let t3 = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(users.find(&t3, "age", &json!(25)).unwrap().len(), 0);
    assert_eq!(users.find(&t3, "age", &json!(26)).unwrap().len(), 0);
    db.commit_transaction(&t3).unwrap();
    db.close().unwrap();
}

#[test]
fn serializable_conflict_aborts_the_reader() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    let users = db.create_collection("users").unwrap();

    let setup = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    users
        .insert(&setup, doc(json!({"_id": "k", "v": 0})))
        .unwrap();
    db.commit_transaction(&setup).unwrap();

    let t1 = db.begin_transaction(IsolationLevel::Serializable).unwrap();
    users.find_by_id(&t1, "k").unwrap();

    let t2 = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    users
        .update(&t2, "k", doc(json!({"_id": "k", "v": 1})))
        .unwrap();
    db.commit_transaction(&t2).unwrap();

    users
        .insert(&t1, doc(json!({"_id": "other", "v": 9})))
        .unwrap();
    assert!(matches!(
        db.commit_transaction(&t1),
        Err(DbError::SerializationConflict)
    ));
    db.close().unwrap();
}

#[test]
fn repeatable_read_ignores_later_commits_read_uncommitted_does_not() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    let users = db.create_collection("users").unwrap();

    let setup = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    users
        .insert(&setup, doc(json!({"_id": "k", "v": "old"})))
        .unwrap();
    db.commit_transaction(&setup).unwrap();

    let frozen = db.begin_transaction(IsolationLevel::RepeatableRead).unwrap();
    let latest = db
        .begin_transaction(IsolationLevel::ReadUncommitted)
        .unwrap();
    assert_eq!(
        users.find_by_id(&frozen, "k").unwrap().unwrap()["v"],
        json!("old")
    );

    let writer = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    users
        .update(&writer, "k", doc(json!({"_id": "k", "v": "new"})))
        .unwrap();
    db.commit_transaction(&writer).unwrap();

    assert_eq!(
        users.find_by_id(&frozen, "k").unwrap().unwrap()["v"],
        json!("old"),
        "repeatable read stays on its snapshot"
    );
    assert_eq!(
        users.find_by_id(&latest, "k").unwrap().unwrap()["v"],
        json!("new"),
        "read uncommitted chases the newest version"
    );
    db.commit_transaction(&frozen).unwrap();
    db.commit_transaction(&latest).unwrap();
    db.close().unwrap();
}

#[test]
fn read_only_transactions_issue_no_barrier() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    let users = db.create_collection("users").unwrap();

    let setup = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    users
        .insert(&setup, doc(json!({"_id": "u1", "n": 1})))
        .unwrap();
    db.commit_transaction(&setup).unwrap();

    let before = db.wal_stats().fsyncs;
    for _ in 0..10 {
        let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        users.find_by_id(&txn, "u1").unwrap();
        db.commit_transaction(&txn).unwrap();
    }
    assert_eq!(
        db.wal_stats().fsyncs,
        before,
        "read-only commits must bypass the flusher barrier"
    );
    db.close().unwrap();
}

#[test]
fn concurrent_commits_batch_behind_shared_barriers() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(Options::new(dir.path())).unwrap());
    let users = db.create_collection("users").unwrap();

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let db = Arc::clone(&db);
            let users = Arc::clone(&users);
            thread::spawn(move || {
                let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
                users
                    .insert(&txn, doc(json!({"_id": format!("u{}", i), "n": i})))
                    .unwrap();
                db.commit_transaction(&txn).unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let stats = db.wal_stats();
    assert!(
        stats.fsyncs <= 8,
        "8 commits must need at most 8 barriers, saw {}",
        stats.fsyncs
    );

    let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    for i in 0..8 {
        assert!(users
            .find_by_id(&txn, &format!("u{}", i))
            .unwrap()
            .is_some());
    }
    db.commit_transaction(&txn).unwrap();
    db.close().unwrap();
}

#[test]
fn long_running_reader_does_not_block_writers() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    let users = db.create_collection("users").unwrap();

    let setup = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    users
        .insert(&setup, doc(json!({"_id": "k", "v": 0})))
        .unwrap();
    db.commit_transaction(&setup).unwrap();

    let reader = db.begin_transaction(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(
        users.find_by_id(&reader, "k").unwrap().unwrap()["v"],
        json!(0)
    );

    // Many writers commit while the reader's snapshot stays open.
    for round in 1..=20 {
        let writer = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        users
            .update(&writer, "k", doc(json!({"_id": "k", "v": round})))
            .unwrap();
        db.commit_transaction(&writer).unwrap();
    }

    assert_eq!(
        users.find_by_id(&reader, "k").unwrap().unwrap()["v"],
        json!(0),
        "the old snapshot must not observe any of the later commits"
    );
    db.commit_transaction(&reader).unwrap();
    db.close().unwrap();
}

#[test]
fn custom_wal_and_catalog_paths_are_honored() {
    init_tracing();
    let dir = tempdir().unwrap();
    let wal_dir = dir.path().join("log-elsewhere");
    let catalog_file = dir.path().join("meta.json");
    {
        let options = Options::new(dir.path().join("db"))
            .with_wal_path(&wal_dir)
            .with_catalog_path(&catalog_file)
            .with_buffer_pool_size(64);
        let db = Database::open(options).unwrap();
        let users = db.create_collection("users").unwrap();
        let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        users
            .insert(&txn, doc(json!({"_id": "u1", "n": 1})))
            .unwrap();
        db.commit_transaction(&txn).unwrap();
        db.close().unwrap();
    }
    assert!(wal_dir.exists(), "wal segments must land in the custom dir");
    assert!(catalog_file.exists(), "catalog must land at the custom path");

    let options = Options::new(dir.path().join("db"))
        .with_wal_path(&wal_dir)
        .with_catalog_path(&catalog_file);
    let db = Database::open(options).unwrap();
    let users = db.get_collection("users").unwrap();
    let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    assert!(users.find_by_id(&txn, "u1").unwrap().is_some());
    db.commit_transaction(&txn).unwrap();
    db.close().unwrap();
}

#[test]
fn wrong_encryption_key_surfaces_as_corrupt_page() {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let db = Database::open(Options::new(dir.path()).with_encryption_key([1u8; 32])).unwrap();
        let users = db.create_collection("users").unwrap();
        let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        users
            .insert(&txn, doc(json!({"_id": "u1", "n": 1})))
            .unwrap();
        db.commit_transaction(&txn).unwrap();
        db.close().unwrap();
    }

    // Replay reads the cataloged tree roots, which no longer authenticate.
    let result = Database::open(Options::new(dir.path()).with_encryption_key([2u8; 32]));
    assert!(matches!(result, Err(DbError::CorruptPage(_))));
}

#[test]
fn find_query_index_and_scan_paths_agree() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Database::open(Options::new(dir.path())).unwrap();
    let people = db.create_collection("people").unwrap();

    let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    for (id, city, age) in [
        ("a", "Oslo", 30),
        ("b", "Bergen", 45),
        ("c", "Oslo", 52),
        ("d", "Tromso", 19),
    ] {
        people
            .insert(&txn, doc(json!({"_id": id, "city": city, "age": age})))
            .unwrap();
    }
    db.commit_transaction(&txn).unwrap();

    let reader = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();

    // Index path: single equality.
    let oslo = people
        .find_query(&reader, &json!({"city": "Oslo"}), &FindOptions::default())
        .unwrap();
    assert_eq!(oslo.len(), 2);

    // Scan path: conjunction with a range.
    let opts = FindOptions {
        sort: Some(("age".to_string(), SortOrder::Ascending)),
        skip: None,
        limit: None,
    };
    let seniors = people
        .find_query(
            &reader,
            &json!({"$and": [{"city": "Oslo"}, {"age": {"$gt": 40}}]}),
            &opts,
        )
        .unwrap();
    assert_eq!(seniors.len(), 1);
    assert_eq!(seniors[0]["_id"], json!("c"));

    db.commit_transaction(&reader).unwrap();
    db.close().unwrap();
}
