//! Page recycling: steady-state churn must not grow the file without bound

use tempfile::TempDir;
use vellumdb::{Database, DatabaseFlags, EnvBuilder};

#[test]
fn overwrite_churn_reuses_pages() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let db: Database<String, String> = {
        let mut txn = env.begin_write_txn().unwrap();
        let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        for i in 0..200 {
            db.put(&mut txn, &format!("key{i:03}"), &"seed".to_string()).unwrap();
        }
        txn.commit().unwrap();
        db
    };

    // Warm up: let the allocator reach its steady state
    for round in 0..10 {
        let mut txn = env.begin_write_txn().unwrap();
        for i in 0..200 {
            db.put(&mut txn, &format!("key{i:03}"), &format!("round{round}")).unwrap();
        }
        txn.commit().unwrap();
    }
    let after_warmup = env.info().unwrap().last_pgno;

    // The same workload over and over: retired pages must recycle
    for round in 10..60 {
        let mut txn = env.begin_write_txn().unwrap();
        for i in 0..200 {
            db.put(&mut txn, &format!("key{i:03}"), &format!("round{round}")).unwrap();
        }
        txn.commit().unwrap();
    }
    let after_churn = env.info().unwrap().last_pgno;

    assert!(
        after_churn < after_warmup + 200,
        "file grew from {after_warmup} to {after_churn} pages under steady churn"
    );

    // Content stays correct throughout
    let txn = env.begin_txn().unwrap();
    for i in 0..200 {
        assert_eq!(
            db.get(&txn, &format!("key{i:03}")).unwrap(),
            Some("round59".to_string())
        );
    }
}

#[test]
fn pinned_reader_defers_reuse_without_breaking_either_side() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap();

    let db: Database<String, String> = {
        let mut txn = env.begin_write_txn().unwrap();
        let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        for i in 0..100 {
            db.put(&mut txn, &format!("key{i:03}"), &"original".to_string()).unwrap();
        }
        txn.commit().unwrap();
        db
    };

    // Pin a snapshot, then churn hard on top of it
    let reader = env.begin_txn().unwrap();
    for round in 0..20 {
        let mut txn = env.begin_write_txn().unwrap();
        for i in 0..100 {
            db.put(&mut txn, &format!("key{i:03}"), &format!("round{round}")).unwrap();
        }
        txn.commit().unwrap();
    }

    // The pinned snapshot still reads its original values
    for i in 0..100 {
        assert_eq!(
            db.get(&reader, &format!("key{i:03}")).unwrap(),
            Some("original".to_string())
        );
    }
    drop(reader);

    // And the current state is the last round
    let txn = env.begin_txn().unwrap();
    assert_eq!(db.get(&txn, &"key050".to_string()).unwrap(), Some("round19".to_string()));
}
