//! Append-mode writes: fast path for ascending keys, OutOfOrder otherwise

use tempfile::TempDir;
use vellumdb::{Database, DatabaseFlags, EnvBuilder, Error, WriteFlags};

#[test]
fn ascending_appends_succeed() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().open(dir.path()).unwrap();

    let db: Database = {
        let mut txn = env.begin_write_txn().unwrap();
        let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        for i in 0..2000u32 {
            let key = format!("key{i:06}").into_bytes();
            db.put_with_flags(&mut txn, &key, &b"v".to_vec(), WriteFlags::APPEND).unwrap();
        }
        txn.commit().unwrap();
        db
    };

    let txn = env.begin_txn().unwrap();
    assert_eq!(db.len(&txn).unwrap(), 2000);
    let mut cursor = db.cursor(&txn).unwrap();
    let mut prev: Option<Vec<u8>> = None;
    let mut count = 0;
    while let Some((key, _)) = cursor.next().unwrap() {
        if let Some(p) = &prev {
            assert!(p < &key);
        }
        prev = Some(key);
        count += 1;
    }
    assert_eq!(count, 2000);
}

#[test]
fn out_of_order_append_fails_and_leaves_tree_unchanged() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().open(dir.path()).unwrap();

    let mut txn = env.begin_write_txn().unwrap();
    let db: Database<u64, String> =
        env.create_database(&mut txn, None, DatabaseFlags::INTEGER_KEY).unwrap();

    db.put_with_flags(&mut txn, &10u64, &"ten".to_string(), WriteFlags::APPEND).unwrap();
    let err =
        db.put_with_flags(&mut txn, &5u64, &"five".to_string(), WriteFlags::APPEND).unwrap_err();
    assert!(matches!(err, Error::OutOfOrder));

    // Equal keys are out of order too
    let err =
        db.put_with_flags(&mut txn, &10u64, &"again".to_string(), WriteFlags::APPEND).unwrap_err();
    assert!(matches!(err, Error::OutOfOrder));

    assert_eq!(db.len(&txn).unwrap(), 1);
    assert_eq!(db.get(&txn, &10u64).unwrap(), Some("ten".to_string()));
    assert_eq!(db.get(&txn, &5u64).unwrap(), None);
}

#[test]
fn append_interleaves_with_regular_commits() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().open(dir.path()).unwrap();

    let db: Database = {
        let mut txn = env.begin_write_txn().unwrap();
        let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        for i in 0..100u32 {
            let key = format!("a{i:04}").into_bytes();
            db.put_with_flags(&mut txn, &key, &b"v".to_vec(), WriteFlags::APPEND).unwrap();
        }
        txn.commit().unwrap();
        db
    };

    // A later transaction keeps appending past the committed maximum
    {
        let mut txn = env.begin_write_txn().unwrap();
        for i in 0..100u32 {
            let key = format!("b{i:04}").into_bytes();
            db.put_with_flags(&mut txn, &key, &b"v".to_vec(), WriteFlags::APPEND).unwrap();
        }
        txn.commit().unwrap();
    }

    let txn = env.begin_txn().unwrap();
    assert_eq!(db.len(&txn).unwrap(), 200);
}
