//! Basic put/get/delete behavior and persistence across reopen

use tempfile::TempDir;
use vellumdb::{Database, DatabaseFlags, EnvBuilder, Environment, RwTxn};

fn open_env(dir: &TempDir) -> Environment {
    EnvBuilder::new().map_size(1 << 24).open(dir.path()).unwrap()
}

fn main_db(env: &Environment, txn: &mut RwTxn) -> Database<String, String> {
    env.create_database(txn, None, DatabaseFlags::empty()).unwrap()
}

#[test]
fn put_then_get() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let db = {
        let mut txn = env.begin_write_txn().unwrap();
        let db = main_db(&env, &mut txn);
        db.put(&mut txn, &"alpha".to_string(), &"1".to_string()).unwrap();
        db.put(&mut txn, &"beta".to_string(), &"2".to_string()).unwrap();
        db.put(&mut txn, &"gamma".to_string(), &"3".to_string()).unwrap();
        txn.commit().unwrap();
        db
    };

    let txn = env.begin_txn().unwrap();
    assert_eq!(db.get(&txn, &"alpha".to_string()).unwrap(), Some("1".to_string()));
    assert_eq!(db.get(&txn, &"beta".to_string()).unwrap(), Some("2".to_string()));
    assert_eq!(db.get(&txn, &"gamma".to_string()).unwrap(), Some("3".to_string()));
    assert_eq!(db.get(&txn, &"delta".to_string()).unwrap(), None);
}

#[test]
fn values_survive_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let env = open_env(&dir);
        let mut txn = env.begin_write_txn().unwrap();
        let db = main_db(&env, &mut txn);
        for i in 0..50 {
            db.put(&mut txn, &format!("key{i:03}"), &format!("value{i:03}")).unwrap();
        }
        txn.commit().unwrap();
    }

    let env = open_env(&dir);
    let txn = env.begin_txn().unwrap();
    let db: Database<String, String> =
        env.open_database(&txn, None, DatabaseFlags::empty()).unwrap();
    for i in 0..50 {
        assert_eq!(db.get(&txn, &format!("key{i:03}")).unwrap(), Some(format!("value{i:03}")));
    }
    assert_eq!(db.len(&txn).unwrap(), 50);
}

#[test]
fn replace_updates_value() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write_txn().unwrap();
    let db = main_db(&env, &mut txn);
    db.put(&mut txn, &"k".to_string(), &"old".to_string()).unwrap();
    db.put(&mut txn, &"k".to_string(), &"new".to_string()).unwrap();
    assert_eq!(db.get(&txn, &"k".to_string()).unwrap(), Some("new".to_string()));
    assert_eq!(db.len(&txn).unwrap(), 1);
}

#[test]
fn delete_missing_key_is_false_not_an_error() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write_txn().unwrap();
    let db = main_db(&env, &mut txn);
    db.put(&mut txn, &"present".to_string(), &"v".to_string()).unwrap();

    assert!(!db.delete(&mut txn, &"absent".to_string()).unwrap());
    assert!(db.delete(&mut txn, &"present".to_string()).unwrap());
    assert!(!db.delete(&mut txn, &"present".to_string()).unwrap());
    assert_eq!(db.len(&txn).unwrap(), 0);
}

#[test]
fn deleted_keys_read_as_absent_after_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let env = open_env(&dir);
        let mut txn = env.begin_write_txn().unwrap();
        let db = main_db(&env, &mut txn);
        db.put(&mut txn, &"keep".to_string(), &"v".to_string()).unwrap();
        db.put(&mut txn, &"drop".to_string(), &"v".to_string()).unwrap();
        txn.commit().unwrap();

        let mut txn = env.begin_write_txn().unwrap();
        db.delete(&mut txn, &"drop".to_string()).unwrap();
        txn.commit().unwrap();
    }

    let env = open_env(&dir);
    let txn = env.begin_txn().unwrap();
    let db: Database<String, String> =
        env.open_database(&txn, None, DatabaseFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, &"keep".to_string()).unwrap(), Some("v".to_string()));
    assert_eq!(db.get(&txn, &"drop".to_string()).unwrap(), None);
}

#[test]
fn large_values_round_trip() {
    let dir = TempDir::new().unwrap();

    let value: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    {
        let env = open_env(&dir);
        let mut txn = env.begin_write_txn().unwrap();
        let db: Database = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        db.put(&mut txn, &b"big".to_vec(), &value).unwrap();
        txn.commit().unwrap();
    }

    let env = open_env(&dir);
    let txn = env.begin_txn().unwrap();
    let db: Database = env.open_database(&txn, None, DatabaseFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, &b"big".to_vec()).unwrap(), Some(value));
    assert!(db.stat(&txn).unwrap().overflow_pages > 0);
}

#[test]
fn statistics_reflect_tree_shape() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write_txn().unwrap();
    let db = main_db(&env, &mut txn);
    for i in 0..1000 {
        db.put(&mut txn, &format!("key{i:05}"), &format!("value{i:05}")).unwrap();
    }
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 1000);
    assert!(stat.depth >= 2);
    assert!(stat.leaf_pages > 1);
    assert!(stat.branch_pages >= 1);
    txn.commit().unwrap();

    let info = env.info().unwrap();
    assert!(info.last_pgno > 3);
    assert!(info.last_txnid >= 2);
    assert_eq!(info.num_readers, 0);
}
