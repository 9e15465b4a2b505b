//! Crash consistency: a torn or unfinished meta write falls back to the
//! previous committed state on reopen

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use tempfile::TempDir;
use vellumdb::{Database, DatabaseFlags, DurabilityMode, EnvBuilder};

const PAGE_SIZE: u64 = vellumdb::PAGE_SIZE as u64;

/// Flip one byte inside the meta record of the slot `txnid` selects,
/// simulating a write that never completed.
fn tear_meta_slot(dir: &TempDir, txnid: u64) {
    let slot_offset = (txnid % 2) * PAGE_SIZE;
    let data_path = dir.path().join("data.vdb");
    let mut file = OpenOptions::new().read(true).write(true).open(data_path).unwrap();

    // Corrupt a byte in the middle of the record, past the page header
    file.seek(SeekFrom::Start(slot_offset + 64)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(slot_offset + 64)).unwrap();
    file.write_all(&byte).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn torn_meta_recovers_previous_state() {
    let dir = TempDir::new().unwrap();

    let last_txnid = {
        let env = EnvBuilder::new()
            .durability(DurabilityMode::FullSync)
            .open(dir.path())
            .unwrap();

        let mut txn = env.begin_write_txn().unwrap();
        let db: Database<String, String> =
            env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        db.put(&mut txn, &"stable".to_string(), &"first".to_string()).unwrap();
        txn.commit().unwrap();

        // The transaction whose meta write we will tear
        let mut txn = env.begin_write_txn().unwrap();
        db.put(&mut txn, &"stable".to_string(), &"second".to_string()).unwrap();
        db.put(&mut txn, &"extra".to_string(), &"lost".to_string()).unwrap();
        txn.commit().unwrap();

        env.info().unwrap().last_txnid
    };

    tear_meta_slot(&dir, last_txnid);

    // Reopen: the previous committed state is intact, the torn one is gone
    let env = EnvBuilder::new().open(dir.path()).unwrap();
    assert_eq!(env.info().unwrap().last_txnid, last_txnid - 1);

    let txn = env.begin_txn().unwrap();
    let db: Database<String, String> =
        env.open_database(&txn, None, DatabaseFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, &"stable".to_string()).unwrap(), Some("first".to_string()));
    assert_eq!(db.get(&txn, &"extra".to_string()).unwrap(), None);
}

#[test]
fn store_keeps_working_after_recovery() {
    let dir = TempDir::new().unwrap();

    let last_txnid = {
        let env = EnvBuilder::new()
            .durability(DurabilityMode::FullSync)
            .open(dir.path())
            .unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let db: Database<String, String> =
            env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        for i in 0..100 {
            db.put(&mut txn, &format!("key{i:03}"), &format!("v{i:03}")).unwrap();
        }
        txn.commit().unwrap();

        let mut txn = env.begin_write_txn().unwrap();
        db.put(&mut txn, &"doomed".to_string(), &"x".to_string()).unwrap();
        txn.commit().unwrap();
        env.info().unwrap().last_txnid
    };

    tear_meta_slot(&dir, last_txnid);

    let env = EnvBuilder::new().open(dir.path()).unwrap();
    let db: Database<String, String> = {
        let txn = env.begin_txn().unwrap();
        env.open_database(&txn, None, DatabaseFlags::empty()).unwrap()
    };

    // New commits on top of the recovered state work normally
    {
        let mut txn = env.begin_write_txn().unwrap();
        db.put(&mut txn, &"after".to_string(), &"recovery".to_string()).unwrap();
        txn.commit().unwrap();
    }

    let txn = env.begin_txn().unwrap();
    assert_eq!(db.get(&txn, &"doomed".to_string()).unwrap(), None);
    assert_eq!(db.get(&txn, &"after".to_string()).unwrap(), Some("recovery".to_string()));
    assert_eq!(db.get(&txn, &"key050".to_string()).unwrap(), Some("v050".to_string()));
}

#[test]
fn both_meta_slots_torn_is_reported_as_corruption() {
    let dir = TempDir::new().unwrap();

    {
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let db: Database<String, String> =
            env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        db.put(&mut txn, &"k".to_string(), &"v".to_string()).unwrap();
        txn.commit().unwrap();
    }

    tear_meta_slot(&dir, 0);
    tear_meta_slot(&dir, 1);

    assert!(EnvBuilder::new().open(dir.path()).is_err());
}
