//! Randomized round-trips: everything inserted comes back, in order

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::ops::Bound;
use tempfile::TempDir;
use vellumdb::{Database, DatabaseFlags, EnvBuilder};

#[test]
fn random_keys_round_trip_through_reopen() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(0xD1CE);

    let mut keys = BTreeSet::new();
    while keys.len() < 1000 {
        let len = rng.gen_range(1..=64);
        let key: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        keys.insert(key);
    }

    {
        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let mut txn = env.begin_write_txn().unwrap();
        let db: Database = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        for key in &keys {
            db.put(&mut txn, key, key).unwrap();
        }
        txn.commit().unwrap();
    }

    // Close, reopen, scan end to end: sorted and complete
    let env = EnvBuilder::new().open(dir.path()).unwrap();
    let txn = env.begin_txn().unwrap();
    let db: Database = env.open_database(&txn, None, DatabaseFlags::empty()).unwrap();
    assert_eq!(db.len(&txn).unwrap(), keys.len() as u64);

    let scanned: Vec<Vec<u8>> = db
        .range(&txn, Bound::Unbounded, Bound::Unbounded, false)
        .unwrap()
        .map(|item| item.unwrap().0)
        .collect();
    let expected: Vec<Vec<u8>> = keys.iter().cloned().collect();
    assert_eq!(scanned, expected);

    for key in &keys {
        assert_eq!(db.get(&txn, key).unwrap(), Some(key.clone()));
    }
}

#[test]
fn interleaved_inserts_and_deletes_stay_consistent() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().open(dir.path()).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    let db: Database = {
        let mut txn = env.begin_write_txn().unwrap();
        let db = env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
        txn.commit().unwrap();
        db
    };

    let mut model = BTreeSet::new();
    for round in 0..20 {
        let mut txn = env.begin_write_txn().unwrap();
        for _ in 0..100 {
            let key = format!("key{:04}", rng.gen_range(0..500)).into_bytes();
            if rng.gen_bool(0.7) {
                db.put(&mut txn, &key, &key).unwrap();
                model.insert(key);
            } else {
                let existed = db.delete(&mut txn, &key).unwrap();
                assert_eq!(existed, model.remove(&key), "round {round}");
            }
        }
        txn.commit().unwrap();

        let check = env.begin_txn().unwrap();
        assert_eq!(db.len(&check).unwrap(), model.len() as u64);
    }

    let txn = env.begin_txn().unwrap();
    let scanned: Vec<Vec<u8>> = db
        .range(&txn, Bound::Unbounded, Bound::Unbounded, false)
        .unwrap()
        .map(|item| item.unwrap().0)
        .collect();
    let expected: Vec<Vec<u8>> = model.iter().cloned().collect();
    assert_eq!(scanned, expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn inserted_set_equals_scanned_set(
        keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 1..32), 1..200)
    ) {
        let dir = TempDir::new().unwrap();
        {
            let env = EnvBuilder::new().open(dir.path()).unwrap();
            let mut txn = env.begin_write_txn().unwrap();
            let db: Database =
                env.create_database(&mut txn, None, DatabaseFlags::empty()).unwrap();
            for key in &keys {
                db.put(&mut txn, key, &b"v".to_vec()).unwrap();
            }
            txn.commit().unwrap();
        }

        let env = EnvBuilder::new().open(dir.path()).unwrap();
        let txn = env.begin_txn().unwrap();
        let db: Database = env.open_database(&txn, None, DatabaseFlags::empty()).unwrap();
        let scanned: Vec<Vec<u8>> = db
            .range(&txn, Bound::Unbounded, Bound::Unbounded, false)
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        let expected: Vec<Vec<u8>> = keys.iter().cloned().collect();
        prop_assert_eq!(scanned, expected);
    }
}
