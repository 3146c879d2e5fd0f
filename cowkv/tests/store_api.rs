#![allow(clippy::expect_used)]
//! End-to-end behavior of the public store interface.

use std::collections::BTreeMap;

use cowkv::storage::{Comparator, Store, StoreOptions};
use cowkv::testing::test_store_options;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn keys_of(store: &Store, start: (&[u8], Comparator), end: Option<(&[u8], Comparator)>) -> Vec<Vec<u8>> {
    store
        .scan(start, end)
        .expect("scan")
        .map(|entry| entry.map(|(key, _)| key.to_vec()))
        .collect::<Result<_, _>>()
        .expect("entries")
}

#[test]
fn test_three_keys_stay_in_one_leaf() {
    let dir = tempdir().expect("create temp dir");
    let mut store =
        Store::open_with(&dir.path().join("s.cowkv"), &test_store_options()).expect("open");
    store.insert(b"a", b"1").expect("insert");
    store.insert(b"b", b"2").expect("insert");
    store.insert(b"m", b"3").expect("insert");
    assert_eq!(store.get(b"b").expect("get"), Some(&b"2"[..]));
    assert_eq!(store.stats().expect("stats").height, 1);
}

#[test]
fn test_two_hundred_keys_split_and_empty_again() {
    let dir = tempdir().expect("create temp dir");
    let path = dir.path().join("s.cowkv");
    let mut store = Store::open_with(&path, &test_store_options()).expect("open");
    let value = [b'v'; 100];
    for i in 0..200u32 {
        let key = format!("key-{i:03}-{}", "x".repeat(90));
        store.insert(key.as_bytes(), &value).expect("insert");
    }
    let stats = store.stats().expect("stats");
    assert!(stats.height >= 2, "height {}", stats.height);
    assert_eq!(stats.keys, 200);
    for i in 0..200u32 {
        let key = format!("key-{i:03}-{}", "x".repeat(90));
        assert_eq!(store.get(key.as_bytes()).expect("get"), Some(&value[..]));
    }
    store.check().expect("check");

    for i in 0..200u32 {
        let key = format!("key-{i:03}-{}", "x".repeat(90));
        assert!(store.delete(key.as_bytes()).expect("delete"));
    }
    let stats = store.stats().expect("stats");
    assert_eq!(stats.root, 0);
    assert_eq!(stats.keys, 0);
    store.check().expect("check");
}

#[test]
fn test_data_survives_reopen() {
    let dir = tempdir().expect("create temp dir");
    let path = dir.path().join("s.cowkv");
    {
        let mut store = Store::open_with(&path, &test_store_options()).expect("open");
        for i in 0..100u32 {
            store
                .upsert(format!("k{i:03}").as_bytes(), format!("v{i}").as_bytes())
                .expect("upsert");
        }
        store.delete(b"k050").expect("delete");
        store.close().expect("close");
    }
    for rehydrate in [false, true] {
        let options = test_store_options().with_rehydrate_on_open(rehydrate);
        let store = Store::open_with(&path, &options).expect("reopen");
        assert_eq!(store.get(b"k007").expect("get"), Some(&b"v7"[..]));
        assert_eq!(store.get(b"k050").expect("get"), None);
        let stats = store.stats().expect("stats");
        assert_eq!(stats.keys, 99);
        if rehydrate {
            assert_eq!(stats.resident_pages as u64, stats.flushed - 1);
        } else {
            assert_eq!(stats.resident_pages, 0);
        }
        store.check().expect("check");
        store.close().expect("close");
    }
}

#[test]
fn test_scans_in_both_directions() {
    let dir = tempdir().expect("create temp dir");
    let mut store =
        Store::open_with(&dir.path().join("s.cowkv"), &test_store_options()).expect("open");
    let mut expected: Vec<Vec<u8>> = (0..400u32).map(|i| format!("{i:05}").into_bytes()).collect();
    let mut txn = store.begin().expect("begin");
    for key in expected.iter().rev() {
        txn.insert(key, &[b'.'; 40]).expect("insert");
    }
    txn.commit().expect("commit");

    let ascending = keys_of(&store, (b"".as_slice(), Comparator::GreaterOrEqual), None);
    assert_eq!(ascending, expected);

    let descending = keys_of(&store, (b"99999".as_slice(), Comparator::LessOrEqual), None);
    expected.reverse();
    assert_eq!(descending, expected);

    let middle = keys_of(
        &store,
        (b"00100".as_slice(), Comparator::Greater),
        Some((b"00105".as_slice(), Comparator::LessOrEqual)),
    );
    let want: Vec<Vec<u8>> = (101..=105u32).map(|i| format!("{i:05}").into_bytes()).collect();
    assert_eq!(middle, want);

    let mut cursor = store
        .seek(b"00200", Comparator::Less)
        .expect("seek");
    assert_eq!(cursor.entry().expect("entry").map(|(k, _)| k), Some(&b"00199"[..]));
    cursor.move_next().expect("next");
    assert_eq!(cursor.entry().expect("entry").map(|(k, _)| k), Some(&b"00200"[..]));
}

#[test]
fn test_random_workload_matches_model() {
    let dir = tempdir().expect("create temp dir");
    let path = dir.path().join("s.cowkv");
    let options = StoreOptions::default().with_initial_mmap_bytes(4 * 4096);
    let mut store = Store::open_with(&path, &options).expect("open");
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(42);

    for round in 0..20u32 {
        let mut txn = store.begin().expect("begin");
        let mut staged = model.clone();
        for _ in 0..50 {
            let key = format!("k{:04}", rng.random_range(0..600u32)).into_bytes();
            if rng.random_bool(0.3) {
                let deleted = txn.delete(&key).expect("delete");
                assert_eq!(deleted, staged.remove(&key).is_some());
            } else {
                let len = rng.random_range(0..400usize);
                let value = vec![round.to_le_bytes()[0]; len];
                txn.upsert(&key, &value).expect("upsert");
                staged.insert(key, value);
            }
        }
        if round % 5 == 4 {
            txn.abort();
        } else {
            txn.commit().expect("commit");
            model = staged;
        }
        store.check().expect("check");

        if round % 7 == 6 {
            store.close().expect("close");
            store = Store::open_with(&path, &options).expect("reopen");
        }
    }

    let stored: Vec<(Vec<u8>, Vec<u8>)> = store
        .scan((b"".as_slice(), Comparator::GreaterOrEqual), None)
        .expect("scan")
        .map(|entry| entry.map(|(k, v)| (k.to_vec(), v.to_vec())))
        .collect::<Result<_, _>>()
        .expect("entries");
    let want: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(stored, want);
}
