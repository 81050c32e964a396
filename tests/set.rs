use std::collections::BTreeSet;

use concurrent_bst::{ConcurrentSet, FineGrainedBst, IdentityKey, LockFreeBst};
use crossbeam_utils::thread::scope;
use rand::prelude::*;
use rand::rngs::StdRng;

fn fine_grained() -> FineGrainedBst<u64, IdentityKey> {
    FineGrainedBst::with_key_fn(IdentityKey)
}

fn lock_free() -> LockFreeBst<u64, IdentityKey> {
    LockFreeBst::with_key_fn_and_threads(IdentityKey, 16)
}

/// Runs a seeded random single-threaded workload and compares every answer with `BTreeSet`.
fn matches_reference_model<S: ConcurrentSet<u64>>(set: &S) {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut model = BTreeSet::new();
    let mut handle = set.handle();
    for _ in 0..20_000 {
        let key = rng.gen_range(0..512u64);
        match rng.gen_range(0..3) {
            0 => assert_eq!(set.insert(&mut handle, key), model.insert(key), "insert {}", key),
            1 => assert_eq!(set.remove(&mut handle, &key), model.remove(&key), "remove {}", key),
            _ => assert_eq!(set.find(&mut handle, &key), model.contains(&key), "find {}", key),
        }
    }
    assert_eq!(set.len(), model.len());
    for key in 0..512u64 {
        assert_eq!(set.find(&mut handle, &key), model.contains(&key));
    }
}

fn honors_duplicate_contract<S: ConcurrentSet<u64>>(set: &S) {
    let mut handle = set.handle();
    assert!(set.insert(&mut handle, 42));
    assert!(!set.insert(&mut handle, 42));
    assert!(set.find(&mut handle, &42));
    assert_eq!(set.len(), 1);
    assert!(set.remove(&mut handle, &42));
    assert!(!set.remove(&mut handle, &42));
    assert!(!set.find(&mut handle, &42));
    assert!(set.is_empty());
}

fn runs_example_scenario<S: ConcurrentSet<u64>>(set: &S) {
    let mut handle = set.handle();
    assert!(set.insert(&mut handle, 1));
    assert!(set.insert(&mut handle, 5));
    assert!(set.insert(&mut handle, 3));
    assert!(set.find(&mut handle, &5));
    assert!(!set.find(&mut handle, &9));
    assert!(set.remove(&mut handle, &5));
    assert!(!set.find(&mut handle, &5));
    assert!(set.find(&mut handle, &3));
}

/// Each thread inserts, then removes, its own block of keys.
fn survives_disjoint_blocks<S: ConcurrentSet<u64> + Sync>(set: &S) {
    const THREADS: u64 = 8;
    const BLOCK: u64 = 1000;

    scope(|s| {
        for t in 0..THREADS {
            s.spawn(move |_| {
                let mut handle = set.handle();
                for key in t * BLOCK..(t + 1) * BLOCK {
                    assert!(set.insert(&mut handle, key));
                }
            });
        }
    })
    .unwrap();

    let mut handle = set.handle();
    for key in 0..THREADS * BLOCK {
        assert!(set.find(&mut handle, &key), "{} missing", key);
    }
    for key in THREADS * BLOCK..(THREADS + 1) * BLOCK {
        assert!(!set.find(&mut handle, &key), "{} never inserted", key);
    }
    assert_eq!(set.len(), (THREADS * BLOCK) as usize);
    drop(handle);

    scope(|s| {
        for t in 0..THREADS {
            s.spawn(move |_| {
                let mut handle = set.handle();
                for key in t * BLOCK..(t + 1) * BLOCK {
                    assert!(set.remove(&mut handle, &key));
                }
            });
        }
    })
    .unwrap();

    let mut handle = set.handle();
    for key in 0..THREADS * BLOCK {
        assert!(!set.find(&mut handle, &key), "{} still present", key);
    }
    assert!(set.is_empty());
}

fn answers_find_consistently<S: ConcurrentSet<u64>>(set: &S) {
    let mut handle = set.handle();
    for key in (0..200u64).step_by(3) {
        set.insert(&mut handle, key);
    }
    let first: Vec<bool> = (0..200u64).map(|k| set.find(&mut handle, &k)).collect();
    for _ in 0..3 {
        let again: Vec<bool> = (0..200u64).map(|k| set.find(&mut handle, &k)).collect();
        assert_eq!(first, again);
    }
}

#[test]
fn fine_grained_matches_reference_model() {
    matches_reference_model(&fine_grained());
}

#[test]
fn lock_free_matches_reference_model() {
    matches_reference_model(&lock_free());
}

#[test]
fn fine_grained_duplicate_contract() {
    honors_duplicate_contract(&fine_grained());
}

#[test]
fn lock_free_duplicate_contract() {
    honors_duplicate_contract(&lock_free());
}

#[test]
fn fine_grained_example_scenario() {
    runs_example_scenario(&fine_grained());
}

#[test]
fn lock_free_example_scenario() {
    runs_example_scenario(&lock_free());
}

#[test]
fn fine_grained_disjoint_blocks() {
    survives_disjoint_blocks(&fine_grained());
}

#[test]
fn lock_free_disjoint_blocks() {
    survives_disjoint_blocks(&lock_free());
}

#[test]
fn fine_grained_find_is_stable() {
    answers_find_consistently(&fine_grained());
}

#[test]
fn lock_free_find_is_stable() {
    answers_find_consistently(&lock_free());
}

#[test]
fn hashed_values() {
    let words = ["alpha", "beta", "gamma", "delta"];

    let fine = FineGrainedBst::<String>::new();
    let lock_free = LockFreeBst::<String>::with_threads(2);
    for word in words {
        assert!(fine.insert(word.to_string()));
        assert!(lock_free.insert(word.to_string()));
    }
    assert!(!fine.insert("beta".to_string()));
    assert!(!lock_free.insert("beta".to_string()));
    assert!(fine.remove(&"gamma".to_string()));
    assert!(lock_free.remove(&"gamma".to_string()));
    for word in words {
        let expected = word != "gamma";
        assert_eq!(fine.find(&word.to_string()), expected);
        assert_eq!(lock_free.find(&word.to_string()), expected);
    }
    assert_eq!((fine.len(), lock_free.len()), (3, 3));
}

#[test]
fn closure_key_function() {
    let by_id = |entry: &(u64, &'static str)| entry.0;
    let set = LockFreeBst::with_key_fn_and_threads(by_id, 1);
    let mut handle = set.handle();
    assert!(set.insert_with((7, "seven"), &mut handle));
    // Same key, different payload: still a duplicate.
    assert!(!set.insert_with((7, "sieben"), &mut handle));
    assert!(set.find_with(&(7, ""), &mut handle));
    assert!(set.remove_with(&(7, "whatever"), &mut handle));
    assert!(set.is_empty());
}
