use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

use loom::model::Builder;
use loom::thread::{spawn, yield_now};
use sdd::Guard;

use crate::LockFreeMap;

static SERIALIZER: Mutex<()> = Mutex::new(());

fn collect_garbage() {
    loop {
        let guard = Guard::new();
        if !guard.has_garbage() {
            break;
        }
        guard.accelerate();
        yield_now();
    }
}

// Checks if existing keys stay visible while another thread appends to the same chain.
#[test]
fn store_visibility() {
    let _guard = SERIALIZER.lock().unwrap();

    for num_keys in 1..4 {
        let mut model_builder = Builder::new();
        model_builder.max_threads = 2;
        model_builder.max_branches = 1_048_576;
        model_builder.check(move || {
            let map: Arc<LockFreeMap<usize>> = Arc::new(LockFreeMap::new(1));
            for k in 0..num_keys {
                map.store(&k.to_string(), k);
            }
            let map_clone = map.clone();
            let thread_store = spawn(move || {
                map_clone.store("x", usize::MAX);
                assert_eq!(map_clone.load("0"), Some(0));
                drop(map_clone);
                collect_garbage();
            });
            assert_eq!(map.load("0"), Some(0));
            assert!(thread_store.join().is_ok());

            for k in 0..num_keys {
                assert_eq!(map.load(&k.to_string()), Some(k));
            }
            assert_eq!(map.load("x"), Some(usize::MAX));
            assert_eq!(map.len(), num_keys + 1);

            drop(map);
            collect_garbage();
        });
    }
}

// Checks if the same key cannot be inserted twice.
#[test]
fn key_uniqueness() {
    let _guard = SERIALIZER.lock().unwrap();

    let mut model_builder = Builder::new();
    model_builder.max_threads = 2;
    model_builder.max_branches = 1_048_576;
    model_builder.check(|| {
        let map: Arc<LockFreeMap<usize>> = Arc::new(LockFreeMap::new(1));
        map.store("a", 0);
        let check = Arc::new(AtomicUsize::new(0));
        let map_clone = map.clone();
        let check_clone = check.clone();
        let thread_insert = spawn(move || {
            if map_clone.store_not_exists("x", 1) {
                check_clone.fetch_add(1, Relaxed);
            }
            drop(map_clone);
            collect_garbage();
        });
        if map.store_not_exists("x", 2) {
            check.fetch_add(1, Relaxed);
        }
        assert!(thread_insert.join().is_ok());

        assert_eq!(check.load(Relaxed), 1);
        assert_eq!(map.len(), 2);
        let mut occurrences = 0;
        map.range(|k, _| {
            if k == "x" {
                occurrences += 1;
            }
            true
        });
        assert_eq!(occurrences, 1);

        drop(map);
        collect_garbage();
    });
}

// Checks if an append racing with the deletion of the tail entry is never lost.
#[test]
fn delete_append() {
    let _guard = SERIALIZER.lock().unwrap();

    let mut model_builder = Builder::new();
    model_builder.max_threads = 2;
    model_builder.max_branches = 1_048_576;
    model_builder.check(|| {
        let map: Arc<LockFreeMap<usize>> = Arc::new(LockFreeMap::new(1));
        map.store("a", 0);
        let map_clone = map.clone();
        let thread_delete = spawn(move || {
            while map_clone.contains("a") {
                map_clone.delete("a");
            }
            drop(map_clone);
            collect_garbage();
        });
        map.store("b", 1);
        assert!(thread_delete.join().is_ok());

        assert!(map.load("a").is_none());
        assert_eq!(map.load("b"), Some(1));
        assert_eq!(map.len(), 1);

        drop(map);
        collect_garbage();
    });
}
