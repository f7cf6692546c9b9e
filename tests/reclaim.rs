use molt::{Builder, HashTable, HookKind, TablePolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CollidingPolicy;

impl TablePolicy for CollidingPolicy {
    type Key = u64;
    type Value = u64;

    fn hash(&self, _key: u64) -> usize {
        0
    }
    fn equal(&self, a: u64, b: u64) -> bool {
        a == b
    }
    fn unused(&self) -> u64 {
        u64::MAX
    }
    fn deleted(&self) -> u64 {
        u64::MAX - 1
    }
    fn reclaiming(&self) -> u64 {
        u64::MAX - 2
    }
}

#[test]
fn remove_reclaim_add_cycle_does_not_grow() {
    let table = HashTable::with_capacity(128);
    let handle = table.register_thread();
    let capacity = table.capacity(&handle);

    for round in 0..10_000u64 {
        assert!(!table.add(42, round, &handle));
        assert!(table.remove(42, &handle));
    }

    assert!(table.is_empty());
    assert_eq!(table.capacity(&handle), capacity);
}

#[test]
fn churn_within_one_neighborhood_does_not_grow() {
    // every key collides; without slot recycling this would fill bucket
    // zero's window with deleted slots and force growth
    let table = Builder::new()
        .policy(CollidingPolicy)
        .initial_capacity(64)
        .search_window(16)
        .build();
    let handle = table.register_thread();
    let capacity = table.capacity(&handle);

    for round in 0..200u64 {
        for k in 0..16u64 {
            assert!(!table.add(round * 100 + k, k, &handle));
        }
        for k in 0..16u64 {
            assert!(table.remove(round * 100 + k, &handle));
        }
    }

    assert!(table.is_empty());
    assert_eq!(table.capacity(&handle), capacity);
}

#[test]
fn delete_hook_fires_on_clear() {
    let deleted = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&deleted);
    let table = Builder::new()
        .delete_hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let handle = table.register_thread();
    for i in 0..64 {
        table.add(i, i, &handle);
    }
    table.clear(&handle);
    assert_eq!(deleted.load(Ordering::SeqCst), 64);
}

#[test]
fn delete_hook_fires_on_drop() {
    let deleted = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&deleted);
    let table = HashTable::new();
    table.set_hook(HookKind::Delete, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    {
        let handle = table.register_thread();
        for i in 0..64 {
            table.add(i, i, &handle);
        }
        table.remove(0, &handle);
    }
    drop(table);
    assert_eq!(deleted.load(Ordering::SeqCst), 63);
}

#[test]
fn lookup_into_clear_skips_hooks() {
    let fired = Arc::new(AtomicUsize::new(0));
    let on_remove = Arc::clone(&fired);
    let on_delete = Arc::clone(&fired);
    let table = Builder::new()
        .remove_hook(move |_| {
            on_remove.fetch_add(1, Ordering::SeqCst);
        })
        .delete_hook(move |_| {
            on_delete.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let handle = table.register_thread();
    table.add(1, 10, &handle);

    let mut v = 0;
    assert!(table.lookup_into(1, &mut v, true, &handle));
    assert_eq!(v, 10);
    // the caller took ownership of the value; neither hook fires
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn generations_are_reclaimed_across_resizes() {
    // a long add/resize life does not accumulate generations: every resize
    // must eventually free (or pool) its predecessor, or the chain of
    // superseded tables would hold every array ever allocated
    let table = HashTable::with_capacity(128);
    let handle = table.register_thread();
    for i in 0..200_000u64 {
        table.add(i, i, &handle);
    }
    for i in 0..200_000u64 {
        assert!(table.remove(i, &handle));
    }
    assert!(table.is_empty());
    // shrink back; the churn above exercised pooled shells
    table.resize_to(128, &handle);
    assert_eq!(table.capacity(&handle), 128);
}

#[test]
fn remove_reclaims_while_other_threads_idle() {
    // registered-but-idle threads must not block slot reclamation
    let table = Arc::new(HashTable::with_capacity(128));
    let idle_table = table.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let idler = std::thread::spawn(move || {
        let _handle = idle_table.register_thread();
        ready_tx.send(()).unwrap();
        done_rx.recv().unwrap();
    });
    ready_rx.recv().unwrap();

    let handle = table.register_thread();
    let capacity = table.capacity(&handle);
    for round in 0..1_000u64 {
        table.add(round, round, &handle);
        table.remove(round, &handle);
    }
    assert_eq!(table.capacity(&handle), capacity);

    done_tx.send(()).unwrap();
    idler.join().unwrap();
}
