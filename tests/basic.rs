use molt::{Builder, HashTable, TablePolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sends every key to bucket zero, so chains, recycling, and relocation all
/// get exercised without needing a huge table.
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
fn new() {
    let _table = HashTable::new();
}

#[test]
fn add_and_lookup() {
    let table = HashTable::new();
    let handle = table.register_thread();
    assert!(!table.add(42, 7, &handle));
    assert_eq!(table.lookup(42, &handle), Some(7));
    assert!(table.contains(42, &handle));
    assert_eq!(table.lookup(43, &handle), None);
    assert!(!table.contains(43, &handle));
}

#[test]
fn add_existing_keeps_value() {
    let table = HashTable::new();
    let handle = table.register_thread();
    assert!(!table.add(42, 1, &handle));
    assert!(table.add(42, 2, &handle));
    assert_eq!(table.lookup(42, &handle), Some(1));
    assert_eq!(table.len(), 1);
}

#[test]
fn add_existing_discards_through_remove_hook() {
    let discarded = Arc::new(AtomicUsize::new(0));
    let table = HashTable::new();
    let seen = Arc::clone(&discarded);
    table.on_remove(move |v| {
        assert_eq!(v, 2);
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let handle = table.register_thread();
    table.add(42, 1, &handle);
    table.add(42, 2, &handle);
    assert_eq!(discarded.load(Ordering::SeqCst), 1);
}

#[test]
fn remove() {
    let table = HashTable::new();
    let handle = table.register_thread();
    assert!(!table.remove(42, &handle));
    table.add(42, 7, &handle);
    assert!(table.remove(42, &handle));
    assert!(!table.remove(42, &handle));
    assert_eq!(table.lookup(42, &handle), None);
    assert!(table.is_empty());
}

#[test]
fn remove_fires_hook_once() {
    let removed = Arc::new(AtomicUsize::new(0));
    let table = HashTable::new();
    let seen = Arc::clone(&removed);
    table.on_remove(move |v| {
        assert_eq!(v, 7);
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let handle = table.register_thread();
    table.add(42, 7, &handle);
    table.remove(42, &handle);
    table.remove(42, &handle);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}

#[test]
fn add_count() {
    let table = HashTable::new();
    let handle = table.register_thread();
    assert_eq!(table.add_count(9, 2, &handle), 2);
    assert_eq!(table.add_count(9, 3, &handle), 5);
    assert_eq!(table.add_count(9, 1, &handle), 6);
    assert_eq!(table.lookup(9, &handle), Some(6));
    assert_eq!(table.len(), 1);
}

#[test]
fn lookup_into() {
    let table = HashTable::new();
    let handle = table.register_thread();
    table.add(1, 10, &handle);

    let mut v = 0;
    assert!(table.lookup_into(1, &mut v, false, &handle));
    assert_eq!(v, 10);
    assert!(table.contains(1, &handle));

    assert!(!table.lookup_into(2, &mut v, false, &handle));
    assert_eq!(v, 10);
}

#[test]
fn lookup_into_clear_removes() {
    let table = HashTable::new();
    let handle = table.register_thread();
    table.add(1, 10, &handle);

    let mut v = 0;
    assert!(table.lookup_into(1, &mut v, true, &handle));
    assert_eq!(v, 10);
    assert!(!table.contains(1, &handle));
    assert!(table.is_empty());
}

#[test]
fn len_and_capacity() {
    let table = HashTable::with_capacity(256);
    let handle = table.register_thread();
    assert_eq!(table.len(), 0);
    assert!(table.is_empty());
    assert_eq!(table.capacity(&handle), 256);
    for i in 0..10 {
        table.add(i, i, &handle);
    }
    assert_eq!(table.len(), 10);
}

#[test]
fn iterate() {
    let table = HashTable::new();
    let handle = table.register_thread();
    for i in 0..100u64 {
        table.add(i, i * 2, &handle);
    }
    let mut seen = Vec::new();
    table.iterate(&handle, |k, v| {
        assert_eq!(v, k * 2);
        seen.push(k);
    });
    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
}

#[test]
fn iterate_and_clear() {
    let table = HashTable::new();
    let handle = table.register_thread();
    for i in 0..100u64 {
        table.add(i, i, &handle);
    }
    let mut drained = 0;
    table.iterate_and_clear(&handle, |_, _| drained += 1);
    assert_eq!(drained, 100);
    assert!(table.is_empty());
    assert!(!table.contains(17, &handle));
}

#[test]
fn iterate_and_modify() {
    let table = HashTable::new();
    let handle = table.register_thread();
    for i in 0..100u64 {
        table.add(i, i, &handle);
    }
    table.iterate_and_modify(&handle, |k, v| if k % 2 == 0 { Some(v + 1000) } else { None });
    assert_eq!(table.lookup(4, &handle), Some(1004));
    assert_eq!(table.lookup(5, &handle), Some(5));
}

#[test]
fn clear() {
    let table = HashTable::new();
    let handle = table.register_thread();
    for i in 0..50 {
        table.add(i, i, &handle);
    }
    table.clear(&handle);
    assert!(table.is_empty());
    assert_eq!(table.lookup(0, &handle), None);
}

#[test]
fn one_bucket() {
    // all keys collide, so every operation works on the head, middle, and
    // tail of a single chain
    let table = Builder::new()
        .policy(CollidingPolicy)
        .initial_capacity(64)
        .search_window(32)
        .build();
    let handle = table.register_thread();

    for i in 0..20u64 {
        assert!(!table.add(i, i * 100, &handle));
    }
    for i in 0..20u64 {
        assert_eq!(table.lookup(i, &handle), Some(i * 100));
    }
    // head, middle, tail removals
    assert!(table.remove(19, &handle));
    assert!(table.remove(10, &handle));
    assert!(table.remove(0, &handle));
    assert_eq!(table.len(), 17);
    for i in 0..20u64 {
        let expect = !matches!(i, 0 | 10 | 19);
        assert_eq!(table.contains(i, &handle), expect, "key {}", i);
    }
}

#[test]
fn reference_map_agreement() {
    use rand::Rng;

    let table = HashTable::with_capacity(64);
    let handle = table.register_thread();
    let mut reference = std::collections::HashMap::new();
    let mut rng = rand::thread_rng();

    for _ in 0..10_000 {
        let key = rng.gen_range(0u64..500);
        match rng.gen_range(0..3) {
            0 => {
                let value = rng.gen_range(0u64..1_000_000);
                let existed = table.add(key, value, &handle);
                assert_eq!(existed, reference.contains_key(&key));
                reference.entry(key).or_insert(value);
            }
            1 => {
                let removed = table.remove(key, &handle);
                assert_eq!(removed, reference.remove(&key).is_some());
            }
            _ => {
                assert_eq!(table.lookup(key, &handle), reference.get(&key).copied());
                assert_eq!(table.contains(key, &handle), reference.contains_key(&key));
            }
        }
        assert_eq!(table.len(), reference.len());
    }

    for (&key, &value) in &reference {
        assert_eq!(table.lookup(key, &handle), Some(value));
    }
}

#[test]
fn unregister_and_register_again() {
    let table = HashTable::new();
    let handle = table.register_thread();
    table.add(1, 1, &handle);
    handle.unregister();

    let handle = table.register_thread();
    assert!(table.contains(1, &handle));
}

#[test]
#[should_panic(expected = "already registered")]
fn double_register_panics() {
    let table = HashTable::new();
    let _one = table.register_thread();
    let _two = table.register_thread();
}

#[test]
#[should_panic(expected = "different table")]
fn foreign_handle_panics() {
    let a = HashTable::new();
    let b = HashTable::new();
    let handle = b.register_thread();
    a.add(1, 1, &handle);
}

#[test]
#[should_panic(expected = "sentinel")]
fn sentinel_key_panics() {
    let table = HashTable::new();
    let handle = table.register_thread();
    table.add(u64::MAX, 1, &handle);
}

#[test]
#[should_panic(expected = "search window")]
fn zero_window_panics() {
    let _table = Builder::new().search_window(0).build();
}

#[test]
#[should_panic(expected = "growth factors")]
fn shrinking_growth_tier_panics() {
    let _table = Builder::new().growth_tiers(&[(usize::MAX, 0.5)]).build();
}

#[test]
fn debug_impl() {
    let table = HashTable::new();
    let handle = table.register_thread();
    table.add(1, 1, &handle);
    let s = format!("{:?}", table);
    assert!(s.contains("len"));
}
