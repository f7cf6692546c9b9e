//! A concurrent hash table with incremental, cooperative resizing, built as
//! the indexing substrate for a knowledge-representation store: symbol
//! interning, frame-name lookup, and term-weight tables all run on this one
//! engine.
//!
//! # Design
//!
//! The table is open-addressed: one flat array of word-sized key/value
//! slots, with each bucket's entries chained together through small signed
//! offsets bounded by a configurable search window. Ordinary `add`, `remove`
//! and `lookup` never take a lock; every state transition that matters is a
//! single compare-exchange on a key word or on a bucket's packed
//! `{first-offset, status}` head word. Advisory per-bucket chain locks exist
//! only for restructuring maintenance: relocating an entry to make room,
//! physically reclaiming deleted slots, and copying a bucket during a
//! resize.
//!
//! Resizing is incremental and cooperative. One thread wins the right to
//! allocate the successor generation; after the successor is published,
//! every thread that touches the table steals copy segments and moves
//! buckets over, while operations on already-moved buckets forward to the
//! successor. Superseded generations are freed only after every thread's
//! hazard record confirms it has moved on — which is why each thread must
//! call [`HashTable::register_thread`] before touching the table.
//!
//! # Keys, values, and policies
//!
//! Keys and values are fixed-width words ([`Word`]), the representation the
//! knowledge store actually indexes by: symbol ids, frame handles, weights.
//! A [`TablePolicy`] supplies hashing, equality, and the three key values
//! reserved out of the key domain as slot-state sentinels. The default
//! [`WordPolicy`] hashes `u64` keys through [`DefaultHashBuilder`] and
//! reserves the top three key values.
//!
//! # Examples
//!
//! ```
//! use molt::HashTable;
//!
//! let table = HashTable::new();
//! let handle = table.register_thread();
//!
//! table.add(1, 100, &handle);
//! table.add(2, 200, &handle);
//! assert_eq!(table.lookup(1, &handle), Some(100));
//!
//! let mut total = 0;
//! table.iterate(&handle, |_key, value| total += value);
//! assert_eq!(total, 300);
//! ```
#![warn(missing_docs, rust_2018_idioms)]

mod backoff;
mod hazard;
mod map;
mod policy;
mod raw;
mod slot;

pub use map::{Builder, HashTable, HookKind, ThreadHandle};
pub use policy::{Counter, TablePolicy, Word, WordPolicy};

/// The default [`std::hash::BuildHasher`] behind [`WordPolicy`].
///
/// aHash is faster than SipHash while still resisting flooding attacks in
/// combination with a random state.
pub type DefaultHashBuilder = ahash::RandomState;
