use crate::backoff::Backoff;
use crate::hazard::{HazardRecord, Registry, NO_BUCKET};
use crate::policy::{Counter, TablePolicy, Word, WordPolicy};
use crate::raw::{Generation, NeighborhoodFull, Sentinels, GROUP};
use crate::slot::{LinkState, NIL};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

/// The largest slot count a generation may reach. Growth stops here; further
/// inserts keep working against an increasingly loaded table.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The default initial slot count.
const DEFAULT_CAPACITY: usize = 128;

/// Default reach of a bucket: how many positions to either side of its own
/// index it may place entries in.
const DEFAULT_SEARCH_WINDOW: usize = 64;

/// Hard limit on the configurable search window. Offsets are stored as
/// 16-bit signed words, and the window must leave the terminator value free.
const MAX_SEARCH_WINDOW: usize = 1 << 12;

/// Minimum number of buckets per copy segment. Ranges are subdivided so
/// multiple threads can steal copy work; this bounds the subdivision to
/// avoid excessive contention on the segment counter.
const MIN_COPY_STRIDE: usize = 16;

/// Retired generation shells kept around for reuse.
const POOL_GENERATIONS: usize = 4;

/// Tiered growth policy: `(size limit, factor)` pairs, applied with the
/// first tier whose limit exceeds the current size. Doubling is cheap while
/// the table is small; past tens of millions of slots the factor tapers off
/// to bound the memory spike of holding two generations during a copy.
const DEFAULT_GROWTH_TIERS: &[(usize, f64)] = &[
    (16 << 20, 2.0),
    (64 << 20, 1.5),
    (256 << 20, 1.4),
    (1 << 30, 1.3),
    (usize::MAX, 1.2),
];

static NCPU_INITIALIZER: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

fn num_cpus() -> usize {
    NCPU_INITIALIZER.call_once(|| NCPU.store(num_cpus::get(), Ordering::Relaxed));
    NCPU.load(Ordering::Relaxed)
}

macro_rules! load_factor {
    ($n: expr) => {
        // ¾ n = n - n/4 = n - (n >> 2)
        $n - ($n >> 2)
    };
}

/// Slot count needed to hold `count` entries below the resize threshold.
fn capacity_for(count: usize) -> usize {
    count + count / 3 + 1
}

fn effective_window(configured: usize, len: usize) -> i16 {
    configured.min(len.saturating_sub(1) / 2) as i16
}

/// Value-lifecycle notification channels; see [`HashTable::set_hook`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// The table dropped a value it will not hand back to any caller: a
    /// removed entry's value, or the value discarded when an insert or a
    /// migration runs into an entry that already exists.
    Remove,
    /// The table destroyed a value wholesale: entries cleared through
    /// [`HashTable::iterate_and_clear`] / [`HashTable::clear`], or still
    /// resident when the table is dropped.
    Delete,
}

type Hook<V> = Arc<dyn Fn(V) + Send + Sync>;

/// Where an operation should run: in this generation under the observed
/// head state, or in the successor the bucket has migrated to.
enum Route<'g> {
    Proceed(crate::slot::HeadState),
    Forward(&'g Generation),
}

/// A concurrent hash table with incremental, cooperative resizing.
///
/// `HashTable` is the indexing substrate of a knowledge store: symbol
/// interning tables, frame-name indexes, and term-weight tables all sit on
/// this one engine. Keys and values are fixed-width words (see
/// [`Word`]), stored in an open-addressed slot array and chained per bucket
/// through small relative offsets. Three key values, supplied by the
/// [`TablePolicy`], are reserved as sentinels and must never be used as
/// keys.
///
/// # Threads and handles
///
/// Every thread touching the table must first call
/// [`register_thread`](HashTable::register_thread) and pass the returned
/// [`ThreadHandle`] to each operation. The handle installs the thread's
/// hazard-tracking state, which is what lets the table free superseded
/// generations without stopping the world. Registering the same thread
/// twice is a programming error and panics.
///
/// # Resizing behavior
///
/// When a generation fills past its threshold (¾ of its slots), or a bucket
/// neighborhood fills up, one thread allocates a successor generation and
/// every thread that touches the table afterwards helps copy buckets over.
/// Operations on buckets that have already moved forward transparently;
/// lookups on buckets mid-copy wait briefly for the copy to finish so they
/// can never miss an entry that already migrated. Growth follows a tiered
/// policy (double while small, gentler past tens of millions of slots).
///
/// # Examples
///
/// ```
/// use molt::HashTable;
///
/// let table = HashTable::new();
/// let handle = table.register_thread();
///
/// assert!(!table.add(1, 10, &handle));
/// assert_eq!(table.lookup(1, &handle), Some(10));
/// assert!(table.remove(1, &handle));
/// assert!(!table.contains(1, &handle));
/// ```
pub struct HashTable<P: TablePolicy = WordPolicy> {
    /// The newest fully-adopted generation.
    current: AtomicPtr<Generation>,
    /// Head of the chain of not-yet-reclaimed generations, oldest first,
    /// linked through each generation's successor pointer.
    oldest: AtomicPtr<Generation>,
    /// Retired generation shells, reused to avoid allocator churn.
    pool: Mutex<Vec<Box<Generation>>>,
    registry: Registry,
    policy: P,
    sent: Sentinels,
    /// Logical entry count across all generations.
    count: AtomicUsize,
    /// Configured search window; each generation clamps it to its size.
    window: usize,
    tiers: Box<[(usize, f64)]>,
    remove_hook: RwLock<Option<Hook<P::Value>>>,
    delete_hook: RwLock<Option<Hook<P::Value>>>,
    /// Serializes generation reclamation scans.
    reclaim_lock: Mutex<()>,
}

// safety: the raw generation pointers are owned by the container; keys and
// values are plain words (`Word: Send + Sync + 'static`).
unsafe impl<P: TablePolicy + Send> Send for HashTable<P> {}
unsafe impl<P: TablePolicy + Sync> Sync for HashTable<P> {}

/// Per-thread context installed by [`HashTable::register_thread`].
///
/// Holds the thread's hazard record. Dropping the handle unregisters the
/// thread (the thread-exit hook); [`unregister`](ThreadHandle::unregister)
/// does the same explicitly. The handle is deliberately not `Send`: it
/// belongs to the thread that registered.
pub struct ThreadHandle<'t, P: TablePolicy> {
    table: &'t HashTable<P>,
    record: &'t HazardRecord,
    released: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<P: TablePolicy> ThreadHandle<'_, P> {
    /// Tear down this thread's registration. Equivalent to dropping the
    /// handle, but reads better at explicit teardown sites.
    pub fn unregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.table.registry.unregister(self.record);
        }
    }
}

impl<P: TablePolicy> Drop for ThreadHandle<'_, P> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Configures and builds a [`HashTable`].
///
/// # Examples
///
/// ```
/// use molt::Builder;
///
/// let table = Builder::new()
///     .initial_capacity(256)
///     .search_window(32)
///     .build();
/// let handle = table.register_thread();
/// table.add(1, 1, &handle);
/// ```
pub struct Builder<P: TablePolicy = WordPolicy> {
    policy: P,
    initial_capacity: usize,
    search_window: usize,
    growth_tiers: Vec<(usize, f64)>,
    remove_hook: Option<Hook<P::Value>>,
    delete_hook: Option<Hook<P::Value>>,
}

impl Builder<WordPolicy> {
    /// A builder with the default policy, capacity, window, and growth
    /// tiers, and no hooks.
    pub fn new() -> Self {
        Self {
            policy: WordPolicy::new(),
            initial_capacity: DEFAULT_CAPACITY,
            search_window: DEFAULT_SEARCH_WINDOW,
            growth_tiers: DEFAULT_GROWTH_TIERS.to_vec(),
            remove_hook: None,
            delete_hook: None,
        }
    }
}

impl Default for Builder<WordPolicy> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: TablePolicy> Builder<P> {
    /// Replace the key policy. Resets any hooks already set, since their
    /// value type follows the policy.
    pub fn policy<Q: TablePolicy>(self, policy: Q) -> Builder<Q> {
        Builder {
            policy,
            initial_capacity: self.initial_capacity,
            search_window: self.search_window,
            growth_tiers: self.growth_tiers,
            remove_hook: None,
            delete_hook: None,
        }
    }

    /// Initial slot count of the table.
    pub fn initial_capacity(mut self, slots: usize) -> Self {
        self.initial_capacity = slots;
        self
    }

    /// How far from its own index a bucket may place entries. Must be
    /// between 1 and 4096; [`build`](Builder::build) panics otherwise.
    pub fn search_window(mut self, window: usize) -> Self {
        self.search_window = window;
        self
    }

    /// Replace the tiered growth policy with `(size limit, factor)` pairs.
    /// Factors must be greater than 1; [`build`](Builder::build) panics
    /// otherwise.
    pub fn growth_tiers(mut self, tiers: &[(usize, f64)]) -> Self {
        self.growth_tiers = tiers.to_vec();
        self
    }

    /// Install the remove hook; see [`HookKind::Remove`].
    pub fn remove_hook(mut self, hook: impl Fn(P::Value) + Send + Sync + 'static) -> Self {
        self.remove_hook = Some(Arc::new(hook));
        self
    }

    /// Install the delete hook; see [`HookKind::Delete`].
    pub fn delete_hook(mut self, hook: impl Fn(P::Value) + Send + Sync + 'static) -> Self {
        self.delete_hook = Some(Arc::new(hook));
        self
    }

    /// Build the configured table.
    ///
    /// # Panics
    ///
    /// Panics if the search window is out of range, a growth factor does not
    /// exceed 1, or the policy's sentinel keys are not pairwise distinct.
    pub fn build(self) -> HashTable<P> {
        HashTable::with_parts(
            self.policy,
            self.initial_capacity,
            self.search_window,
            self.growth_tiers,
            self.remove_hook,
            self.delete_hook,
        )
    }
}

impl HashTable<WordPolicy> {
    /// Creates a table with the default policy and capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a table with `capacity` initial slots.
    ///
    /// # Examples
    ///
    /// ```
    /// use molt::HashTable;
    /// let table = HashTable::with_capacity(1024);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Builder::new().initial_capacity(capacity).build()
    }
}

impl<P: TablePolicy + Default> Default for HashTable<P> {
    fn default() -> Self {
        Self::with_policy(P::default())
    }
}

impl<P: TablePolicy> HashTable<P> {
    /// Creates a table driven by `policy` for hashing, comparison, and the
    /// reserved sentinel keys.
    pub fn with_policy(policy: P) -> Self {
        Self::with_parts(
            policy,
            DEFAULT_CAPACITY,
            DEFAULT_SEARCH_WINDOW,
            DEFAULT_GROWTH_TIERS.to_vec(),
            None,
            None,
        )
    }

    fn with_parts(
        policy: P,
        capacity: usize,
        window: usize,
        tiers: Vec<(usize, f64)>,
        remove_hook: Option<Hook<P::Value>>,
        delete_hook: Option<Hook<P::Value>>,
    ) -> Self {
        assert!(
            (1..=MAX_SEARCH_WINDOW).contains(&window),
            "search window must be between 1 and {}",
            MAX_SEARCH_WINDOW
        );
        assert!(
            tiers.iter().all(|&(_, factor)| factor > 1.0),
            "growth factors must be greater than 1"
        );
        let sent = Sentinels {
            unused: policy.unused().into_word(),
            deleted: policy.deleted().into_word(),
            reclaiming: policy.reclaiming().into_word(),
        };
        assert!(
            sent.unused != sent.deleted
                && sent.unused != sent.reclaiming
                && sent.deleted != sent.reclaiming,
            "sentinel key values must be pairwise distinct"
        );

        let len = capacity.clamp(1, MAXIMUM_CAPACITY);
        let gen = Generation::try_alloc(len, effective_window(window, len), load_factor!(len), sent)
            .expect("failed to allocate initial table");
        let gen = Box::into_raw(gen);

        Self {
            current: AtomicPtr::new(gen),
            oldest: AtomicPtr::new(gen),
            pool: Mutex::new(Vec::new()),
            registry: Registry::new(),
            policy,
            sent,
            count: AtomicUsize::new(0),
            window,
            tiers: tiers.into_boxed_slice(),
            remove_hook: RwLock::new(remove_hook),
            delete_hook: RwLock::new(delete_hook),
            reclaim_lock: Mutex::new(()),
        }
    }

    /// Install hazard-tracking state for the calling thread and return its
    /// handle. Must be called once per thread before any other operation;
    /// the handle unregisters the thread when dropped.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is already registered with this table.
    pub fn register_thread(&self) -> ThreadHandle<'_, P> {
        ThreadHandle {
            table: self,
            record: self.registry.register(),
            released: false,
            _not_send: PhantomData,
        }
    }

    /// Replace the `kind` value-lifecycle hook.
    ///
    /// Hooks run on whichever thread triggers them, sometimes while chain
    /// maintenance is in progress; they must be quick and must not call back
    /// into the table.
    pub fn set_hook(&self, kind: HookKind, hook: impl Fn(P::Value) + Send + Sync + 'static) {
        let hook: Hook<P::Value> = Arc::new(hook);
        match kind {
            HookKind::Remove => *self.remove_hook.write() = Some(hook),
            HookKind::Delete => *self.delete_hook.write() = Some(hook),
        }
    }

    /// Shorthand for [`set_hook`](HashTable::set_hook) with [`HookKind::Remove`].
    pub fn on_remove(&self, hook: impl Fn(P::Value) + Send + Sync + 'static) {
        self.set_hook(HookKind::Remove, hook);
    }

    /// Shorthand for [`set_hook`](HashTable::set_hook) with [`HookKind::Delete`].
    pub fn on_delete(&self, hook: impl Fn(P::Value) + Send + Sync + 'static) {
        self.set_hook(HookKind::Delete, hook);
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Does the table hold no entries?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count of the current generation.
    pub fn capacity(&self, handle: &ThreadHandle<'_, P>) -> usize {
        self.check_handle(handle);
        let record = handle.record;
        let n = self.current_generation(record).len();
        record.clear();
        n
    }

    fn check_handle(&self, handle: &ThreadHandle<'_, P>) {
        assert!(
            std::ptr::eq(handle.table, self),
            "handle was registered with a different table"
        );
    }

    fn check_key(&self, key: P::Key) {
        assert!(
            !self.sent.is_sentinel(key.into_word()),
            "key collides with a reserved sentinel value"
        );
    }

    fn notify(&self, kind: HookKind, value_word: u64) {
        let hook = match kind {
            HookKind::Remove => self.remove_hook.read().clone(),
            HookKind::Delete => self.delete_hook.read().clone(),
        };
        if let Some(hook) = hook {
            hook(P::Value::from_word(value_word));
        }
    }

    /// Load the current generation and protect it with `record`. The
    /// re-check makes the publication race-free: if the pointer is still
    /// current after the record went up, the reclaimer's registry scan is
    /// guaranteed to see the record before the generation can be freed.
    fn current_generation(&self, record: &HazardRecord) -> &Generation {
        loop {
            let p = self.current.load(Ordering::SeqCst);
            record.protect(p as *const (), NO_BUCKET);
            if self.current.load(Ordering::SeqCst) == p {
                // safety: protected as argued above
                return unsafe { &*p };
            }
        }
    }

    /// The successor of `gen`. A generation is freed strictly after its
    /// predecessor, so the reference is valid for as long as `gen` is.
    fn successor_of<'g>(&self, gen: &'g Generation) -> &'g Generation {
        let succ = gen.successor();
        debug_assert!(!succ.is_null());
        // safety: see above
        unsafe { &*succ }
    }

    /// Routing decision for a read: proceed on this generation, or forward
    /// to the successor once the bucket has been copied. A bucket mid-copy
    /// (stale but not yet copied) is waited out with bounded backoff, which
    /// is what guarantees a lookup can never miss an entry that has already
    /// migrated.
    fn route_read<'g>(
        &self,
        gen: &'g Generation,
        bucket: usize,
        record: &HazardRecord,
    ) -> Route<'g> {
        let head = gen.head(bucket);
        if head.copied() {
            return Route::Forward(self.successor_of(gen));
        }
        if !head.stale() {
            return Route::Proceed(head);
        }
        record.set_bucket(NO_BUCKET);
        let mut backoff = Backoff::new();
        loop {
            if gen.head(bucket).copied() {
                return Route::Forward(self.successor_of(gen));
            }
            backoff.wait();
        }
    }

    /// Routing decision for a mutation. Once a successor exists the bucket
    /// must move first: copy it ourselves if nobody has (assisting the
    /// resize), then forward. Mutating a bucket that is mid-maintenance
    /// waits for the chain lock to clear.
    fn route_mut<'g>(
        &self,
        gen: &'g Generation,
        bucket: usize,
        record: &HazardRecord,
    ) -> Route<'g> {
        let mut backoff = Backoff::new();
        loop {
            let succ = gen.successor();
            if !succ.is_null() {
                self.ensure_bucket_copied(gen, bucket, record);
                return Route::Forward(self.successor_of(gen));
            }
            let head = gen.head(bucket);
            if head.stale() || head.copied() {
                // a successor appeared between the two loads
                continue;
            }
            if head.locked() {
                record.set_bucket(NO_BUCKET);
                backoff.wait();
                record.set_bucket(bucket);
                continue;
            }
            return Route::Proceed(head);
        }
    }

    /// Adds `key` with `value` unless the key is already present. Returns
    /// `true` if it was. The existing entry's value is never replaced; if
    /// the key existed, the not-inserted `value` is handed to the remove
    /// hook, since the table owns values the moment they are passed in.
    ///
    /// # Examples
    ///
    /// ```
    /// use molt::HashTable;
    ///
    /// let table = HashTable::new();
    /// let handle = table.register_thread();
    /// assert!(!table.add(42, 1, &handle));
    /// assert!(table.add(42, 2, &handle));
    /// assert_eq!(table.lookup(42, &handle), Some(1));
    /// ```
    pub fn add(&self, key: P::Key, value: P::Value, handle: &ThreadHandle<'_, P>) -> bool {
        self.check_handle(handle);
        self.check_key(key);
        let record = handle.record;
        let gen = self.current_generation(record);
        let existed = self.insert_in(gen, key, value.into_word(), record);
        if existed {
            self.notify(HookKind::Remove, value.into_word());
        } else {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        record.clear();
        existed
    }

    /// The counting variant of [`add`](HashTable::add): inserts `key` with
    /// count `incr` if absent, otherwise adds `incr` to the entry's
    /// co-located counter. Returns the new count.
    ///
    /// An increment racing a bucket migration is absorbed either before or
    /// after the copy; presence stays exact, counter totals are unordered
    /// against concurrent removes of the same key.
    ///
    /// # Examples
    ///
    /// ```
    /// use molt::HashTable;
    ///
    /// let table = HashTable::new();
    /// let handle = table.register_thread();
    /// assert_eq!(table.add_count(7, 2, &handle), 2);
    /// assert_eq!(table.add_count(7, 3, &handle), 5);
    /// ```
    pub fn add_count(&self, key: P::Key, incr: u64, handle: &ThreadHandle<'_, P>) -> u64
    where
        P::Value: Counter,
    {
        self.check_handle(handle);
        self.check_key(key);
        let record = handle.record;
        let hash = self.policy.hash(key);
        let mut gen = self.current_generation(record);
        let mut backoff = Backoff::new();
        let new_count = 'outer: loop {
            let b = gen.bucket_index(hash);
            record.protect(gen.as_table_ptr(), b);
            match self.route_mut(gen, b, record) {
                Route::Forward(next) => {
                    gen = next;
                    continue;
                }
                Route::Proceed(_) => {}
            }
            if let Some((i, w)) = gen.find(b, |w| self.policy.equal(P::Key::from_word(w), key)) {
                loop {
                    let old = gen.slot(i).value();
                    if gen.slot(i).key() != w {
                        // the entry vanished; start over
                        continue 'outer;
                    }
                    if gen.slot(i).cas_value(old, old.wrapping_add(incr)) {
                        break 'outer old.wrapping_add(incr);
                    }
                }
            }
            if !self.insert_in(gen, key, incr, record) {
                self.count.fetch_add(1, Ordering::SeqCst);
                break incr;
            }
            // lost the insert race; go increment whoever won
            backoff.wait();
        };
        record.clear();
        new_count
    }

    /// Is `key` present?
    pub fn contains(&self, key: P::Key, handle: &ThreadHandle<'_, P>) -> bool {
        self.lookup(key, handle).is_some()
    }

    /// Returns the value stored under `key`, if any.
    pub fn lookup(&self, key: P::Key, handle: &ThreadHandle<'_, P>) -> Option<P::Value> {
        self.check_handle(handle);
        self.check_key(key);
        let record = handle.record;
        let hash = self.policy.hash(key);
        let mut gen = self.current_generation(record);
        let mut backoff = Backoff::new();
        let found = loop {
            let b = gen.bucket_index(hash);
            record.protect(gen.as_table_ptr(), b);
            match self.route_read(gen, b, record) {
                Route::Forward(next) => {
                    gen = next;
                    continue;
                }
                Route::Proceed(_) => {}
            }
            match gen.find(b, |w| self.policy.equal(P::Key::from_word(w), key)) {
                Some((i, w)) => {
                    let v = gen.slot(i).value();
                    if gen.slot(i).key() == w {
                        break Some(P::Value::from_word(v));
                    }
                    // the key changed between the match and the value read:
                    // deleted, consumed by a copier, or relocated within its
                    // chain. retry settles all three.
                    backoff.wait();
                }
                None => {
                    // conclusive only if the bucket did not start migrating
                    // under the walk; a copier consumes entries out of the
                    // chain before the successor has them
                    let after = gen.head(b);
                    if after.stale() || after.copied() {
                        continue;
                    }
                    break None;
                }
            }
        };
        record.clear();
        found
    }

    /// Copies the value stored under `key` into `value` and returns whether
    /// it was found. With `clear`, the entry is removed in the same step and
    /// its value belongs to the caller (no hook fires).
    pub fn lookup_into(
        &self,
        key: P::Key,
        value: &mut P::Value,
        clear: bool,
        handle: &ThreadHandle<'_, P>,
    ) -> bool {
        self.check_handle(handle);
        self.check_key(key);
        let record = handle.record;
        let hash = self.policy.hash(key);
        let mut gen = self.current_generation(record);
        let mut backoff = Backoff::new();
        let found = loop {
            let b = gen.bucket_index(hash);
            record.protect(gen.as_table_ptr(), b);
            match self.route_read(gen, b, record) {
                Route::Forward(next) => {
                    gen = next;
                    continue;
                }
                Route::Proceed(_) => {}
            }
            match gen.find(b, |w| self.policy.equal(P::Key::from_word(w), key)) {
                Some((i, w)) => {
                    let v = gen.slot(i).value();
                    if clear {
                        // the mark is final for the same reason a remove's
                        // is: a copier consuming this entry would have won
                        // the race on the key word
                        if !gen.slot(i).cas_key(w, self.sent.deleted) {
                            backoff.wait();
                            continue;
                        }
                        gen.count.fetch_sub(1, Ordering::SeqCst);
                        self.count.fetch_sub(1, Ordering::SeqCst);
                    } else if gen.slot(i).key() != w {
                        backoff.wait();
                        continue;
                    }
                    *value = P::Value::from_word(v);
                    break true;
                }
                None => {
                    let after = gen.head(b);
                    if after.stale() || after.copied() {
                        continue;
                    }
                    break false;
                }
            }
        };
        record.clear();
        found
    }

    /// Removes `key`. Returns `true` if an entry was removed.
    ///
    /// Removal marks matching slots deleted rather than unlinking them while
    /// other threads may be mid-chain; slots are physically reclaimed by an
    /// opportunistic pass afterwards (immediately, when nothing else is
    /// touching the bucket).
    ///
    /// # Examples
    ///
    /// ```
    /// use molt::HashTable;
    ///
    /// let table = HashTable::new();
    /// let handle = table.register_thread();
    /// table.add(42, 1, &handle);
    /// assert!(table.remove(42, &handle));
    /// assert!(!table.remove(42, &handle));
    /// ```
    pub fn remove(&self, key: P::Key, handle: &ThreadHandle<'_, P>) -> bool {
        self.check_handle(handle);
        self.check_key(key);
        let record = handle.record;
        let removed = self.erase(key, record);
        record.clear();
        removed
    }

    /// Mark every matching occurrence of `key` in the authoritative chain
    /// deleted. A successful mark is final: a copier consumes each entry
    /// out of a frozen chain with a compare-exchange on the same key word
    /// before re-inserting it downstream, so a mark and a consume have
    /// exactly one winner and a removal can be neither lost to a migration
    /// nor observed twice. The first mark decrements the logical count and
    /// runs the remove hook.
    fn erase(&self, key: P::Key, record: &HazardRecord) -> bool {
        let hash = self.policy.hash(key);
        let mut gen = self.current_generation(record);
        let mut removed = false;
        let mut backoff = Backoff::new();
        loop {
            let b = gen.bucket_index(hash);
            record.protect(gen.as_table_ptr(), b);
            match self.route_read(gen, b, record) {
                Route::Forward(next) => {
                    gen = next;
                    continue;
                }
                Route::Proceed(head) => {
                    // mark every matching occurrence; transient duplicates
                    // can exist while a migration is forwarding
                    let mut restart = false;
                    let mut off = head.first();
                    while off != NIL {
                        let i = gen.at(b, off);
                        let link = gen.meta(i).link();
                        if link.owner() != off {
                            restart = true;
                            break;
                        }
                        let w = gen.slot(i).key();
                        if !self.sent.is_sentinel(w)
                            && self.policy.equal(P::Key::from_word(w), key)
                        {
                            if gen.slot(i).cas_key(w, self.sent.deleted) {
                                let v = gen.slot(i).value();
                                gen.count.fetch_sub(1, Ordering::SeqCst);
                                if !removed {
                                    removed = true;
                                    self.count.fetch_sub(1, Ordering::SeqCst);
                                    self.notify(HookKind::Remove, v);
                                }
                            } else {
                                // consumed by a copier or marked by another
                                // remove in the same instant; re-walk
                                restart = true;
                                break;
                            }
                        }
                        off = link.next();
                    }
                    if restart {
                        backoff.wait();
                        continue;
                    }
                    if removed {
                        self.try_reclaim_bucket(gen, b, record);
                        break;
                    }
                    // an empty-handed walk is conclusive only if the bucket
                    // did not start migrating under it; a copier may have
                    // consumed the entry mid-walk
                    let after = gen.head(b);
                    if after.stale() || after.copied() {
                        continue;
                    }
                    break;
                }
            }
        }
        removed
    }

    /// Calls `f` for every entry.
    ///
    /// The walk is weakly consistent: it reflects some state of the table
    /// during the call, and entries inserted or removed concurrently may or
    /// may not be observed.
    pub fn iterate(&self, handle: &ThreadHandle<'_, P>, mut f: impl FnMut(P::Key, P::Value)) {
        self.check_handle(handle);
        let record = handle.record;
        let gen = self.settled_generation(record);
        for i in 0..gen.len() {
            let w = gen.slot(i).key();
            if self.sent.is_sentinel(w) {
                continue;
            }
            let v = gen.slot(i).value();
            if gen.slot(i).key() != w {
                continue;
            }
            f(P::Key::from_word(w), P::Value::from_word(v));
        }
        record.clear();
    }

    /// Calls `f` for every entry and removes it in the same pass. Cleared
    /// values also run through the delete hook.
    pub fn iterate_and_clear(
        &self,
        handle: &ThreadHandle<'_, P>,
        mut f: impl FnMut(P::Key, P::Value),
    ) {
        self.check_handle(handle);
        let record = handle.record;
        let gen = self.settled_generation(record);
        for i in 0..gen.len() {
            let w = gen.slot(i).key();
            if self.sent.is_sentinel(w) {
                continue;
            }
            if !gen.slot(i).cas_key(w, self.sent.deleted) {
                continue;
            }
            let v = gen.slot(i).value();
            gen.count.fetch_sub(1, Ordering::SeqCst);
            self.count.fetch_sub(1, Ordering::SeqCst);
            f(P::Key::from_word(w), P::Value::from_word(v));
            self.notify(HookKind::Delete, v);
        }
        record.clear();
    }

    /// Calls `f` for every entry; returning `Some(v)` replaces the entry's
    /// value in place.
    ///
    /// Unsafe to combine with concurrent removes of the same keys: a
    /// replacement can race the removal and win, resurrecting the value.
    pub fn iterate_and_modify(
        &self,
        handle: &ThreadHandle<'_, P>,
        mut f: impl FnMut(P::Key, P::Value) -> Option<P::Value>,
    ) {
        self.check_handle(handle);
        let record = handle.record;
        let gen = self.settled_generation(record);
        for i in 0..gen.len() {
            let w = gen.slot(i).key();
            if self.sent.is_sentinel(w) {
                continue;
            }
            let v = gen.slot(i).value();
            if gen.slot(i).key() != w {
                continue;
            }
            if let Some(new) = f(P::Key::from_word(w), P::Value::from_word(v)) {
                gen.slot(i).cas_value(v, new.into_word());
            }
        }
        record.clear();
    }

    /// Removes every entry. Cleared values run through the delete hook.
    pub fn clear(&self, handle: &ThreadHandle<'_, P>) {
        self.iterate_and_clear(handle, |_, _| {});
    }

    /// Grow (or shrink) the table to `slots` slots. The new size is raised
    /// as needed to keep the present entries below the resize threshold.
    pub fn resize_to(&self, slots: usize, handle: &ThreadHandle<'_, P>) {
        self.check_handle(handle);
        let record = handle.record;
        let gen = self.current_generation(record);
        let target = slots
            .max(capacity_for(gen.count.load(Ordering::SeqCst)))
            .clamp(1, MAXIMUM_CAPACITY);
        if target != gen.len() {
            self.grow(gen, Some(target), record);
        }
        record.clear();
    }

    /// Size the table to hold `capacity` entries without further resizing.
    pub fn resize_to_fit(&self, capacity: usize, handle: &ThreadHandle<'_, P>) {
        self.resize_to(capacity_for(capacity), handle);
    }

    /// The insert engine shared by [`add`](HashTable::add), the counting
    /// variant, and migration. Returns `true` if the key already existed
    /// (nothing is inserted and no value replaced). Adjusts only the
    /// generation's resident count; the table-wide logical count is the
    /// caller's, since a migration re-inserting an entry moves it without
    /// changing how many entries the table holds.
    fn insert_in<'g>(
        &'g self,
        mut gen: &'g Generation,
        key: P::Key,
        value_word: u64,
        record: &HazardRecord,
    ) -> bool {
        let key_word = key.into_word();
        let hash = self.policy.hash(key);
        let mut backoff = Backoff::new();
        loop {
            let b = gen.bucket_index(hash);
            record.protect(gen.as_table_ptr(), b);
            let head = match self.route_mut(gen, b, record) {
                Route::Forward(next) => {
                    gen = next;
                    continue;
                }
                Route::Proceed(head) => head,
            };
            if gen
                .find(b, |w| self.policy.equal(P::Key::from_word(w), key))
                .is_some()
            {
                record.set_bucket(NO_BUCKET);
                return true;
            }
            let i = match gen.claim_slot(b, &self.registry, record) {
                Ok(i) => i,
                Err(NeighborhoodFull) => {
                    // nothing recyclable and nothing relocatable: grow
                    self.grow(gen, None, record);
                    continue;
                }
            };
            let off = gen.offset_to(b, i);
            gen.slot(i).store_value(value_word);
            gen.meta(i).store_link(LinkState::new(head.first(), off));
            gen.slot(i).store_key(key_word);
            if gen.cas_head(b, head, head.with_first(off)) {
                record.set_bucket(NO_BUCKET);
                let n = gen.count.fetch_add(1, Ordering::SeqCst) + 1;
                if n > gen.threshold.load(Ordering::SeqCst) {
                    self.grow(gen, None, record);
                }
                return false;
            }
            // the chain changed under us: release the claim, leaving no
            // partial state, and start over
            gen.meta(i).store_link(LinkState::UNLINKED);
            gen.slot(i).store_key(self.sent.unused);
            backoff.wait();
        }
    }

    /// Copy `bucket`'s chain to the successor if that has not happened yet,
    /// waiting out whoever else is working on it.
    fn ensure_bucket_copied(&self, gen: &Generation, bucket: usize, record: &HazardRecord) {
        let succ = self.successor_of(gen);
        let mut backoff = Backoff::new();
        loop {
            let head = gen.head(bucket);
            if head.copied() {
                return;
            }
            if !head.locked() {
                let frozen = head.with_stale().with_locked(true);
                if gen.cas_head(bucket, head, frozen) {
                    self.copy_chain(gen, bucket, frozen, succ, record);
                    return;
                }
                continue;
            }
            record.set_bucket(NO_BUCKET);
            backoff.wait();
        }
    }

    /// One attempt to freeze and copy `bucket`; fails if a maintenance pass
    /// or another copier currently holds the chain.
    fn try_copy_bucket(
        &self,
        gen: &Generation,
        bucket: usize,
        succ: &Generation,
        record: &HazardRecord,
    ) -> bool {
        let head = gen.head(bucket);
        if head.copied() {
            return true;
        }
        if head.locked() {
            return false;
        }
        let frozen = head.with_stale().with_locked(true);
        if !gen.cas_head(bucket, head, frozen) {
            return false;
        }
        self.copy_chain(gen, bucket, frozen, succ, record);
        true
    }

    /// Move the live entries of a frozen chain into the successor, then mark
    /// the bucket copied. Runs with the chain lock held; the stale bit makes
    /// concurrent lookups wait and concurrent mutators assist-then-forward.
    fn copy_chain(
        &self,
        gen: &Generation,
        bucket: usize,
        frozen: crate::slot::HeadState,
        succ: &Generation,
        record: &HazardRecord,
    ) {
        let sent = gen.sentinels();

        // freeze deleted slots so a recycler cannot grab them mid-copy
        let mut off = frozen.first();
        while off != NIL {
            let i = gen.at(bucket, off);
            if gen.slot(i).key() == sent.deleted {
                gen.slot(i).cas_key(sent.deleted, sent.reclaiming);
            }
            off = gen.meta(i).link().next();
        }

        // move each live entry: consume it out of this chain first, then
        // re-insert it into the successor keyed by its full hash. the
        // consume and a concurrent remove's delete-mark race on the same
        // key word, so exactly one wins: a consumed entry can only die in
        // the successor, a marked one dies here and is skipped. the chain
        // cannot change shape under us (we hold the lock and recycling is
        // frozen), so the walk needs no hazard cover even though insert_in
        // moves the record to the successor.
        let mut off = frozen.first();
        while off != NIL {
            let i = gen.at(bucket, off);
            let w = gen.slot(i).key();
            if !sent.is_sentinel(w) && gen.slot(i).cas_key(w, sent.reclaiming) {
                let v = gen.slot(i).value();
                if self.insert_in(succ, P::Key::from_word(w), v, record) {
                    // the key is already downstream (transient duplicates can
                    // exist while forwarding chains through more than one
                    // generation); this occurrence is discarded
                    self.notify(HookKind::Remove, v);
                }
            }
            off = gen.meta(i).link().next();
        }

        gen.meta(bucket)
            .store_head(frozen.with_copied().with_locked(false));
    }

    /// Trigger or assist a resize of `gen`. Exactly one thread wins the
    /// initiation CAS, allocates the successor, and publishes it; everyone
    /// else becomes an assistant and steals copy segments.
    fn grow(&self, gen: &Generation, target: Option<usize>, record: &HazardRecord) {
        if !gen.successor().is_null() {
            self.help_copy(gen, record);
            return;
        }
        if gen.migrated.load(Ordering::SeqCst) {
            return;
        }
        if gen
            .resize_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.help_copy(gen, record);
            return;
        }

        let old_len = gen.len();
        let new_len = match target {
            Some(n) => n,
            None => self.grown_size(old_len),
        };
        if target.is_none() && new_len <= old_len {
            // cannot grow further; ease off the trigger instead
            let threshold = gen.threshold.load(Ordering::SeqCst);
            let raised = threshold + threshold / 2 + 1;
            warn!(
                "table at maximum capacity ({} slots); raising resize threshold to {}",
                old_len, raised
            );
            gen.threshold.store(raised, Ordering::SeqCst);
            gen.resize_claimed.store(false, Ordering::SeqCst);
            return;
        }

        match self.allocate_generation(new_len) {
            Ok(succ) => {
                debug!("resizing {} -> {} slots", old_len, new_len);
                gen.publish_successor(Box::into_raw(succ));
                self.help_copy(gen, record);
            }
            Err(err) => {
                // degraded but functional: keep running on the existing
                // generation and make the trigger less eager
                let threshold = gen.threshold.load(Ordering::SeqCst);
                let raised = threshold + threshold / 2 + 1;
                warn!(
                    "failed to allocate successor of {} slots ({}); raising resize threshold to {}",
                    new_len, err, raised
                );
                gen.threshold.store(raised, Ordering::SeqCst);
                gen.resize_claimed.store(false, Ordering::SeqCst);
            }
        }
    }

    fn grown_size(&self, len: usize) -> usize {
        let factor = self
            .tiers
            .iter()
            .find(|&&(limit, _)| len < limit)
            .map(|&(_, factor)| factor)
            .unwrap_or(1.2);
        (((len as f64) * factor).ceil() as usize)
            .max(len + GROUP)
            .min(MAXIMUM_CAPACITY)
    }

    fn allocate_generation(
        &self,
        len: usize,
    ) -> Result<Box<Generation>, std::collections::TryReserveError> {
        let window = effective_window(self.window, len);
        let threshold = load_factor!(len);
        if let Some(mut shell) = self.pool.lock().pop() {
            shell.reset(len, window, threshold)?;
            return Ok(shell);
        }
        Generation::try_alloc(len, window, threshold, self.sent)
    }

    /// Steal and copy segments of `gen` until none are left. The thread that
    /// completes the last segment sweeps the stragglers, marks the
    /// generation migrated, and adopts the successor.
    fn help_copy(&self, gen: &Generation, record: &HazardRecord) {
        let succ = {
            let mut backoff = Backoff::new();
            loop {
                let s = gen.successor();
                if !s.is_null() {
                    break s;
                }
                if !gen.resize_claimed.load(Ordering::SeqCst) {
                    // initiation was abandoned (allocation failure)
                    return;
                }
                record.set_bucket(NO_BUCKET);
                backoff.wait();
            }
        };
        // safety: a successor outlives its predecessor
        let succ = unsafe { &*succ };

        let n = gen.len();
        let ncpu = num_cpus();
        let stride = if ncpu > 1 { (n >> 3) / ncpu } else { n };
        let stride = stride.max(MIN_COPY_STRIDE);
        let segments = (n + stride - 1) / stride;

        loop {
            let seg = gen.next_segment.fetch_add(1, Ordering::SeqCst);
            if seg >= segments {
                return;
            }
            trace!("copying segment {} of {}", seg, segments);
            let start = seg * stride;
            let end = (start + stride).min(n);
            for b in start..end {
                if !self.try_copy_bucket(gen, b, succ, record) {
                    gen.note_incomplete(b);
                }
            }
            if gen.segments_done.fetch_add(1, Ordering::SeqCst) + 1 == segments {
                self.finish_copy(gen, succ, record);
            }
        }
    }

    fn finish_copy(&self, gen: &Generation, succ: &Generation, record: &HazardRecord) {
        // re-attempt whatever the segment owners had to skip over
        let lo = gen.incomplete_lo.load(Ordering::SeqCst);
        let hi = gen.incomplete_hi.load(Ordering::SeqCst);
        if lo < gen.len() {
            let mut backoff = Backoff::new();
            for b in lo..=hi {
                while !self.try_copy_bucket(gen, b, succ, record) {
                    record.set_bucket(NO_BUCKET);
                    backoff.wait();
                }
            }
        }
        gen.migrated.store(true, Ordering::SeqCst);
        debug!("resize to {} slots complete", succ.len());

        let _ = self.current.compare_exchange(
            gen as *const Generation as *mut Generation,
            succ as *const Generation as *mut Generation,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.reclaim_generations();
    }

    /// Free (pool) superseded generations that are migrated and no longer
    /// referenced by any hazard record. Only one thread scans at a time;
    /// generations are reclaimed strictly oldest-first so a record moving
    /// from a generation to its successor can never be overtaken.
    fn reclaim_generations(&self) {
        let Some(_guard) = self.reclaim_lock.try_lock() else {
            return;
        };
        loop {
            let old = self.oldest.load(Ordering::SeqCst);
            let cur = self.current.load(Ordering::SeqCst);
            if old == cur {
                break;
            }
            // safety: chain nodes are freed only here, under the lock
            let gen = unsafe { &*old };
            if !gen.migrated.load(Ordering::SeqCst) {
                break;
            }
            if self.registry.references(old as *const ()) {
                break;
            }
            let next = gen.successor();
            debug_assert!(!next.is_null());
            self.oldest.store(next, Ordering::SeqCst);
            trace!("reclaiming superseded generation of {} slots", gen.len());
            // safety: superseded, migrated, unreferenced, and now unlinked
            let shell = unsafe { Box::from_raw(old) };
            let mut pool = self.pool.lock();
            if pool.len() < POOL_GENERATIONS {
                pool.push(shell);
            }
        }
    }

    /// Mark-and-sweep pass over one bucket: unlink DELETED slots under the
    /// chain lock and, once no other thread is walking the bucket, reset
    /// them to UNUSED. A single uncontended attempt; bails out the moment
    /// anything else has the bucket.
    fn try_reclaim_bucket(&self, gen: &Generation, bucket: usize, record: &HazardRecord) {
        if !self
            .registry
            .bucket_quiescent(gen.as_table_ptr(), bucket, record)
        {
            return;
        }
        let head = gen.head(bucket);
        if head.locked() || head.stale() || head.copied() {
            return;
        }
        let locked = head.with_locked(true);
        if !gen.cas_head(bucket, head, locked) {
            return;
        }

        let sent = gen.sentinels();
        let mut freed = Vec::new();
        let mut new_head = locked;
        let mut prev = NIL;
        let mut off = locked.first();
        while off != NIL {
            let i = gen.at(bucket, off);
            let next = gen.meta(i).link().next();
            if gen.slot(i).cas_key(sent.deleted, sent.reclaiming) {
                if prev == NIL {
                    new_head = new_head.with_first(next);
                } else {
                    let p = gen.at(bucket, prev);
                    let plink = gen.meta(p).link();
                    gen.meta(p).store_link(plink.with_next(next));
                }
                freed.push(i);
            } else {
                prev = off;
            }
            off = next;
        }
        gen.unlock_bucket(bucket, new_head);
        if freed.is_empty() {
            return;
        }

        // stragglers that entered the chain before the cut must drain before
        // the slots become claimable again
        self.registry
            .wait_bucket_quiescent(gen.as_table_ptr(), bucket, record);
        for i in freed {
            gen.meta(i).store_link(LinkState::UNLINKED);
            gen.slot(i).store_key(sent.unused);
        }
    }

    /// The current generation with any in-flight migration helped to
    /// completion, so a linear slot walk sees one authoritative array.
    fn settled_generation(&self, record: &HazardRecord) -> &Generation {
        let mut backoff = Backoff::new();
        loop {
            let gen = self.current_generation(record);
            if gen.successor().is_null() {
                return gen;
            }
            self.help_copy(gen, record);
            backoff.wait();
        }
    }
}

impl<P: TablePolicy> std::fmt::Debug for HashTable<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable").field("len", &self.len()).finish()
    }
}

impl<P: TablePolicy> Drop for HashTable<P> {
    fn drop(&mut self) {
        // &mut self: no operations are in flight, so any resize has run to
        // completion and only the current generation still holds entries
        let delete_hook = self.delete_hook.get_mut().take();
        let current = *self.current.get_mut();
        let mut p = *self.oldest.get_mut();
        while !p.is_null() {
            // safety: chain generations are owned by the container
            let gen = unsafe { Box::from_raw(p) };
            if p == current {
                if let Some(hook) = &delete_hook {
                    let sent = gen.sentinels();
                    for i in 0..gen.len() {
                        let w = gen.slot(i).key();
                        if !sent.is_sentinel(w) {
                            hook(P::Value::from_word(gen.slot(i).value()));
                        }
                    }
                }
            }
            p = gen.successor();
        }
    }
}
