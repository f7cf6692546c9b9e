use crate::backoff::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::thread::ThreadId;

/// Published while a thread holds a generation but is not inside any
/// particular bucket's chain. A record with `NO_BUCKET` keeps its generation
/// alive but never delays a bucket-level quiescence scan; threads parked in
/// a backoff loop (waiting on a chain lock or a stale bucket) must drop to
/// `NO_BUCKET` or they deadlock the maintainer they are waiting for.
pub(crate) const NO_BUCKET: usize = usize::MAX;

/// Per-thread announcement of the `(generation, bucket)` currently being
/// touched. Reclamation scans these before freeing a superseded generation
/// or resetting an unlinked slot; this is the only mechanism that makes it
/// safe to free a generation other threads may still be forwarding through.
pub(crate) struct HazardRecord {
    table: AtomicPtr<()>,
    bucket: AtomicUsize,
    in_use: AtomicBool,
    next: AtomicPtr<HazardRecord>,
}

impl HazardRecord {
    fn new(in_use: bool) -> Self {
        Self {
            table: AtomicPtr::new(std::ptr::null_mut()),
            bucket: AtomicUsize::new(NO_BUCKET),
            in_use: AtomicBool::new(in_use),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Announce that this thread is about to read `bucket` of `table`. Must
    /// happen before the bucket head is read; the reclamation scan relies on
    /// that ordering.
    #[inline]
    pub(crate) fn protect(&self, table: *const (), bucket: usize) {
        self.table.store(table as *mut (), Ordering::SeqCst);
        self.bucket.store(bucket, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn set_bucket(&self, bucket: usize) {
        self.bucket.store(bucket, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn clear(&self) {
        self.table.store(std::ptr::null_mut(), Ordering::SeqCst);
        self.bucket.store(NO_BUCKET, Ordering::SeqCst);
    }
}

/// Process-wide list of hazard records for one table.
///
/// Records are allocated once, pushed onto a grow-only list, and recycled
/// across registrations; they are freed only when the registry itself is
/// dropped, so a `&HazardRecord` handed out by [`Registry::register`] stays
/// valid for the life of the table.
pub(crate) struct Registry {
    head: AtomicPtr<HazardRecord>,
    /// Threads with a live registration, for double-register detection.
    registered: Mutex<Vec<ThreadId>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Install hazard-tracking state for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is already registered; registering twice
    /// is a programming error, not a recoverable condition.
    pub(crate) fn register(&self) -> &HazardRecord {
        let id = std::thread::current().id();
        let mut registered = self.registered.lock();
        assert!(
            !registered.contains(&id),
            "thread is already registered with this table"
        );
        registered.push(id);

        // recycle a record from an unregistered thread if there is one
        let mut p = self.head.load(Ordering::SeqCst);
        while !p.is_null() {
            // safety: records are freed only on registry drop, which requires
            // exclusive access; we hold a shared borrow.
            let record = unsafe { &*p };
            if record
                .in_use
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return record;
            }
            p = record.next.load(Ordering::Relaxed);
        }

        let record = Box::into_raw(Box::new(HazardRecord::new(true)));
        loop {
            let head = self.head.load(Ordering::SeqCst);
            // safety: we own `record` until it is published
            unsafe { &*record }.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange(head, record, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        // safety: see recycle case above
        unsafe { &*record }
    }

    /// Tear down the calling thread's registration. The record itself is
    /// kept on the list for reuse by a later registration.
    pub(crate) fn unregister(&self, record: &HazardRecord) {
        record.clear();
        let id = std::thread::current().id();
        let mut registered = self.registered.lock();
        if let Some(at) = registered.iter().position(|r| *r == id) {
            registered.swap_remove(at);
        }
        record.in_use.store(false, Ordering::SeqCst);
    }

    fn records(&self) -> RecordIter<'_> {
        RecordIter {
            next: self.head.load(Ordering::SeqCst),
            _registry: self,
        }
    }

    /// Does any live record reference `table`?
    pub(crate) fn references(&self, table: *const ()) -> bool {
        self.records().any(|record| {
            record.in_use.load(Ordering::SeqCst)
                && record.table.load(Ordering::SeqCst) as *const () == table
        })
    }

    /// Is any live record other than `skip` inside `bucket` of `table`?
    pub(crate) fn bucket_quiescent(
        &self,
        table: *const (),
        bucket: usize,
        skip: &HazardRecord,
    ) -> bool {
        !self.records().any(|record| {
            !std::ptr::eq(record, skip)
                && record.in_use.load(Ordering::SeqCst)
                && record.table.load(Ordering::SeqCst) as *const () == table
                && record.bucket.load(Ordering::SeqCst) == bucket
        })
    }

    /// Block (bounded backoff) until no other thread is walking `bucket` of
    /// `table`. Walkers drain on their own: traversal never blocks on the
    /// chain lock, and waiters park at `NO_BUCKET`.
    pub(crate) fn wait_bucket_quiescent(
        &self,
        table: *const (),
        bucket: usize,
        skip: &HazardRecord,
    ) {
        let mut backoff = Backoff::new();
        while !self.bucket_quiescent(table, bucket, skip) {
            backoff.wait();
        }
    }
}

struct RecordIter<'a> {
    next: *mut HazardRecord,
    _registry: &'a Registry,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a HazardRecord;

    fn next(&mut self) -> Option<&'a HazardRecord> {
        if self.next.is_null() {
            return None;
        }
        // safety: records live until the registry is dropped, which cannot
        // happen while we borrow it.
        let record = unsafe { &*self.next };
        self.next = record.next.load(Ordering::Relaxed);
        Some(record)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // we have &mut self, so no references into the list remain
        let mut p = *self.head.get_mut();
        while !p.is_null() {
            // safety: records are owned by the list and freed exactly here
            let record = unsafe { Box::from_raw(p) };
            p = record.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_reuses_records() {
        let registry = Registry::new();
        let r1 = registry.register() as *const HazardRecord;
        registry.unregister(unsafe { &*r1 });
        let r2 = registry.register() as *const HazardRecord;
        assert_eq!(r1, r2);
        registry.unregister(unsafe { &*r2 });
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_register_panics() {
        let registry = Registry::new();
        let _r = registry.register();
        let _oops = registry.register();
    }

    #[test]
    fn quiescence_tracks_buckets() {
        let registry = Registry::new();
        let walker = registry.register();
        let reclaimer = std::thread::scope(|s| {
            s.spawn(|| registry.register() as *const HazardRecord as usize)
                .join()
                .unwrap()
        });
        let reclaimer = unsafe { &*(reclaimer as *const HazardRecord) };

        let table = 0x1000 as *const ();
        walker.protect(table, 7);
        assert!(!registry.bucket_quiescent(table, 7, reclaimer));
        assert!(registry.bucket_quiescent(table, 8, reclaimer));
        assert!(registry.references(table));

        walker.set_bucket(NO_BUCKET);
        assert!(registry.bucket_quiescent(table, 7, reclaimer));
        assert!(registry.references(table));

        walker.clear();
        assert!(!registry.references(table));
    }
}
