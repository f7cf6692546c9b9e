use crate::backoff::Backoff;
use crate::hazard::{HazardRecord, Registry};
use crate::slot::{BucketMeta, HeadState, LinkState, Slot, NIL};
use std::collections::TryReserveError;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Slots per cache-line-sized group. A claim scans the rest of the target
/// bucket's group before probing the wider window, so colliding inserts tend
/// to land on the line already in cache.
pub(crate) const GROUP: usize = 8;

/// The three key words reserved out of the key domain, cached off the policy
/// at construction so the engine never goes back through trait calls on the
/// hot path.
#[derive(Copy, Clone)]
pub(crate) struct Sentinels {
    pub(crate) unused: u64,
    pub(crate) deleted: u64,
    pub(crate) reclaiming: u64,
}

impl Sentinels {
    #[inline]
    pub(crate) fn is_sentinel(&self, word: u64) -> bool {
        word == self.unused || word == self.deleted || word == self.reclaiming
    }
}

/// Every slot a bucket may use is taken and neither recycling nor relocation
/// could make room; the caller responds by growing the table.
pub(crate) struct NeighborhoodFull;

/// Where a slot sits in its owner's chain.
enum ChainPosition {
    Head,
    After(i16),
    Absent,
}

#[inline]
fn wrap(i: isize, len: usize) -> usize {
    let len = len as isize;
    let i = if i < 0 {
        i + len
    } else if i >= len {
        i - len
    } else {
        i
    };
    i as usize
}

/// One hash-array generation: a slot array, its chain metadata, and the
/// bookkeeping for migrating to a successor generation.
///
/// The container holds a pointer to the current generation; a resize
/// allocates a successor, publishes it through `successor` (set at most
/// once), and copies buckets over incrementally while operations forward
/// through. The generation stays allocated until it is superseded, fully
/// migrated, and hazard-quiescent.
pub(crate) struct Generation {
    slots: Box<[Slot]>,
    meta: Box<[BucketMeta]>,
    /// Effective search window of this generation: a bucket may only use
    /// slots within `window` positions of its own index.
    window: i16,
    /// Entry count at which the next resize is triggered. Raised in place
    /// when a successor cannot be allocated.
    pub(crate) threshold: AtomicUsize,
    /// Live entries physically resident in this generation.
    pub(crate) count: AtomicUsize,
    successor: AtomicPtr<Generation>,
    sent: Sentinels,

    /// Resize initiation lock; the single CAS winner allocates and publishes
    /// the successor, everyone else assists.
    pub(crate) resize_claimed: AtomicBool,
    /// Next copy segment index to steal.
    pub(crate) next_segment: AtomicUsize,
    /// Completed copy segments.
    pub(crate) segments_done: AtomicUsize,
    /// Low/high water marks of buckets a segment owner had to skip because
    /// a maintenance pass held their chain; the cleanup pass re-walks them.
    pub(crate) incomplete_lo: AtomicUsize,
    pub(crate) incomplete_hi: AtomicUsize,
    /// All buckets copied; the generation is reclaimable once unreferenced.
    pub(crate) migrated: AtomicBool,
}

impl Generation {
    pub(crate) fn try_alloc(
        len: usize,
        window: i16,
        threshold: usize,
        sent: Sentinels,
    ) -> Result<Box<Generation>, TryReserveError> {
        let mut slots: Vec<Slot> = Vec::new();
        slots.try_reserve_exact(len)?;
        slots.resize_with(len, || Slot::new(sent.unused));
        let mut meta: Vec<BucketMeta> = Vec::new();
        meta.try_reserve_exact(len)?;
        meta.resize_with(len, BucketMeta::new);

        Ok(Box::new(Generation {
            slots: slots.into_boxed_slice(),
            meta: meta.into_boxed_slice(),
            window,
            threshold: AtomicUsize::new(threshold),
            count: AtomicUsize::new(0),
            successor: AtomicPtr::new(std::ptr::null_mut()),
            sent,
            resize_claimed: AtomicBool::new(false),
            next_segment: AtomicUsize::new(0),
            segments_done: AtomicUsize::new(0),
            incomplete_lo: AtomicUsize::new(len),
            incomplete_hi: AtomicUsize::new(0),
            migrated: AtomicBool::new(false),
        }))
    }

    /// Re-initialize a pooled generation shell for reuse at a new size.
    pub(crate) fn reset(
        &mut self,
        len: usize,
        window: i16,
        threshold: usize,
    ) -> Result<(), TryReserveError> {
        let unused = self.sent.unused;
        let mut slots: Vec<Slot> = Vec::new();
        slots.try_reserve_exact(len)?;
        slots.resize_with(len, || Slot::new(unused));
        let mut meta: Vec<BucketMeta> = Vec::new();
        meta.try_reserve_exact(len)?;
        meta.resize_with(len, BucketMeta::new);

        self.slots = slots.into_boxed_slice();
        self.meta = meta.into_boxed_slice();
        self.window = window;
        *self.threshold.get_mut() = threshold;
        *self.count.get_mut() = 0;
        *self.successor.get_mut() = std::ptr::null_mut();
        *self.resize_claimed.get_mut() = false;
        *self.next_segment.get_mut() = 0;
        *self.segments_done.get_mut() = 0;
        *self.incomplete_lo.get_mut() = len;
        *self.incomplete_hi.get_mut() = 0;
        *self.migrated.get_mut() = false;
        Ok(())
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn window(&self) -> i16 {
        self.window
    }

    #[inline]
    pub(crate) fn sentinels(&self) -> Sentinels {
        self.sent
    }

    #[inline]
    pub(crate) fn bucket_index(&self, hash: usize) -> usize {
        hash % self.len()
    }

    #[inline]
    pub(crate) fn as_table_ptr(&self) -> *const () {
        self as *const Generation as *const ()
    }

    #[inline]
    pub(crate) fn successor(&self) -> *mut Generation {
        self.successor.load(Ordering::SeqCst)
    }

    pub(crate) fn publish_successor(&self, succ: *mut Generation) {
        let prev = self.successor.swap(succ, Ordering::SeqCst);
        debug_assert!(prev.is_null(), "successor is set at most once");
    }

    /// Index of the slot `off` positions from `bucket`, wrapping around the
    /// array ends.
    #[inline]
    pub(crate) fn at(&self, bucket: usize, off: i16) -> usize {
        wrap(bucket as isize + off as isize, self.len())
    }

    /// Offset of slot `index` relative to `bucket`; the inverse of [`Self::at`].
    #[inline]
    pub(crate) fn offset_to(&self, bucket: usize, index: usize) -> i16 {
        let len = self.len() as isize;
        let mut d = index as isize - bucket as isize;
        if d > len / 2 {
            d -= len;
        } else if d < -(len / 2) {
            d += len;
        }
        d as i16
    }

    /// The bucket that owns slot `index`, recovered from its link word.
    #[inline]
    fn owner_bucket(&self, index: usize, owner: i16) -> usize {
        wrap(index as isize - owner as isize, self.len())
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    #[inline]
    pub(crate) fn meta(&self, index: usize) -> &BucketMeta {
        &self.meta[index]
    }

    #[inline]
    pub(crate) fn head(&self, bucket: usize) -> HeadState {
        self.meta[bucket].head()
    }

    #[inline]
    pub(crate) fn cas_head(&self, bucket: usize, current: HeadState, new: HeadState) -> bool {
        self.meta[bucket].cas_head(current, new).is_ok()
    }

    /// Walk `bucket`'s chain and return the first slot whose (non-sentinel)
    /// key word satisfies `is_match`, along with the key word seen. Restarts
    /// from the head if a slot is recycled out from under the walk.
    pub(crate) fn find(
        &self,
        bucket: usize,
        mut is_match: impl FnMut(u64) -> bool,
    ) -> Option<(usize, u64)> {
        let mut backoff = Backoff::new();
        'restart: loop {
            let head = self.head(bucket);
            let mut off = head.first();
            while off != NIL {
                let i = self.at(bucket, off);
                let link = self.meta[i].link();
                if link.owner() != off {
                    // the slot now belongs to some other bucket; the chain
                    // changed shape while we were on it
                    backoff.wait();
                    continue 'restart;
                }
                let key = self.slots[i].key();
                if !self.sent.is_sentinel(key) && is_match(key) {
                    return Some((i, key));
                }
                off = link.next();
            }
            return None;
        }
    }

    /// Take the advisory chain lock of `bucket` for a maintenance pass
    /// (relocation, reclaim). Returns the locked head state, or `None` if
    /// the bucket has already been copied to the successor and its chain is
    /// frozen for good. Parks the caller's hazard record at `NO_BUCKET`
    /// while spinning so it cannot stall another maintainer's quiescence
    /// scan.
    pub(crate) fn lock_bucket(&self, bucket: usize, record: &HazardRecord) -> Option<HeadState> {
        record.set_bucket(crate::hazard::NO_BUCKET);
        let mut backoff = Backoff::new();
        loop {
            let head = self.head(bucket);
            if head.copied() {
                return None;
            }
            if head.locked() {
                backoff.wait();
                continue;
            }
            let locked = head.with_locked(true);
            if self.cas_head(bucket, head, locked) {
                return Some(locked);
            }
            backoff.wait();
        }
    }

    #[inline]
    pub(crate) fn unlock_bucket(&self, bucket: usize, new_head: HeadState) {
        debug_assert!(new_head.locked());
        self.meta[bucket].store_head(new_head.with_locked(false));
    }

    /// Find and claim a free slot for `bucket`: its own slot first, then the
    /// rest of its cache-line group, then the window forward, then backward.
    /// A claimed slot holds the RECLAIMING placeholder; the caller writes the
    /// value, links it, and publishes the real key.
    ///
    /// With no free slot in the window, falls back to recycling a deleted
    /// slot, then to relocating another bucket's entry out of the window.
    pub(crate) fn claim_slot(
        &self,
        bucket: usize,
        registry: &Registry,
        record: &HazardRecord,
    ) -> Result<usize, NeighborhoodFull> {
        let unused = self.sent.unused;
        let reclaiming = self.sent.reclaiming;
        for i in self.neighborhood(bucket) {
            if self.slots[i].cas_key(unused, reclaiming) {
                return Ok(i);
            }
        }

        if let Some(i) = self.recycle_deleted(bucket, registry, record) {
            return Ok(i);
        }
        if let Some(i) = self.relocate_blocking_entry(bucket, registry, record) {
            return Ok(i);
        }
        Err(NeighborhoodFull)
    }

    /// Every slot position `bucket` may use, in claim-scan order.
    fn neighborhood(&self, bucket: usize) -> impl Iterator<Item = usize> + '_ {
        let len = self.len();
        let w = self.window as isize;
        let group = bucket - bucket % GROUP;
        let group_end = (group + GROUP).min(len);
        std::iter::once(bucket)
            .chain((group..group_end).filter(move |&i| i != bucket))
            .chain((1..=w).map(move |d| wrap(bucket as isize + d, len)))
            .chain((1..=w).map(move |d| wrap(bucket as isize - d, len)))
    }

    /// Resurrect a DELETED slot within the window: mark it RECLAIMING so no
    /// one else grabs it, cut it out of its old chain, and wait out any
    /// walker still on that chain before handing it to the caller.
    fn recycle_deleted(
        &self,
        bucket: usize,
        registry: &Registry,
        record: &HazardRecord,
    ) -> Option<usize> {
        let deleted = self.sent.deleted;
        let reclaiming = self.sent.reclaiming;
        for i in self.neighborhood(bucket) {
            if self.slots[i].key() != deleted {
                continue;
            }
            if !self.slots[i].cas_key(deleted, reclaiming) {
                continue;
            }
            let link = self.meta[i].link();
            if link.owner() == NIL {
                // not on any chain; nothing is lost by leaving it alone
                self.slots[i].store_key(deleted);
                continue;
            }
            let owner = self.owner_bucket(i, link.owner());
            if self.unlink_slot(owner, i, registry, record) {
                return Some(i);
            }
            // the owner bucket was already copied out; its chain belongs to
            // a dying generation, so put the corpse back
            self.slots[i].store_key(deleted);
        }
        None
    }

    /// Cut `index` out of `owner`'s chain under the chain lock, then wait
    /// for walkers that entered before the cut to drain. Returns `false` if
    /// the bucket has been copied and its chain is frozen.
    fn unlink_slot(
        &self,
        owner: usize,
        index: usize,
        registry: &Registry,
        record: &HazardRecord,
    ) -> bool {
        let Some(head) = self.lock_bucket(owner, record) else {
            return false;
        };
        let off = self.offset_to(owner, index);
        let next = self.meta[index].link().next();
        let mut new_head = head;
        match self.chain_position(owner, head, off) {
            ChainPosition::Head => {
                new_head = head.with_first(next);
            }
            ChainPosition::After(prev) => {
                let p = self.at(owner, prev);
                let plink = self.meta[p].link();
                self.meta[p].store_link(plink.with_next(next));
            }
            // someone already cut it out; the slot is still ours
            ChainPosition::Absent => {}
        }
        self.unlock_bucket(owner, new_head);
        registry.wait_bucket_quiescent(self.as_table_ptr(), owner, record);
        true
    }

    /// Hopscotch relocation: find a slot inside `bucket`'s window that holds
    /// some other bucket's entry, move that entry to a spare slot its owner
    /// can still reach, and hand the vacated slot to the caller. Runs under
    /// the owner's chain lock, with the same discipline as reclaim.
    fn relocate_blocking_entry(
        &self,
        bucket: usize,
        registry: &Registry,
        record: &HazardRecord,
    ) -> Option<usize> {
        let unused = self.sent.unused;
        let reclaiming = self.sent.reclaiming;
        let deleted = self.sent.deleted;

        for i in self.neighborhood(bucket) {
            let link = self.meta[i].link();
            if link.owner() == NIL {
                continue;
            }
            let key = self.slots[i].key();
            if self.sent.is_sentinel(key) {
                continue;
            }
            let owner = self.owner_bucket(i, link.owner());
            if owner == bucket {
                continue;
            }
            let Some(head) = self.lock_bucket(owner, record) else {
                continue;
            };
            // re-check under the lock; the entry may have moved or died
            let link = self.meta[i].link();
            let key = self.slots[i].key();
            if link.owner() == NIL
                || self.sent.is_sentinel(key)
                || self.owner_bucket(i, link.owner()) != owner
            {
                self.unlock_bucket(owner, head);
                continue;
            }

            // a spare slot the owner can still reach
            let mut spare = None;
            for j in self.neighborhood(owner) {
                if self.slots[j].cas_key(unused, reclaiming) {
                    spare = Some(j);
                    break;
                }
            }
            let Some(j) = spare else {
                self.unlock_bucket(owner, head);
                continue;
            };

            // install the entry at its new position, then splice it into the
            // chain where the old one was. a reader meanwhile sees one or
            // both positions; both hold the same entry, so either is fine.
            self.slots[j].store_value(self.slots[i].value());
            self.meta[j].store_link(LinkState::new(link.next(), self.offset_to(owner, j)));
            self.slots[j].store_key(key);

            let off_i = self.offset_to(owner, i);
            let off_j = self.offset_to(owner, j);
            let mut new_head = head;
            match self.chain_position(owner, head, off_i) {
                ChainPosition::Head => {
                    new_head = head.with_first(off_j);
                }
                ChainPosition::After(prev) => {
                    let p = self.at(owner, prev);
                    let plink = self.meta[p].link();
                    self.meta[p].store_link(plink.with_next(off_j));
                }
                ChainPosition::Absent => {
                    // the entry left the chain while we were locking; undo
                    self.slots[j].store_key(unused);
                    self.meta[j].store_link(LinkState::UNLINKED);
                    self.unlock_bucket(owner, head);
                    continue;
                }
            }

            // retire the original position. the only concurrent key writer
            // is a remove marking it DELETED; propagate that to the copy so
            // the entry does not resurrect.
            if !self.slots[i].cas_key(key, reclaiming) {
                debug_assert_eq!(self.slots[i].key(), deleted);
                self.slots[j].cas_key(key, deleted);
                self.slots[i].store_key(reclaiming);
            }
            self.unlock_bucket(owner, new_head);
            registry.wait_bucket_quiescent(self.as_table_ptr(), owner, record);
            return Some(i);
        }
        None
    }

    fn chain_position(&self, bucket: usize, head: HeadState, target: i16) -> ChainPosition {
        if head.first() == target {
            return ChainPosition::Head;
        }
        let mut prev = head.first();
        while prev != NIL {
            let next = self.meta[self.at(bucket, prev)].link().next();
            if next == target {
                return ChainPosition::After(prev);
            }
            prev = next;
        }
        ChainPosition::Absent
    }

    pub(crate) fn note_incomplete(&self, bucket: usize) {
        self.incomplete_lo.fetch_min(bucket, Ordering::SeqCst);
        self.incomplete_hi.fetch_max(bucket, Ordering::SeqCst);
    }
}
