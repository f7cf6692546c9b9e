use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Chain offsets are signed and relative to the owning bucket index. `NIL`
/// is reserved out of the legal offset range and terminates a chain.
pub(crate) const NIL: i16 = i16::MIN;

const OFFSET_MASK: u32 = 0xffff;
const LOCKED: u32 = 1 << 16;
const STALE: u32 = 1 << 17;
const COPIED: u32 = 1 << 18;

#[inline]
fn pack_offset(off: i16) -> u32 {
    off as u16 as u32
}

#[inline]
fn unpack_offset(bits: u32) -> i16 {
    (bits & OFFSET_MASK) as u16 as i16
}

/// Snapshot of a bucket's head word: the offset of the first slot in its
/// chain plus the status bits, packed so that both are always read and
/// replaced by a single compare-exchange. An insert that races a copy or a
/// chain-maintenance pass is guaranteed to fail its head CAS and restart,
/// because the maintainer changed the status bits of the very same word.
///
/// Status bits:
///  - `LOCKED`: the chain is under exclusive maintenance (relocation,
///    reclaim, or copy). Readers still traverse freely; writers wait.
///  - `STALE`: copying this bucket to the successor generation has started.
///  - `COPIED`: copying has finished; operations must forward.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct HeadState(u32);

impl HeadState {
    pub(crate) const EMPTY: HeadState = HeadState(NIL as u16 as u32);

    #[inline]
    pub(crate) fn first(self) -> i16 {
        unpack_offset(self.0)
    }

    #[inline]
    pub(crate) fn locked(self) -> bool {
        self.0 & LOCKED != 0
    }

    #[inline]
    pub(crate) fn stale(self) -> bool {
        self.0 & STALE != 0
    }

    #[inline]
    pub(crate) fn copied(self) -> bool {
        self.0 & COPIED != 0
    }

    #[inline]
    pub(crate) fn with_first(self, off: i16) -> HeadState {
        HeadState((self.0 & !OFFSET_MASK) | pack_offset(off))
    }

    #[inline]
    pub(crate) fn with_locked(self, locked: bool) -> HeadState {
        if locked {
            HeadState(self.0 | LOCKED)
        } else {
            HeadState(self.0 & !LOCKED)
        }
    }

    #[inline]
    pub(crate) fn with_stale(self) -> HeadState {
        HeadState(self.0 | STALE)
    }

    #[inline]
    pub(crate) fn with_copied(self) -> HeadState {
        HeadState(self.0 | COPIED)
    }
}

impl std::fmt::Debug for HeadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadState")
            .field("first", &self.first())
            .field("locked", &self.locked())
            .field("stale", &self.stale())
            .field("copied", &self.copied())
            .finish()
    }
}

/// Snapshot of a slot's link word: the offset of the next slot in the chain
/// and the offset of this slot itself, both relative to the owning bucket.
/// A slot can recover its owner as `index - owner()`, and a walker can
/// detect that a slot was recycled out from under it by re-checking that
/// `owner()` still equals the offset it arrived by.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct LinkState(u32);

impl LinkState {
    pub(crate) const UNLINKED: LinkState =
        LinkState((NIL as u16 as u32) << 16 | NIL as u16 as u32);

    #[inline]
    pub(crate) fn new(next: i16, owner: i16) -> LinkState {
        LinkState((owner as u16 as u32) << 16 | pack_offset(next))
    }

    #[inline]
    pub(crate) fn next(self) -> i16 {
        unpack_offset(self.0)
    }

    #[inline]
    pub(crate) fn owner(self) -> i16 {
        (self.0 >> 16) as u16 as i16
    }

    #[inline]
    pub(crate) fn with_next(self, next: i16) -> LinkState {
        LinkState((self.0 & !OFFSET_MASK) | pack_offset(next))
    }
}

impl std::fmt::Debug for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkState")
            .field("next", &self.next())
            .field("owner", &self.owner())
            .finish()
    }
}

/// Per-index chain metadata: the head word for the bucket anchored at this
/// index, and the link word for the slot stored at this index.
pub(crate) struct BucketMeta {
    head: AtomicU32,
    link: AtomicU32,
}

impl BucketMeta {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicU32::new(HeadState::EMPTY.0),
            link: AtomicU32::new(LinkState::UNLINKED.0),
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> HeadState {
        HeadState(self.head.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn cas_head(&self, current: HeadState, new: HeadState) -> Result<(), HeadState> {
        match self
            .head
            .compare_exchange(current.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(observed) => Err(HeadState(observed)),
        }
    }

    /// Store the head word directly. Only the holder of the `LOCKED` bit may
    /// do this, since nothing else prevents a concurrent head CAS.
    #[inline]
    pub(crate) fn store_head(&self, new: HeadState) {
        self.head.store(new.0, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn link(&self) -> LinkState {
        LinkState(self.link.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn store_link(&self, new: LinkState) {
        self.link.store(new.0, Ordering::SeqCst);
    }
}

/// A key/value cell. Status (unused / deleted / reclaiming / active) is
/// derived from comparing the key word against the policy's sentinels, not
/// kept as a separate field.
pub(crate) struct Slot {
    key: AtomicU64,
    value: AtomicU64,
}

impl Slot {
    pub(crate) fn new(unused: u64) -> Self {
        Self {
            key: AtomicU64::new(unused),
            value: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> u64 {
        self.key.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn cas_key(&self, current: u64, new: u64) -> bool {
        self.key
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub(crate) fn store_key(&self, new: u64) {
        self.key.store(new, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn cas_value(&self, current: u64, new: u64) -> bool {
        self.value
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub(crate) fn store_value(&self, new: u64) {
        self.value.store(new, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_roundtrip() {
        let h = HeadState::EMPTY;
        assert_eq!(h.first(), NIL);
        assert!(!h.locked() && !h.stale() && !h.copied());

        let h = h.with_first(-42).with_locked(true).with_stale();
        assert_eq!(h.first(), -42);
        assert!(h.locked());
        assert!(h.stale());
        assert!(!h.copied());

        let h = h.with_locked(false).with_copied();
        assert!(!h.locked());
        assert!(h.copied());
        assert_eq!(h.first(), -42);
    }

    #[test]
    fn link_roundtrip() {
        let l = LinkState::new(17, -3);
        assert_eq!(l.next(), 17);
        assert_eq!(l.owner(), -3);
        let l = l.with_next(NIL);
        assert_eq!(l.next(), NIL);
        assert_eq!(l.owner(), -3);
    }
}
