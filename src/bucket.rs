//! Fixed-width buckets with a per-bucket sequence counter.
//!
//! Each slot is a single `u64` word: the full 32-bit signature in the high half and the
//! key-store index in the low half. Key index 0 is reserved, so an all-zero word is an
//! empty slot and a slot can never be observed half-written.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Number of slots per bucket
pub(crate) const ENTRIES_PER_BUCKET: usize = 8;

/// `next` value of a bucket without an extension chain
const NO_NEXT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Slot(u64);

impl Slot {
    pub(crate) const EMPTY: Slot = Slot(0);

    #[inline(always)]
    pub(crate) fn new(sig: u32, key_idx: u32) -> Self {
        debug_assert!(key_idx != 0, "key index 0 is the empty marker");
        Slot(((sig as u64) << 32) | key_idx as u64)
    }

    #[inline(always)]
    pub(crate) fn sig(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline(always)]
    pub(crate) fn key_idx(self) -> u32 {
        self.0 as u32
    }

    #[inline(always)]
    pub(crate) fn is_empty(self) -> bool {
        self.key_idx() == 0
    }
}

/// Consistent copy of a bucket's slots plus the sequence it was taken at.
#[derive(Clone, Copy)]
pub(crate) struct Snapshot {
    seq: u32,
    slots: [Slot; ENTRIES_PER_BUCKET],
}

impl Snapshot {
    #[inline(always)]
    pub(crate) fn slot(&self, index: usize) -> Slot {
        self.slots[index]
    }

    /// Bitmask of occupied slots whose signature equals `sig`.
    #[inline(always)]
    pub(crate) fn match_sig(&self, sig: u32) -> u32 {
        let mut hits = 0u32;
        for (i, s) in self.slots.iter().enumerate() {
            hits |= ((s.sig() == sig && !s.is_empty()) as u32) << i;
        }
        hits
    }
}

/// Bucket: slots, extension link and seqlock (even = stable, odd = write)
#[repr(align(64))]
pub(crate) struct Bucket {
    seq: AtomicU32,
    next: AtomicU32,
    slots: [AtomicU64; ENTRIES_PER_BUCKET],
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            seq: AtomicU32::new(0),
            next: AtomicU32::new(NO_NEXT),
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl Bucket {
    // ============================================================================================
    // WRITER SIDE (caller holds writer exclusivity)
    // ============================================================================================

    #[inline(always)]
    pub(crate) fn slot(&self, index: usize) -> Slot {
        Slot(self.slots[index].load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub(crate) fn store_slot(&self, index: usize, slot: Slot) {
        self.slots[index].store(slot.0, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn find_empty(&self) -> Option<usize> {
        (0..ENTRIES_PER_BUCKET).find(|&i| self.slot(i).is_empty())
    }

    #[inline(always)]
    pub(crate) fn first_occupied(&self) -> Option<usize> {
        (0..ENTRIES_PER_BUCKET).find(|&i| !self.slot(i).is_empty())
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.first_occupied().is_none()
    }

    /// Index of the next bucket in the extension chain.
    #[inline(always)]
    pub(crate) fn next(&self) -> Option<u32> {
        match self.next.load(Ordering::Acquire) {
            NO_NEXT => None,
            n => Some(n),
        }
    }

    #[inline(always)]
    pub(crate) fn set_next(&self, next: Option<u32>) {
        self.next.store(next.unwrap_or(NO_NEXT), Ordering::Release);
    }

    /// Run `f` inside a write section: readers that overlap it will retry.
    #[inline(always)]
    pub(crate) fn write<R>(&self, versioned: bool, f: impl FnOnce(&Bucket) -> R) -> R {
        if !versioned {
            return f(self);
        }
        self.seq.fetch_add(1, Ordering::Relaxed); // odd: write in progress
        fence(Ordering::Release);
        let r = f(self);
        self.seq.fetch_add(1, Ordering::Release); // even: write complete
        r
    }

    /// Empty every slot and drop the extension link.
    pub(crate) fn clear(&self, versioned: bool) {
        self.write(versioned, |b| {
            for s in &b.slots {
                s.store(0, Ordering::Release);
            }
            b.set_next(None);
        });
    }

    // ============================================================================================
    // READER SIDE
    // ============================================================================================

    /// Copy the slots, or `None` while a write is in progress when `versioned`.
    #[inline(always)]
    pub(crate) fn snapshot(&self, versioned: bool) -> Option<Snapshot> {
        let seq = if versioned {
            self.seq.load(Ordering::Acquire)
        } else {
            0
        };
        if seq & 1 != 0 {
            return None;
        }
        let slots = std::array::from_fn(|i| Slot(self.slots[i].load(Ordering::Acquire)));
        Some(Snapshot { seq, slots })
    }

    /// True when no write began since `snap` was taken.
    ///
    /// Everything read between `snapshot` and `validate` (key bytes, data) is
    /// consistent with the snapshot only if this returns true.
    #[inline(always)]
    pub(crate) fn validate(&self, snap: &Snapshot, versioned: bool) -> bool {
        if !versioned {
            return true;
        }
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) == snap.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_packs_signature_and_index() {
        let s = Slot::new(0xdead_beef, 42);
        assert_eq!(s.sig(), 0xdead_beef);
        assert_eq!(s.key_idx(), 42);
        assert!(!s.is_empty());
        assert!(Slot::EMPTY.is_empty());
    }

    #[test]
    fn write_section_invalidates_snapshot() {
        let b = Bucket::default();
        let snap = b.snapshot(true).unwrap();
        assert!(b.validate(&snap, true));
        b.write(true, |b| b.store_slot(3, Slot::new(7, 9)));
        assert!(!b.validate(&snap, true));

        let snap = b.snapshot(true).unwrap();
        assert_eq!(snap.match_sig(7), 1 << 3);
        assert_eq!(snap.match_sig(8), 0);
        assert_eq!(b.find_empty(), Some(0));
        assert_eq!(b.first_occupied(), Some(3));
    }

    #[test]
    fn snapshot_reports_open_write_section() {
        let b = Bucket::default();
        b.write(true, |b| assert!(b.snapshot(true).is_none()));
        assert!(b.snapshot(true).is_some());
        // unversioned buckets never report a write
        b.write(false, |b| assert!(b.snapshot(false).is_some()));
    }

    #[test]
    fn clear_drops_slots_and_link() {
        let b = Bucket::default();
        b.write(false, |b| {
            b.store_slot(0, Slot::new(1, 1));
            b.set_next(Some(5));
        });
        assert_eq!(b.next(), Some(5));
        b.clear(false);
        assert!(b.is_empty());
        assert_eq!(b.next(), None);
    }
}
