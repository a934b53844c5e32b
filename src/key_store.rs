//! Position arena holding key bytes and caller data.
//!
//! Internal index 0 is reserved as the bucket-slot empty marker, so the externally
//! visible position of index `i` is `i - 1`. Key bytes live in atomic words so a reader
//! racing with slot reuse sees stale or mixed bytes, never undefined behaviour; bucket
//! versions tell it to discard such reads.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::try_alloc_slice;

/// Custom key equality, receiving the stored key and the probe key.
pub type KeyCmpFn = dyn Fn(&[u8], &[u8]) -> bool + Send + Sync;

const WORD: usize = std::mem::size_of::<u64>();

/// Keys up to this length are materialized on the stack for custom comparisons.
const INLINE_KEY_LEN: usize = 64;

// Slot state word: low two bits are the state, the rest is a generation counter
// bumped every time the slot becomes free.
const STATE_MASK: u32 = 0b11;
const STATE_FREE: u32 = 0;
const STATE_LIVE: u32 = 1;
const STATE_RETIRED: u32 = 2;
const GENERATION_ONE: u32 = 1 << 2;

pub(crate) struct KeyStore {
    key_len: usize,
    words_per_key: usize,
    capacity: u32,
    keys: Box<[AtomicU64]>,
    data: Box<[AtomicUsize]>,
    states: Box<[AtomicU32]>,
    /// Lowest index never handed out
    high_water: AtomicU32,
    free: Mutex<Vec<u32>>,
}

impl KeyStore {
    pub(crate) fn new(capacity: u32, key_len: usize) -> Result<Self> {
        let words_per_key = key_len.div_ceil(WORD);
        let slots = capacity as usize + 1;
        let keys = try_alloc_slice(slots * words_per_key, || AtomicU64::new(0))?;
        let data = try_alloc_slice(slots, || AtomicUsize::new(0))?;
        let states = try_alloc_slice(slots, || AtomicU32::new(STATE_FREE))?;

        let mut free = Vec::new();
        free.try_reserve_exact(capacity as usize)
            .map_err(|_| Error::NoMemory(capacity as usize * std::mem::size_of::<u32>()))?;

        Ok(Self {
            key_len,
            words_per_key,
            capacity,
            keys,
            data,
            states,
            high_water: AtomicU32::new(1),
            free: Mutex::new(free),
        })
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take an index from the free list, or from the never-used range.
    pub(crate) fn alloc(&self) -> Option<u32> {
        if let Some(idx) = self.free.lock().pop() {
            return Some(idx);
        }
        self.high_water
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| {
                (h <= self.capacity).then_some(h + 1)
            })
            .ok()
    }

    /// Copy `key` and `data` into an allocated index and mark it live.
    pub(crate) fn store(&self, idx: u32, key: &[u8], data: usize) {
        debug_assert_eq!(key.len(), self.key_len);
        // Orders the earlier free-state store before the new bytes for generation checks.
        fence(Ordering::Release);
        for (w, chunk) in self.key_words(idx).iter().zip(key.chunks(WORD)) {
            let mut buf = [0u8; WORD];
            buf[..chunk.len()].copy_from_slice(chunk);
            w.store(u64::from_le_bytes(buf), Ordering::Relaxed);
        }
        self.data[idx as usize].store(data, Ordering::Relaxed);
        let state = &self.states[idx as usize];
        let gen = state.load(Ordering::Relaxed) & !STATE_MASK;
        state.store(gen | STATE_LIVE, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn data(&self, idx: u32) -> usize {
        self.data[idx as usize].load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn set_data(&self, idx: u32, data: usize) {
        self.data[idx as usize].store(data, Ordering::Release);
    }

    /// Compare the stored key at `idx` with `key`.
    #[inline(always)]
    pub(crate) fn matches(&self, idx: u32, key: &[u8], cmp: Option<&KeyCmpFn>) -> bool {
        match cmp {
            Some(cmp) => self.with_key(idx, |stored| cmp(stored, key)),
            None => self
                .key_words(idx)
                .iter()
                .zip(key.chunks(WORD))
                .all(|(w, chunk)| w.load(Ordering::Relaxed).to_le_bytes()[..chunk.len()] == *chunk),
        }
    }

    /// Run `f` over a copy of the stored key bytes.
    fn with_key<R>(&self, idx: u32, f: impl FnOnce(&[u8]) -> R) -> R {
        if self.key_len <= INLINE_KEY_LEN {
            let mut buf = [0u8; INLINE_KEY_LEN];
            self.copy_key_into(idx, &mut buf[..self.key_len]);
            f(&buf[..self.key_len])
        } else {
            f(&self.copy_key(idx))
        }
    }

    pub(crate) fn copy_key(&self, idx: u32) -> Vec<u8> {
        let mut out = vec![0u8; self.key_len];
        self.copy_key_into(idx, &mut out);
        out
    }

    fn copy_key_into(&self, idx: u32, out: &mut [u8]) {
        for (w, chunk) in self.key_words(idx).iter().zip(out.chunks_mut(WORD)) {
            let bytes = w.load(Ordering::Relaxed).to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Key bytes at `idx` if it is live and stayed live while being copied.
    pub(crate) fn read_live_key(&self, idx: u32) -> Option<Vec<u8>> {
        let state = &self.states[idx as usize];
        let before = state.load(Ordering::Acquire);
        if before & STATE_MASK != STATE_LIVE {
            return None;
        }
        let key = self.copy_key(idx);
        fence(Ordering::Acquire);
        (state.load(Ordering::Relaxed) == before).then_some(key)
    }

    /// Immediately recycle `idx`.
    pub(crate) fn release(&self, idx: u32) {
        let state = &self.states[idx as usize];
        let gen = state.load(Ordering::Relaxed) & !STATE_MASK;
        state.store(gen.wrapping_add(GENERATION_ONE) | STATE_FREE, Ordering::Release);
        self.free.lock().push(idx);
    }

    /// Mark `idx` logically dead; it stays out of the free list until reclaimed.
    pub(crate) fn retire(&self, idx: u32) {
        let state = &self.states[idx as usize];
        let gen = state.load(Ordering::Relaxed) & !STATE_MASK;
        state.store(gen | STATE_RETIRED, Ordering::Release);
    }

    /// Return a retired index to the free list.
    pub(crate) fn reclaim(&self, idx: u32) -> Result<()> {
        self.states[idx as usize]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s & STATE_MASK == STATE_RETIRED)
                    .then(|| (s & !STATE_MASK).wrapping_add(GENERATION_ONE) | STATE_FREE)
            })
            .map_err(|_| Error::InvalidArgument("position is not awaiting reclamation"))?;
        self.free.lock().push(idx);
        Ok(())
    }

    /// Forget every key. Readers must be quiesced by the caller.
    pub(crate) fn reset(&self) {
        let mut free = self.free.lock();
        free.clear();
        for state in self.states.iter() {
            let s = state.load(Ordering::Relaxed);
            if s & STATE_MASK != STATE_FREE {
                state.store((s & !STATE_MASK).wrapping_add(GENERATION_ONE), Ordering::Release);
            }
        }
        self.high_water.store(1, Ordering::Relaxed);
    }

    #[inline(always)]
    fn key_words(&self, idx: u32) -> &[AtomicU64] {
        let start = idx as usize * self.words_per_key;
        &self.keys[start..start + self.words_per_key]
    }
}
