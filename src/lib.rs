//! CuckooMap: a fixed-capacity concurrent cuckoo hash table for data-plane lookups.
//!
//! Keys are fixed-length byte strings. Each stored key gets a stable integer position in
//! `[0, entries)` which callers use to index their own parallel arrays; an opaque `usize`
//! word of caller data can be attached to every key as well.
//!
//! Buckets hold eight slots. A key may live in its primary bucket, its alternate bucket
//! (derived from the signature without rehashing) or, with [`Flags::EXT_TABLE`], in an
//! extension chain hanging off the alternate bucket. Inserting into two full buckets runs
//! a bounded breadth-first cuckoo search that displaces occupants to their own alternates.
//!
//! ```
//! use cuckoomap_rs::{CuckooMap, Params};
//!
//! let table = CuckooMap::new(&Params::new("flows", 1024, 4)).unwrap();
//! let pos = table.add_key(&1u32.to_le_bytes()).unwrap();
//! assert_eq!(table.lookup(&1u32.to_le_bytes()), Ok(pos));
//! assert_eq!(table.del_key(&1u32.to_le_bytes()), Ok(pos));
//! assert_eq!(table.count(), 0);
//! ```

mod bucket;
mod bulk;
mod config;
mod error;
mod key_store;
mod signature;
mod sync;

use std::fmt;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::bucket::{Bucket, Slot, Snapshot, ENTRIES_PER_BUCKET};
use crate::key_store::KeyStore;
use crate::signature::BucketIndexer;
use crate::sync::{delay, WriterLock};

pub use crate::bulk::LOOKUP_BULK_MAX;
pub use crate::config::{Flags, Params, ENTRIES_MAX};
pub use crate::error::{Error, Result};
pub use crate::key_store::KeyCmpFn;
pub use crate::signature::{AHashSignature, SignatureHash};

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Maximum number of buckets visited by one breadth-first cuckoo search
const CUCKOO_QUEUE_LEN: usize = 1000;

/// Times a missing lookup is repeated because an entry was relocated under it
const MAX_LOOKUP_RETRIES: u32 = 16;

/// Failed bucket reads (write in progress or version changed) one read operation
/// tolerates before giving up on the writer
const MAX_READ_RETRIES: u32 = 256;

/// Parent marker of the root node in a cuckoo search path
const NO_PARENT: u32 = u32::MAX;

// ================================================================================================
// PUBLIC TYPES
// ================================================================================================

/// One occupied slot produced by [`CuckooMap::iterate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterEntry {
    pub key: Vec<u8>,
    pub data: usize,
    pub position: u32,
}

/// A bucket read ran out of retries while writers kept it busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Unstable;

pub(crate) type ReadResult<T> = std::result::Result<T, Unstable>;

/// Node of the breadth-first cuckoo search.
#[derive(Clone, Copy)]
struct PathNode {
    bucket: u32,
    parent: u32,
    parent_slot: u8,
}

// ================================================================================================
// MAIN STRUCTURE
// ================================================================================================

/// Fixed-capacity cuckoo hash table mapping keys to stable positions.
///
/// All operations take `&self`. Which of them may run concurrently is decided by the
/// [`Flags`] the table was created with:
///
/// * default: one writer at a time, readers serialized with it by the caller;
/// * [`Flags::MULTI_WRITER_ADD`]: writers serialize on an internal lock
///   (optionally elided with [`Flags::TRANS_MEM_SUPPORT`]);
/// * [`Flags::RW_CONCURRENCY`]: readers never block and re-validate every bucket they
///   read against its version counter, giving up on a bucket that stays under write;
/// * [`Flags::RW_CONCURRENCY_LF`]: as above, and deleted positions are only recycled by
///   [`CuckooMap::free_key_with_position`].
///
/// In both reader/writer modes more than one concurrent writer also needs
/// [`Flags::MULTI_WRITER_ADD`].
pub struct CuckooMap<H: SignatureHash = AHashSignature> {
    name: String,
    key_len: u32,
    init_val: u32,
    flags: Flags,
    versioned: bool,
    defer_free: bool,
    hasher: H,
    cmp: Option<Box<KeyCmpFn>>,
    indexer: BucketIndexer,
    main_buckets: u32,
    /// Main table followed by the extension pool
    buckets: Box<[Bucket]>,
    ext_free: Mutex<Vec<u32>>,
    /// Per key index: emptied extension bucket waiting for that key's reclaim
    ext_deferred: Box<[AtomicU32]>,
    keys: KeyStore,
    live: CachePadded<AtomicU32>,
    relocations: CachePadded<AtomicU32>,
    writer: WriterLock,
}

// ================================================================================================
// CONSTRUCTORS
// ================================================================================================

impl CuckooMap<AHashSignature> {
    /// Create a table hashing keys with [`AHashSignature`].
    pub fn new(params: &Params) -> Result<Self> {
        Self::with_hasher(params, AHashSignature)
    }
}

impl<H: SignatureHash> CuckooMap<H> {
    /// Create a table with a caller-supplied signature function.
    ///
    /// Fails with [`Error::InvalidArgument`] on bad parameters and [`Error::NoMemory`]
    /// when the backing storage cannot be reserved.
    pub fn with_hasher(params: &Params, hasher: H) -> Result<Self> {
        let flags = params.validate()?;
        Self::allocate(params, flags, hasher).map_err(|e| {
            log::error!("{}: failed to create hash table: {}", params.name, e);
            e
        })
    }

    fn allocate(params: &Params, flags: Flags, hasher: H) -> Result<Self> {
        let main_buckets = params.bucket_count();
        let ext_buckets = if flags.contains(Flags::EXT_TABLE) {
            main_buckets
        } else {
            0
        };
        let total = main_buckets as usize + ext_buckets as usize;
        let buckets = try_alloc_slice(total, Bucket::default)?;

        let mut ext_free = Vec::new();
        ext_free
            .try_reserve_exact(ext_buckets as usize)
            .map_err(|_| Error::NoMemory(ext_buckets as usize * std::mem::size_of::<u32>()))?;
        ext_free.extend((main_buckets..main_buckets + ext_buckets).rev());

        let ext_deferred = if ext_buckets > 0 && flags.defers_free() {
            try_alloc_slice(params.entries as usize + 1, || AtomicU32::new(0))?
        } else {
            Box::default()
        };

        let keys = KeyStore::new(params.entries, params.key_len as usize)?;

        log::debug!(
            "{}: created hash table: entries={}, key_len={}, buckets={}, ext_buckets={}, flags={:?}",
            params.name,
            params.entries,
            params.key_len,
            main_buckets,
            ext_buckets,
            flags
        );

        Ok(Self {
            name: params.name.clone(),
            key_len: params.key_len,
            init_val: params.hash_init_val,
            flags,
            versioned: flags.readers_concurrent(),
            defer_free: flags.defers_free(),
            hasher,
            cmp: None,
            indexer: BucketIndexer::new(main_buckets),
            main_buckets,
            buckets,
            ext_free: Mutex::new(ext_free),
            ext_deferred,
            keys,
            live: CachePadded::new(AtomicU32::new(0)),
            relocations: CachePadded::new(AtomicU32::new(0)),
            writer: WriterLock::new(
                flags.contains(Flags::MULTI_WRITER_ADD),
                flags.contains(Flags::TRANS_MEM_SUPPORT),
            ),
        })
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of keys the table was sized for.
    pub fn entries(&self) -> u32 {
        self.keys.capacity()
    }

    /// Length in bytes of every key.
    pub fn key_len(&self) -> u32 {
        self.key_len
    }

    /// Effective flags, including implied ones.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Number of live keys.
    pub fn count(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    /// Exclusive upper bound of every position this table can return.
    pub fn max_key_id(&self) -> u32 {
        self.keys.capacity()
    }

    /// Signature of `key` under this table's hash function and seed.
    #[inline]
    pub fn hash(&self, key: &[u8]) -> u32 {
        self.hasher.hash(key, self.init_val)
    }

    /// Replace the key equality function.
    ///
    /// Taking `&mut self` guarantees no lookup is in flight while the function changes.
    pub fn set_cmp_func<F>(&mut self, cmp: F)
    where
        F: Fn(&[u8], &[u8]) -> bool + Send + Sync + 'static,
    {
        self.cmp = Some(Box::new(cmp));
    }

    /// Insert `key` and return its position.
    ///
    /// Adding a key that is already present returns the existing position and leaves
    /// its data untouched.
    pub fn add_key(&self, key: &[u8]) -> Result<u32> {
        self.add_inner(key, self.hash(key), None)
    }

    /// [`add_key`](Self::add_key) with a precomputed signature.
    pub fn add_key_with_hash(&self, key: &[u8], sig: u32) -> Result<u32> {
        self.add_inner(key, sig, None)
    }

    /// Insert `key` with `data`, or replace the data of an existing key.
    ///
    /// Concurrent readers may keep observing the previous data word for a while; its
    /// lifetime is the caller's business.
    pub fn add_key_data(&self, key: &[u8], data: usize) -> Result<u32> {
        self.add_inner(key, self.hash(key), Some(data))
    }

    /// [`add_key_data`](Self::add_key_data) with a precomputed signature.
    pub fn add_key_with_hash_data(&self, key: &[u8], sig: u32, data: usize) -> Result<u32> {
        self.add_inner(key, sig, Some(data))
    }

    /// Remove `key` and return the position it occupied.
    ///
    /// With [`Flags::NO_FREE_ON_DEL`] or [`Flags::RW_CONCURRENCY_LF`] the position is
    /// only retired: it will not be handed out again until
    /// [`free_key_with_position`](Self::free_key_with_position) is called for it, which
    /// the caller must do only once no reader can still be using it.
    pub fn del_key(&self, key: &[u8]) -> Result<u32> {
        self.del_inner(key, self.hash(key))
    }

    /// [`del_key`](Self::del_key) with a precomputed signature.
    pub fn del_key_with_hash(&self, key: &[u8], sig: u32) -> Result<u32> {
        self.del_inner(key, sig)
    }

    /// Complete the deferred removal of a retired position.
    ///
    /// Fails with [`Error::InvalidArgument`] if `position` is out of range or is not
    /// waiting for reclamation (never deleted, already freed, or deleted in a mode that
    /// frees immediately).
    pub fn free_key_with_position(&self, position: u32) -> Result<()> {
        if position >= self.entries() {
            return Err(Error::InvalidArgument("position out of range"));
        }
        let _guard = self.writer.acquire();
        let key_idx = position + 1;
        self.keys.reclaim(key_idx)?;

        if let Some(deferred) = self.ext_deferred.get(key_idx as usize) {
            let ext = deferred.swap(0, Ordering::Relaxed);
            if ext != 0 {
                self.ext_free.lock().push(ext);
                log::trace!("{}: recycled deferred extension bucket {}", self.name, ext);
            }
        }
        Ok(())
    }

    /// Copy of the key stored at `position`.
    pub fn get_key_with_position(&self, position: u32) -> Result<Vec<u8>> {
        if position >= self.entries() {
            return Err(Error::InvalidArgument("position out of range"));
        }
        self.keys.read_live_key(position + 1).ok_or(Error::NotFound)
    }

    /// Position of `key`.
    pub fn lookup(&self, key: &[u8]) -> Result<u32> {
        self.check_key(key)?;
        self.lookup_inner(key, self.hash(key)).map(|(pos, _)| pos)
    }

    /// [`lookup`](Self::lookup) with a precomputed signature.
    pub fn lookup_with_hash(&self, key: &[u8], sig: u32) -> Result<u32> {
        self.check_key(key)?;
        self.lookup_inner(key, sig).map(|(pos, _)| pos)
    }

    /// Position and data of `key`.
    pub fn lookup_data(&self, key: &[u8]) -> Result<(u32, usize)> {
        self.check_key(key)?;
        self.lookup_inner(key, self.hash(key))
    }

    /// [`lookup_data`](Self::lookup_data) with a precomputed signature.
    pub fn lookup_with_hash_data(&self, key: &[u8], sig: u32) -> Result<(u32, usize)> {
        self.check_key(key)?;
        self.lookup_inner(key, sig)
    }

    /// Advance `cursor` to the next occupied slot and return it.
    ///
    /// Start with a cursor of 0; `None` marks the end of the table. The cursor is the
    /// only iteration state, so independent iterations can run side by side. There is
    /// no snapshot isolation: entries inserted, deleted or relocated during the walk
    /// may be missed or seen twice.
    pub fn iterate(&self, cursor: &mut u32) -> Option<IterEntry> {
        let total = self.buckets.len() * ENTRIES_PER_BUCKET;
        while (*cursor as usize) < total {
            let at = *cursor as usize;
            *cursor += 1;
            if let Some(entry) = self.read_slot(at / ENTRIES_PER_BUCKET, at % ENTRIES_PER_BUCKET) {
                return Some(entry);
            }
        }
        None
    }

    /// Iterator over all entries, driven by [`iterate`](Self::iterate).
    pub fn iter(&self) -> Iter<'_, H> {
        Iter {
            map: self,
            cursor: 0,
        }
    }

    /// Remove every key.
    ///
    /// Under the reader/writer modes the caller must make sure no reader is using the
    /// table while it is reset.
    pub fn reset(&self) {
        let _guard = self.writer.acquire();
        for bucket in self.buckets.iter() {
            bucket.clear(self.versioned);
        }

        let total = self.buckets.len() as u32;
        let mut ext_free = self.ext_free.lock();
        ext_free.clear();
        ext_free.extend((self.main_buckets..total).rev());
        for deferred in self.ext_deferred.iter() {
            deferred.store(0, Ordering::Relaxed);
        }

        self.keys.reset();
        self.live.store(0, Ordering::Relaxed);
        self.note_relocation();
        log::debug!("{}: reset", self.name);
    }

    // ============================================================================================
    // INSERT / DELETE
    // ============================================================================================

    fn add_inner(&self, key: &[u8], sig: u32, data: Option<usize>) -> Result<u32> {
        self.check_key(key)?;
        let _guard = self.writer.acquire();
        let (prim, sec) = self.indexer.pair(sig);

        let existing = self
            .find_in_bucket(prim, sig, key)
            .or_else(|| self.find_in_bucket(sec, sig, key))
            .or_else(|| self.chain(sec).find_map(|n| self.find_in_bucket(n, sig, key)));
        if let Some((_, key_idx)) = existing {
            if let Some(data) = data {
                self.keys.set_data(key_idx, data);
            }
            return Ok(key_idx - 1);
        }

        let key_idx = self.keys.alloc().ok_or(Error::NoSpace)?;
        self.keys.store(key_idx, key, data.unwrap_or(0));
        let slot = Slot::new(sig, key_idx);

        let placed = self.place_in(prim, slot)
            || self.place_in(sec, slot)
            || self.make_space(prim, slot)
            || (sec != prim && self.make_space(sec, slot))
            || self.place_in_chain(sec, slot);
        if !placed {
            self.keys.release(key_idx);
            log::debug!(
                "{}: no space for key with signature {:#010x} after cuckoo search",
                self.name,
                sig
            );
            return Err(Error::NoSpace);
        }

        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(key_idx - 1)
    }

    fn del_inner(&self, key: &[u8], sig: u32) -> Result<u32> {
        self.check_key(key)?;
        let _guard = self.writer.acquire();
        let (prim, sec) = self.indexer.pair(sig);

        for head in [prim, sec] {
            if let Some((slot, key_idx)) = self.find_in_bucket(head, sig, key) {
                return Ok(self.remove_at(head, head, slot, key_idx));
            }
        }
        let in_chain = self
            .chain(sec)
            .find_map(|n| self.find_in_bucket(n, sig, key).map(|(slot, key_idx)| (n, slot, key_idx)));
        match in_chain {
            Some((at, slot, key_idx)) => Ok(self.remove_at(sec, at, slot, key_idx)),
            None => Err(Error::NotFound),
        }
    }

    /// Clear the slot, keep the chain of `head` dense and release the key index.
    fn remove_at(&self, head: u32, at: u32, slot: usize, key_idx: u32) -> u32 {
        self.write_slot(at, slot, Slot::EMPTY);
        self.compact_chain(at, slot);
        self.recycle_tail(head, key_idx);
        self.live.fetch_sub(1, Ordering::Relaxed);
        if self.defer_free {
            self.keys.retire(key_idx);
        } else {
            self.keys.release(key_idx);
        }
        key_idx - 1
    }

    /// Writer-side probe: slot index and key index of `key` in bucket `idx`.
    fn find_in_bucket(&self, idx: u32, sig: u32, key: &[u8]) -> Option<(usize, u32)> {
        let bucket = self.bucket(idx);
        (0..ENTRIES_PER_BUCKET).find_map(|i| {
            let s = bucket.slot(i);
            (!s.is_empty() && s.sig() == sig && self.keys.matches(s.key_idx(), key, self.cmp()))
                .then_some((i, s.key_idx()))
        })
    }

    fn place_in(&self, idx: u32, slot: Slot) -> bool {
        match self.bucket(idx).find_empty() {
            Some(free) => {
                self.write_slot(idx, free, slot);
                true
            }
            None => false,
        }
    }

    // ============================================================================================
    // CUCKOO DISPLACEMENT
    // ============================================================================================

    /// Breadth-first search from `root` for a bucket with a free slot, then shift the
    /// occupants along the found path so that `slot` fits into `root`.
    fn make_space(&self, root: u32, slot: Slot) -> bool {
        let mut queue = Vec::with_capacity(CUCKOO_QUEUE_LEN);
        queue.push(PathNode {
            bucket: root,
            parent: NO_PARENT,
            parent_slot: 0,
        });

        let mut head = 0;
        while head < queue.len() {
            let node = queue[head];
            let bucket = self.bucket(node.bucket);
            if head != 0 {
                if let Some(free) = bucket.find_empty() {
                    self.shift_path(&queue, head, free, slot);
                    return true;
                }
            }
            for i in 0..ENTRIES_PER_BUCKET {
                if queue.len() >= CUCKOO_QUEUE_LEN {
                    break;
                }
                let occupant = bucket.slot(i);
                if occupant.is_empty() {
                    continue;
                }
                let alt = self.indexer.alternate(node.bucket, occupant.sig());
                if on_path(&queue, head, alt) {
                    continue;
                }
                queue.push(PathNode {
                    bucket: alt,
                    parent: head as u32,
                    parent_slot: i as u8,
                });
            }
            head += 1;
        }
        false
    }

    /// Walk the path from its free end back to the root, moving each occupant into the
    /// slot freed by the previous move. Every move writes the destination before clearing
    /// the source, so a reader can see an entry twice but never lose it.
    fn shift_path(&self, path: &[PathNode], mut at: usize, mut free: usize, slot: Slot) {
        loop {
            let node = path[at];
            if node.parent == NO_PARENT {
                self.write_slot(node.bucket, free, slot);
                return;
            }
            let parent = path[node.parent as usize];
            let from = node.parent_slot as usize;
            let moving = self.bucket(parent.bucket).slot(from);
            self.write_slot(node.bucket, free, moving);
            self.note_relocation();
            self.write_slot(parent.bucket, from, Slot::EMPTY);
            free = from;
            at = node.parent as usize;
        }
    }

    // ============================================================================================
    // EXTENSION CHAINS
    // ============================================================================================

    /// Extension buckets linked after `head`, in chain order.
    fn chain(&self, head: u32) -> impl Iterator<Item = u32> + '_ {
        std::iter::successors(self.bucket(head).next(), move |&n| self.bucket(n).next())
            .take(self.buckets.len())
    }

    fn place_in_chain(&self, head: u32, slot: Slot) -> bool {
        if !self.flags.contains(Flags::EXT_TABLE) {
            return false;
        }
        let mut last = head;
        for n in self.chain(head) {
            if self.place_in(n, slot) {
                return true;
            }
            last = n;
        }

        let Some(ext) = self.ext_free.lock().pop() else {
            return false;
        };
        self.write_slot(ext, 0, slot);
        self.bucket(last)
            .write(self.versioned, |b| b.set_next(Some(ext)));
        log::trace!("{}: linked extension bucket {} after bucket {}", self.name, ext, last);
        true
    }

    /// Fill the hole at `at[free]` with the last entry of the chain that follows `at`.
    fn compact_chain(&self, at: u32, free: usize) {
        let Some(last) = self.chain(at).last() else {
            return;
        };
        let tail = self.bucket(last);
        let Some(i) = tail.first_occupied() else {
            return;
        };
        self.write_slot(at, free, tail.slot(i));
        self.note_relocation();
        self.write_slot(last, i, Slot::EMPTY);
    }

    /// Unlink the tail of `head`'s chain if it became empty. It returns to the pool now,
    /// or when `key_idx` is reclaimed if deletes defer freeing.
    fn recycle_tail(&self, head: u32, key_idx: u32) {
        let mut prev = head;
        let mut last = None;
        for n in self.chain(head) {
            if let Some(l) = last {
                prev = l;
            }
            last = Some(n);
        }
        let Some(last) = last else {
            return;
        };
        if !self.bucket(last).is_empty() {
            return;
        }

        self.bucket(prev).write(self.versioned, |b| b.set_next(None));
        if self.defer_free {
            self.ext_deferred[key_idx as usize].store(last, Ordering::Relaxed);
            log::trace!(
                "{}: unlinked extension bucket {}, recycled once position {} is freed",
                self.name,
                last,
                key_idx - 1
            );
        } else {
            self.ext_free.lock().push(last);
            log::trace!("{}: unlinked and recycled extension bucket {}", self.name, last);
        }
    }

    // ============================================================================================
    // READ PATH
    // ============================================================================================

    /// Search primary, alternate and extension buckets for `key`.
    ///
    /// A miss is repeated while the relocation counter shows that entries moved during
    /// the search, up to `MAX_LOOKUP_RETRIES` times. Bucket reads that keep colliding
    /// with writers share a budget of `MAX_READ_RETRIES`; when it runs out the lookup
    /// reports `NotFound` instead of waiting for the writer.
    fn lookup_inner(&self, key: &[u8], sig: u32) -> Result<(u32, usize)> {
        let (prim, sec) = self.indexer.pair(sig);
        let mut budget = MAX_READ_RETRIES;
        let mut retries = 0;
        loop {
            let epoch = self.relocations.load(Ordering::Acquire);
            match self.search_candidates(prim, sec, sig, key, &mut budget) {
                Ok(Some(hit)) => return Ok(hit),
                Ok(None) => {}
                Err(Unstable) => {
                    log::trace!("{}: lookup gave up on buckets under write", self.name);
                    return Err(Error::NotFound);
                }
            }
            if !self.versioned || retries >= MAX_LOOKUP_RETRIES {
                return Err(Error::NotFound);
            }
            fence(Ordering::Acquire);
            if self.relocations.load(Ordering::Relaxed) == epoch {
                return Err(Error::NotFound);
            }
            retries += 1;
        }
    }

    fn search_candidates(
        &self,
        prim: u32,
        sec: u32,
        sig: u32,
        key: &[u8],
        budget: &mut u32,
    ) -> ReadResult<Option<(u32, usize)>> {
        if let Some(hit) = self.search_bucket(prim, sig, key, budget)? {
            return Ok(Some(hit));
        }
        if let Some(hit) = self.search_bucket(sec, sig, key, budget)? {
            return Ok(Some(hit));
        }
        self.search_chain(sec, sig, key, budget)
    }

    /// Reader-side search of one bucket, retried while its version is unstable and
    /// `budget` lasts.
    fn search_bucket(
        &self,
        idx: u32,
        sig: u32,
        key: &[u8],
        budget: &mut u32,
    ) -> ReadResult<Option<(u32, usize)>> {
        let bucket = self.bucket(idx);
        let mut spins = 0;
        loop {
            if let Some(snap) = bucket.snapshot(self.versioned) {
                let hit = self.match_in_snapshot(&snap, sig, key);
                if bucket.validate(&snap, self.versioned) {
                    return Ok(hit);
                }
            }
            spend_retry(budget, &mut spins)?;
        }
    }

    fn search_chain(
        &self,
        head: u32,
        sig: u32,
        key: &[u8],
        budget: &mut u32,
    ) -> ReadResult<Option<(u32, usize)>> {
        for n in self.chain(head) {
            if let Some(hit) = self.search_bucket(n, sig, key, budget)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Full-key check of every signature hit in `snap`. Result is only trustworthy once
    /// the snapshot validates.
    #[inline(always)]
    pub(crate) fn match_in_snapshot(&self, snap: &Snapshot, sig: u32, key: &[u8]) -> Option<(u32, usize)> {
        self.match_hits(snap, snap.match_sig(sig), key)
    }

    #[inline(always)]
    pub(crate) fn match_hits(&self, snap: &Snapshot, mut hits: u32, key: &[u8]) -> Option<(u32, usize)> {
        while hits != 0 {
            let slot = snap.slot(hits.trailing_zeros() as usize);
            let key_idx = slot.key_idx();
            if self.keys.matches(key_idx, key, self.cmp()) {
                return Some((key_idx - 1, self.keys.data(key_idx)));
            }
            hits &= hits - 1;
        }
        None
    }

    /// Copy of one slot, or `None` when it is empty or stayed under write for the whole
    /// retry budget.
    fn read_slot(&self, bucket_idx: usize, slot: usize) -> Option<IterEntry> {
        let bucket = &self.buckets[bucket_idx];
        let mut budget = MAX_READ_RETRIES;
        let mut spins = 0;
        loop {
            if let Some(snap) = bucket.snapshot(self.versioned) {
                let s = snap.slot(slot);
                let entry = (!s.is_empty()).then(|| IterEntry {
                    key: self.keys.copy_key(s.key_idx()),
                    data: self.keys.data(s.key_idx()),
                    position: s.key_idx() - 1,
                });
                if bucket.validate(&snap, self.versioned) {
                    return entry;
                }
            }
            if spend_retry(&mut budget, &mut spins).is_err() {
                log::trace!("{}: iteration skipped slot {} of bucket {}", self.name, slot, bucket_idx);
                return None;
            }
        }
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    #[inline(always)]
    pub(crate) fn bucket(&self, idx: u32) -> &Bucket {
        &self.buckets[idx as usize]
    }

    #[inline(always)]
    pub(crate) fn indexer(&self) -> &BucketIndexer {
        &self.indexer
    }

    #[inline(always)]
    pub(crate) fn versioned(&self) -> bool {
        self.versioned
    }

    /// Chain search with a fresh read budget; an exhausted budget counts as a miss.
    pub(crate) fn search_chain_bounded(&self, head: u32, sig: u32, key: &[u8]) -> Option<(u32, usize)> {
        let mut budget = MAX_READ_RETRIES;
        self.search_chain(head, sig, key, &mut budget).ok().flatten()
    }

    #[inline(always)]
    pub(crate) fn relocation_epoch(&self) -> u32 {
        self.relocations.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn cmp(&self) -> Option<&KeyCmpFn> {
        self.cmp.as_deref()
    }

    #[inline(always)]
    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_len as usize {
            return Err(Error::InvalidArgument("key length does not match table key_len"));
        }
        Ok(())
    }

    #[inline(always)]
    fn write_slot(&self, idx: u32, slot: usize, value: Slot) {
        self.bucket(idx)
            .write(self.versioned, |b| b.store_slot(slot, value));
    }

    /// Tell readers that an entry changed buckets.
    #[inline(always)]
    fn note_relocation(&self) {
        if self.versioned {
            self.relocations.fetch_add(1, Ordering::Release);
        }
    }
}

impl<H: SignatureHash> fmt::Debug for CuckooMap<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CuckooMap")
            .field("name", &self.name)
            .field("entries", &self.entries())
            .field("key_len", &self.key_len)
            .field("buckets", &self.main_buckets)
            .field("flags", &self.flags)
            .field("count", &self.count())
            .finish()
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

/// Take one retry from `budget`, backing off first.
#[inline]
fn spend_retry(budget: &mut u32, spins: &mut i32) -> ReadResult<()> {
    if *budget == 0 {
        return Err(Unstable);
    }
    *budget -= 1;
    delay(spins);
    Ok(())
}

/// Whether `bucket` already appears on the path from `path[at]` back to the root.
/// A path that revisits a bucket would move the same slot twice.
fn on_path(path: &[PathNode], mut at: usize, bucket: u32) -> bool {
    loop {
        let node = path[at];
        if node.bucket == bucket {
            return true;
        }
        if node.parent == NO_PARENT {
            return false;
        }
        at = node.parent as usize;
    }
}

/// Allocate `len` elements, reporting allocation failure instead of aborting.
pub(crate) fn try_alloc_slice<T>(len: usize, init: impl FnMut() -> T) -> Result<Box<[T]>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| Error::NoMemory(len.saturating_mul(std::mem::size_of::<T>())))?;
    v.resize_with(len, init);
    Ok(v.into_boxed_slice())
}

// ================================================================================================
// ITERATOR IMPLEMENTATIONS
// ================================================================================================

/// Iterator over the entries of a [`CuckooMap`], in bucket order.
pub struct Iter<'a, H: SignatureHash = AHashSignature> {
    map: &'a CuckooMap<H>,
    cursor: u32,
}

impl<H: SignatureHash> Iterator for Iter<'_, H> {
    type Item = IterEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.map.iterate(&mut self.cursor)
    }
}

impl<'a, H: SignatureHash> IntoIterator for &'a CuckooMap<H> {
    type Item = IterEntry;
    type IntoIter = Iter<'a, H>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
