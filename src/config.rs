//! Creation parameters and the concurrency flag set.

use bitflags::bitflags;

use crate::bucket::ENTRIES_PER_BUCKET;
use crate::error::{Error, Result};

/// Maximum number of entries a table can be created with.
pub const ENTRIES_MAX: u32 = 1 << 30;

bitflags! {
    /// Extra behaviour selected at creation time.
    ///
    /// Bit values match the flag word of the C data-plane hash API so a raw flag byte
    /// can be converted with [`Flags::from_bits`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        /// Elide the writer lock with an optimistic fast path (needs `MULTI_WRITER_ADD`).
        const TRANS_MEM_SUPPORT = 0x01;

        /// Writers may call insert/delete concurrently; they serialize on an internal lock.
        const MULTI_WRITER_ADD = 0x02;

        /// Readers run concurrently with writers, validated by per-bucket versions.
        const RW_CONCURRENCY = 0x04;

        /// Overflow into linked extension buckets when the cuckoo search fails.
        const EXT_TABLE = 0x08;

        /// Deleting a key does not recycle its position; see `free_key_with_position`.
        const NO_FREE_ON_DEL = 0x10;

        /// Lock-free reader/writer concurrency. Implies `NO_FREE_ON_DEL`.
        /// Concurrent writers additionally need `MULTI_WRITER_ADD`.
        const RW_CONCURRENCY_LF = 0x20;
    }
}

impl Flags {
    /// Whether readers must validate against concurrent writers.
    #[inline]
    pub fn readers_concurrent(self) -> bool {
        self.intersects(Flags::RW_CONCURRENCY | Flags::RW_CONCURRENCY_LF)
    }

    /// Whether deletion defers position reuse to an explicit reclaim call.
    #[inline]
    pub fn defers_free(self) -> bool {
        self.intersects(Flags::NO_FREE_ON_DEL | Flags::RW_CONCURRENCY_LF)
    }
}

/// Parameters used to create a [`CuckooMap`](crate::CuckooMap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// Name used in log messages.
    pub name: String,
    /// Number of keys the table must be able to hold.
    pub entries: u32,
    /// Fixed length of every key, in bytes.
    pub key_len: u32,
    /// Seed passed to the hash function.
    pub hash_init_val: u32,
    /// Concurrency and overflow behaviour.
    pub flags: Flags,
}

impl Params {
    /// Parameters for a table of `entries` keys, each `key_len` bytes long.
    pub fn new(name: impl Into<String>, entries: u32, key_len: u32) -> Self {
        Self {
            name: name.into(),
            entries,
            key_len,
            hash_init_val: 0,
            flags: Flags::empty(),
        }
    }

    /// Seed passed to the signature hash.
    pub fn with_init_val(mut self, init_val: u32) -> Self {
        self.hash_init_val = init_val;
        self
    }

    /// Replace the behaviour flags.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Check the parameters and normalize implied flags.
    pub(crate) fn validate(&self) -> Result<Flags> {
        if self.entries > ENTRIES_MAX {
            return Err(Error::InvalidArgument("entries exceeds ENTRIES_MAX"));
        }
        if (self.entries as usize) < ENTRIES_PER_BUCKET {
            return Err(Error::InvalidArgument("entries smaller than one bucket"));
        }
        if self.key_len == 0 {
            return Err(Error::InvalidArgument("key_len must be non-zero"));
        }

        let mut flags = self.flags;
        if flags.contains(Flags::RW_CONCURRENCY_LF) {
            flags |= Flags::NO_FREE_ON_DEL;
        }
        Ok(flags)
    }

    /// Number of main-table buckets: `next_pow2(entries) / ENTRIES_PER_BUCKET`.
    pub(crate) fn bucket_count(&self) -> u32 {
        let slots = self.entries.max(ENTRIES_PER_BUCKET as u32).next_power_of_two();
        (slots / ENTRIES_PER_BUCKET as u32).max(1)
    }
}
