//! Error taxonomy shared by every table operation.

/// Errors returned by [`CuckooMap`](crate::CuckooMap) operations.
///
/// All variants are plain status values: none carries heap data, so they can be
/// stored in per-key output arrays and compared cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed input: wrong key length, oversized batch, bad position, bad parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The key or position is not present in the table.
    #[error("key not found")]
    NotFound,

    /// Capacity or the bounded cuckoo search is exhausted.
    ///
    /// This is an expected steady-state condition under a high load factor, not a
    /// fault. The caller decides whether to retry, evict, or grow externally.
    #[error("no space left in hash table")]
    NoSpace,

    /// Backing storage could not be allocated at creation.
    #[error("failed to allocate {0} bytes")]
    NoMemory(usize),
}

impl Error {
    /// Negative errno value matching the C data-plane convention.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -22,
            Error::NotFound => -2,
            Error::NoSpace => -28,
            Error::NoMemory(_) => -12,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
