//! Key signatures and primary/alternate bucket derivation.

use ahash::RandomState;

/// Capability that turns key bytes into a 32-bit signature.
///
/// Implementations must be deterministic for a given `(key, init_val)` pair and should
/// spread entropy across all 32 bits: the low bits pick the primary bucket and the high
/// 16 bits pick the alternate one.
pub trait SignatureHash: Send + Sync {
    fn hash(&self, key: &[u8], init_val: u32) -> u32;
}

impl<F> SignatureHash for F
where
    F: Fn(&[u8], u32) -> u32 + Send + Sync,
{
    #[inline(always)]
    fn hash(&self, key: &[u8], init_val: u32) -> u32 {
        self(key, init_val)
    }
}

// Fixed ahash seeds; only the caller's init value varies between tables.
const SEED_1: u64 = 0x243f_6a88_85a3_08d3;
const SEED_2: u64 = 0x1319_8a2e_0370_7344;
const SEED_3: u64 = 0xa409_3822_299f_31d0;

/// Default signature function backed by `ahash`, folded to 32 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct AHashSignature;

impl SignatureHash for AHashSignature {
    #[inline(always)]
    fn hash(&self, key: &[u8], init_val: u32) -> u32 {
        let state = RandomState::with_seeds(init_val as u64, SEED_1, SEED_2, SEED_3);
        let h64 = state.hash_one(key);
        (h64 ^ (h64 >> 32)) as u32
    }
}

/// Maps signatures onto bucket indexes of a power-of-two table.
///
/// The alternate index is `primary ^ (sig >> 16)`, masked. Applying the same transform
/// to the alternate index yields the primary again, so an occupant can be relocated
/// from the stored signature alone.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketIndexer {
    mask: u32,
}

impl BucketIndexer {
    pub(crate) fn new(bucket_count: u32) -> Self {
        debug_assert!(bucket_count.is_power_of_two());
        Self {
            mask: bucket_count - 1,
        }
    }

    #[inline(always)]
    pub(crate) fn primary(&self, sig: u32) -> u32 {
        sig & self.mask
    }

    /// Partner of `bucket` for an occupant with signature `sig`.
    #[inline(always)]
    pub(crate) fn alternate(&self, bucket: u32, sig: u32) -> u32 {
        (bucket ^ short_sig(sig)) & self.mask
    }

    #[inline(always)]
    pub(crate) fn pair(&self, sig: u32) -> (u32, u32) {
        let prim = self.primary(sig);
        (prim, self.alternate(prim, sig))
    }
}

#[inline(always)]
fn short_sig(sig: u32) -> u32 {
    sig >> 16
}
