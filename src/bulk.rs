//! Batched lookups.
//!
//! A batch is processed in phases so that the memory accesses of different keys overlap:
//! every signature first, then a snapshot and signature mask of every candidate bucket
//! pair, then the full-key comparisons. Keys whose bucket snapshots no longer validate,
//! or that miss while entries were being relocated, fall back to the single-key path.

use crate::bucket::Snapshot;
use crate::error::{Error, Result};
use crate::signature::SignatureHash;
use crate::CuckooMap;

/// Maximum number of keys in one batch; hit masks are one `u64` wide.
pub const LOOKUP_BULK_MAX: usize = 64;

impl<H: SignatureHash> CuckooMap<H> {
    /// Look up to [`LOOKUP_BULK_MAX`] keys at once.
    ///
    /// `positions[i]` receives the position of `keys[i]`, or `None` on a miss. Returns
    /// the hit mask: bit `i` set when `keys[i]` was found.
    pub fn lookup_bulk(&self, keys: &[&[u8]], positions: &mut [Option<u32>]) -> Result<u64> {
        check_output(keys.len(), positions.len())?;
        self.bulk_inner(keys, None, |i, hit| positions[i] = hit.map(|(pos, _)| pos))
    }

    /// [`lookup_bulk`](Self::lookup_bulk) with precomputed signatures.
    pub fn lookup_with_hash_bulk(
        &self,
        keys: &[&[u8]],
        sigs: &[u32],
        positions: &mut [Option<u32>],
    ) -> Result<u64> {
        check_output(keys.len(), positions.len())?;
        self.bulk_inner(keys, Some(sigs), |i, hit| positions[i] = hit.map(|(pos, _)| pos))
    }

    /// Look up to [`LOOKUP_BULK_MAX`] keys and collect their data.
    ///
    /// `data[i]` is written only for hits; the returned mask tells which entries are valid.
    pub fn lookup_bulk_data(&self, keys: &[&[u8]], data: &mut [usize]) -> Result<u64> {
        check_output(keys.len(), data.len())?;
        self.bulk_inner(keys, None, |i, hit| {
            if let Some((_, d)) = hit {
                data[i] = d;
            }
        })
    }

    /// [`lookup_bulk_data`](Self::lookup_bulk_data) with precomputed signatures.
    pub fn lookup_with_hash_bulk_data(
        &self,
        keys: &[&[u8]],
        sigs: &[u32],
        data: &mut [usize],
    ) -> Result<u64> {
        check_output(keys.len(), data.len())?;
        self.bulk_inner(keys, Some(sigs), |i, hit| {
            if let Some((_, d)) = hit {
                data[i] = d;
            }
        })
    }

    fn bulk_inner(
        &self,
        keys: &[&[u8]],
        sigs: Option<&[u32]>,
        mut emit: impl FnMut(usize, Option<(u32, usize)>),
    ) -> Result<u64> {
        let n = keys.len();
        if let Some(sigs) = sigs {
            if sigs.len() < n {
                return Err(Error::InvalidArgument("fewer signatures than keys"));
            }
        }
        keys.iter().try_for_each(|k| self.check_key(k))?;

        let mut sig = [0u32; LOOKUP_BULK_MAX];
        let mut prim = [0u32; LOOKUP_BULK_MAX];
        let mut sec = [0u32; LOOKUP_BULK_MAX];
        for i in 0..n {
            sig[i] = match sigs {
                Some(sigs) => sigs[i],
                None => self.hash(keys[i]),
            };
            (prim[i], sec[i]) = self.indexer().pair(sig[i]);
        }

        let epoch = self.relocation_epoch();
        let versioned = self.versioned();
        let mut snaps: [Option<(Snapshot, Snapshot)>; LOOKUP_BULK_MAX] = [None; LOOKUP_BULK_MAX];
        let mut prim_hits = [0u32; LOOKUP_BULK_MAX];
        let mut sec_hits = [0u32; LOOKUP_BULK_MAX];
        for i in 0..n {
            let p = self.bucket(prim[i]).snapshot(versioned);
            let s = self.bucket(sec[i]).snapshot(versioned);
            if let (Some(p), Some(s)) = (p, s) {
                prim_hits[i] = p.match_sig(sig[i]);
                sec_hits[i] = s.match_sig(sig[i]);
                snaps[i] = Some((p, s));
            }
        }

        let mut found: [Option<(u32, usize)>; LOOKUP_BULK_MAX] = [None; LOOKUP_BULK_MAX];
        let mut missed = 0u64;
        for i in 0..n {
            // a bucket under write sends the key down the single-key path
            found[i] = match snaps[i].as_ref() {
                Some((p, s)) => {
                    let hit = self
                        .match_hits(p, prim_hits[i], keys[i])
                        .or_else(|| self.match_hits(s, sec_hits[i], keys[i]));
                    let stable = self.bucket(prim[i]).validate(p, versioned)
                        && self.bucket(sec[i]).validate(s, versioned);
                    match (hit, stable) {
                        (Some(hit), true) => Some(hit),
                        (None, true) => self.search_chain_bounded(sec[i], sig[i], keys[i]),
                        (_, false) => self.lookup_with_hash_data(keys[i], sig[i]).ok(),
                    }
                }
                None => self.lookup_with_hash_data(keys[i], sig[i]).ok(),
            };
            if found[i].is_none() {
                missed |= 1 << i;
            }
        }

        // Misses are only final if nothing moved between buckets during the batch.
        if missed != 0 && versioned && self.relocation_epoch() != epoch {
            for i in 0..n {
                if missed & (1 << i) != 0 {
                    found[i] = self.lookup_with_hash_data(keys[i], sig[i]).ok();
                }
            }
        }

        let mut hit_mask = 0u64;
        for (i, hit) in found.iter().take(n).enumerate() {
            if hit.is_some() {
                hit_mask |= 1 << i;
            }
            emit(i, *hit);
        }
        Ok(hit_mask)
    }
}

fn check_output(keys: usize, out: usize) -> Result<()> {
    if keys == 0 || keys > LOOKUP_BULK_MAX {
        return Err(Error::InvalidArgument("batch size must be between 1 and LOOKUP_BULK_MAX"));
    }
    if out < keys {
        return Err(Error::InvalidArgument("output slice shorter than key batch"));
    }
    Ok(())
}
