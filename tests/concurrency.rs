use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use cuckoomap_rs::{CuckooMap, Error, Flags, Params, SignatureHash};

fn key(i: u32) -> [u8; 4] {
    i.to_le_bytes()
}

fn checksum(i: u32) -> usize {
    (i as usize).wrapping_mul(0x9e37_79b9) ^ 0x5bd1_e995
}

fn concurrent_writers(flags: Flags) {
    let m = Arc::new(CuckooMap::new(&Params::new("writers", 4096, 4).with_flags(flags)).unwrap());
    let n_threads = 4;
    let per_thread = 600u32;
    let barrier = Arc::new(Barrier::new(n_threads));

    let mut handles = Vec::new();
    for t in 0..n_threads as u32 {
        let b = barrier.clone();
        let map = m.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            let mut mine = Vec::new();
            for i in 0..per_thread {
                let k = t * per_thread + i;
                mine.push(map.add_key_data(&key(k), checksum(k)).unwrap());
                // churn a few keys so deletes interleave with other writers' inserts
                if i % 5 == 0 {
                    map.del_key(&key(k)).unwrap();
                    mine.pop();
                    mine.push(map.add_key_data(&key(k), checksum(k)).unwrap());
                }
            }
            mine
        }));
    }

    let mut all = HashSet::new();
    for h in handles {
        for p in h.join().unwrap() {
            assert!(all.insert(p), "position {} handed out twice", p);
        }
    }

    assert_eq!(m.count(), n_threads as u32 * per_thread);
    for k in 0..n_threads as u32 * per_thread {
        let (p, d) = m.lookup_data(&key(k)).unwrap();
        assert!(all.contains(&p));
        assert_eq!(d, checksum(k));
    }
}

#[test]
fn multi_writer_add() {
    concurrent_writers(Flags::MULTI_WRITER_ADD);
}

#[test]
fn multi_writer_add_with_lock_elision() {
    concurrent_writers(Flags::MULTI_WRITER_ADD | Flags::TRANS_MEM_SUPPORT | Flags::RW_CONCURRENCY);
}

/// One writer toggles `churn` keys in and out while readers check that every
/// `stable` key stays visible and that no lookup pairs a key with foreign data.
fn readers_against_one_writer<H: SignatureHash + 'static>(
    m: CuckooMap<H>,
    stable: u32,
    churn: u32,
    rounds: u32,
) {
    let m = Arc::new(m);
    for k in 0..stable {
        m.add_key_data(&key(k), checksum(k)).unwrap();
    }

    let n_readers = 3;
    let stop = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(n_readers + 1));

    let mut readers = Vec::new();
    for r in 0..n_readers as u32 {
        let map = m.clone();
        let stop = stop.clone();
        let b = barrier.clone();
        readers.push(thread::spawn(move || {
            b.wait();
            let mut i = r;
            let mut lookups = 0u64;
            loop {
                let k = i % stable;
                assert_eq!(
                    map.lookup_data(&key(k)).map(|(_, d)| d),
                    Ok(checksum(k)),
                    "stable key {} not visible",
                    k
                );

                let c = stable + i % churn;
                match map.lookup_data(&key(c)) {
                    Ok((_, d)) => assert_eq!(d, checksum(c)),
                    Err(e) => assert_eq!(e, Error::NotFound),
                }
                i = i.wrapping_add(7);
                lookups += 1;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            lookups
        }));
    }

    barrier.wait();
    for _ in 0..rounds {
        for c in stable..stable + churn {
            if m.del_key(&key(c)).is_err() {
                // NoSpace is an expected outcome at high load
                let _ = m.add_key_data(&key(c), checksum(c));
            }
        }
    }
    stop.store(true, Ordering::Relaxed);

    for h in readers {
        assert!(h.join().unwrap() > 0);
    }
    for k in 0..stable {
        assert_eq!(m.lookup_data(&key(k)).map(|(_, d)| d), Ok(checksum(k)));
    }
}

#[test]
fn rw_concurrency_with_cuckoo_displacement() {
    let params = Params::new("rw", 512, 4).with_flags(Flags::RW_CONCURRENCY);
    readers_against_one_writer(CuckooMap::new(&params).unwrap(), 300, 110, 200);
}

#[test]
fn rw_concurrency_with_extension_chains() {
    // four hot buckets, so most keys live in extension chains
    let params = Params::new("rw_ext", 256, 4).with_flags(Flags::RW_CONCURRENCY | Flags::EXT_TABLE);
    let m = CuckooMap::with_hasher(&params, |k: &[u8], _: u32| (k[0] & 3) as u32).unwrap();
    readers_against_one_writer(m, 60, 60, 300);
}

#[test]
fn lock_free_readers_with_epoch_reclaim() {
    let params = Params::new("lf", 256, 4).with_flags(Flags::RW_CONCURRENCY_LF | Flags::EXT_TABLE);
    let m = Arc::new(CuckooMap::new(&params).unwrap());
    let universe = 200u32;

    let n_readers = 3;
    let stop = Arc::new(AtomicBool::new(false));
    let epochs: Arc<Vec<AtomicU64>> = Arc::new((0..n_readers).map(|_| AtomicU64::new(0)).collect());
    let barrier = Arc::new(Barrier::new(n_readers + 1));

    let mut readers = Vec::new();
    for r in 0..n_readers {
        let map = m.clone();
        let stop = stop.clone();
        let epochs = epochs.clone();
        let b = barrier.clone();
        readers.push(thread::spawn(move || {
            b.wait();
            let mut i = r as u32;
            while !stop.load(Ordering::Acquire) {
                let k = i % universe;
                if let Ok((pos, d)) = map.lookup_data(&key(k)) {
                    assert_eq!(d, checksum(k));
                    // the position cannot be recycled before this reader moves on
                    match map.get_key_with_position(pos) {
                        Ok(stored) => assert_eq!(stored, key(k).to_vec()),
                        Err(e) => assert_eq!(e, Error::NotFound),
                    }
                }
                epochs[r].fetch_add(1, Ordering::Release);
                i = i.wrapping_add(13);
            }
        }));
    }

    barrier.wait();
    let wait_for_grace_period = || {
        let seen: Vec<u64> = epochs.iter().map(|e| e.load(Ordering::Acquire)).collect();
        for (e, s) in epochs.iter().zip(seen) {
            while e.load(Ordering::Acquire) < s + 2 {
                thread::yield_now();
            }
        }
    };

    for round in 0..40u32 {
        let mut retired = Vec::new();
        for k in (round % 2..universe).step_by(2) {
            match m.add_key_data(&key(k), checksum(k)) {
                Ok(_) => {}
                Err(e) => assert_eq!(e, Error::NoSpace),
            }
        }
        for k in (round % 2..universe).step_by(3) {
            if let Ok(p) = m.del_key(&key(k)) {
                retired.push(p);
            }
        }
        wait_for_grace_period();
        for p in retired {
            m.free_key_with_position(p).unwrap();
        }
    }
    stop.store(true, Ordering::Release);
    for h in readers {
        h.join().unwrap();
    }
}
