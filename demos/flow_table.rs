//! Flow table: a packet-processing style lookup of 5-tuples with per-flow counters kept in
//! a caller-owned array indexed by table position, while a control thread ages flows out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cuckoomap_rs::{CuckooMap, Flags, Params, LOOKUP_BULK_MAX};
use rand::prelude::*;

const FLOWS: u32 = 1 << 14;

fn five_tuple(src: u32, dst: u32, sport: u16, dport: u16, proto: u8) -> [u8; 13] {
    let mut k = [0u8; 13];
    k[0..4].copy_from_slice(&src.to_be_bytes());
    k[4..8].copy_from_slice(&dst.to_be_bytes());
    k[8..10].copy_from_slice(&sport.to_be_bytes());
    k[10..12].copy_from_slice(&dport.to_be_bytes());
    k[12] = proto;
    k
}

fn main() {
    let params = Params::new("flows", FLOWS, 13)
        .with_init_val(0xfeed)
        .with_flags(Flags::RW_CONCURRENCY_LF | Flags::EXT_TABLE);
    let table = Arc::new(CuckooMap::new(&params).expect("create flow table"));
    let counters: Arc<Vec<AtomicU64>> =
        Arc::new((0..table.max_key_id()).map(|_| AtomicU64::new(0)).collect());

    let mut rng = StdRng::seed_from_u64(7);
    let flows: Vec<[u8; 13]> = (0..FLOWS / 2)
        .map(|_| five_tuple(rng.gen(), rng.gen(), rng.gen(), 443, 6))
        .collect();
    for f in &flows {
        table.add_key(f).expect("add flow");
    }
    println!("{} flows installed", table.count());

    let stop = Arc::new(AtomicBool::new(false));
    let reader_epoch = Arc::new(AtomicU64::new(0));

    // data plane: classify bursts of packets
    let worker = {
        let table = table.clone();
        let counters = counters.clone();
        let stop = stop.clone();
        let reader_epoch = reader_epoch.clone();
        let flows = flows.clone();
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(11);
            let mut positions = [None; LOOKUP_BULK_MAX];
            let mut packets = 0u64;
            let mut misses = 0u64;
            while !stop.load(Ordering::Acquire) {
                let burst: Vec<&[u8]> = (0..LOOKUP_BULK_MAX)
                    .map(|_| &flows[rng.gen_range(0..flows.len())][..])
                    .collect();
                let hits = table.lookup_bulk(&burst, &mut positions).unwrap_or(0);
                for p in positions.iter().flatten() {
                    counters[*p as usize].fetch_add(1, Ordering::Relaxed);
                }
                packets += LOOKUP_BULK_MAX as u64;
                misses += LOOKUP_BULK_MAX as u64 - hits.count_ones() as u64;
                reader_epoch.fetch_add(1, Ordering::Release);
            }
            (packets, misses)
        })
    };

    // control plane: expire a slice of flows, wait out in-flight bursts, then free
    let deadline = Instant::now() + Duration::from_millis(200);
    let mut expired = 0;
    for f in flows.iter().step_by(4) {
        if Instant::now() > deadline {
            break;
        }
        if let Ok(pos) = table.del_key(f) {
            let seen = reader_epoch.load(Ordering::Acquire);
            while reader_epoch.load(Ordering::Acquire) < seen + 2 {
                thread::yield_now();
            }
            counters[pos as usize].store(0, Ordering::Relaxed);
            table.free_key_with_position(pos).expect("free expired flow");
            expired += 1;
        }
    }

    stop.store(true, Ordering::Release);
    let (packets, misses) = worker.join().expect("worker");
    println!(
        "{} packets classified, {} misses, {} flows expired, {} flows left",
        packets,
        misses,
        expired,
        table.count()
    );
}
