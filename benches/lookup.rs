use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cuckoomap_rs::{CuckooMap, Params, LOOKUP_BULK_MAX};
use dashmap::DashMap;
use rand::prelude::*;
use std::collections::HashMap;

const ENTRIES: u32 = 1 << 16;
const KEYS: u32 = 50_000;

fn random_keys(n: u32) -> Vec<[u8; 16]> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n).map(|_| rng.gen()).collect()
}

fn bench_add_lookup_delete_cuckoomap(c: &mut Criterion) {
    let keys = random_keys(KEYS);
    c.bench_function("cuckoomap_add_lookup_delete", |b| {
        let m = CuckooMap::new(&Params::new("bench", ENTRIES, 16)).unwrap();
        b.iter(|| {
            for k in &keys {
                let _ = m.add_key(k);
            }
            for k in &keys {
                let _ = black_box(m.lookup(k));
            }
            for k in &keys {
                let _ = m.del_key(k);
            }
            black_box(m.count())
        })
    });
}

fn bench_insert_get_remove_hashmap(c: &mut Criterion) {
    let keys = random_keys(KEYS);
    c.bench_function("hashmap_insert_get_remove", |b| {
        b.iter(|| {
            let mut m = HashMap::<[u8; 16], u32>::with_capacity(ENTRIES as usize);
            for (i, k) in keys.iter().enumerate() {
                m.insert(*k, i as u32);
            }
            for k in &keys {
                let _ = black_box(m.get(k));
            }
            for k in &keys {
                let _ = m.remove(k);
            }
            black_box(m.len())
        })
    });
}

fn bench_insert_get_remove_dashmap(c: &mut Criterion) {
    let keys = random_keys(KEYS);
    c.bench_function("dashmap_insert_get_remove", |b| {
        b.iter(|| {
            let m = DashMap::<[u8; 16], u32>::with_capacity(ENTRIES as usize);
            for (i, k) in keys.iter().enumerate() {
                m.insert(*k, i as u32);
            }
            for k in &keys {
                let _ = black_box(m.get(k).map(|v| *v));
            }
            for k in &keys {
                let _ = m.remove(k);
            }
            black_box(m.len())
        })
    });
}

fn bench_lookup_single_vs_bulk(c: &mut Criterion) {
    let keys = random_keys(KEYS);
    let m = CuckooMap::new(&Params::new("bench_bulk", ENTRIES, 16)).unwrap();
    for k in &keys {
        m.add_key(k).unwrap();
    }
    let refs: Vec<&[u8]> = keys.iter().map(|k| &k[..]).collect();

    c.bench_function("cuckoomap_lookup_single", |b| {
        b.iter(|| {
            for k in &refs {
                let _ = black_box(m.lookup(k));
            }
        })
    });

    c.bench_function("cuckoomap_lookup_bulk", |b| {
        let mut positions = [None; LOOKUP_BULK_MAX];
        b.iter(|| {
            for batch in refs.chunks(LOOKUP_BULK_MAX) {
                let hits = m.lookup_bulk(batch, &mut positions[..batch.len()]);
                black_box(hits.ok());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_add_lookup_delete_cuckoomap,
    bench_insert_get_remove_hashmap,
    bench_insert_get_remove_dashmap,
    bench_lookup_single_vs_bulk
);
criterion_main!(benches);
