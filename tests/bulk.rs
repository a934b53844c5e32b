use cuckoomap_rs::{CuckooMap, Error, Flags, Params, LOOKUP_BULK_MAX};

fn key(i: u32) -> [u8; 4] {
    i.to_le_bytes()
}

#[test]
fn half_present_batch_matches_single_lookups() {
    let m = CuckooMap::new(&Params::new("bulk", 1024, 4)).unwrap();
    for i in (0..64u32).step_by(2) {
        m.add_key_data(&key(i), i as usize * 10).unwrap();
    }

    let owned: Vec<[u8; 4]> = (0..64u32).map(key).collect();
    let keys: Vec<&[u8]> = owned.iter().map(|k| &k[..]).collect();

    let mut positions = vec![None; 64];
    let hits = m.lookup_bulk(&keys, &mut positions).unwrap();
    assert_eq!(hits, 0x5555_5555_5555_5555);
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(positions[i], m.lookup(k).ok());
    }

    let mut data = vec![usize::MAX; 64];
    let hits = m.lookup_bulk_data(&keys, &mut data).unwrap();
    assert_eq!(hits, 0x5555_5555_5555_5555);
    for i in 0..64 {
        if i % 2 == 0 {
            assert_eq!(data[i], i * 10);
        } else {
            assert_eq!(data[i], usize::MAX);
        }
    }
}

#[test]
fn with_hash_bulk_variants() {
    let m = CuckooMap::new(&Params::new("bulk_hash", 256, 4)).unwrap();
    let owned: Vec<[u8; 4]> = (0..10u32).map(key).collect();
    let keys: Vec<&[u8]> = owned.iter().map(|k| &k[..]).collect();
    let sigs: Vec<u32> = keys.iter().map(|k| m.hash(k)).collect();
    for i in 0..5 {
        m.add_key_with_hash_data(keys[i], sigs[i], 1000 + i).unwrap();
    }

    let mut positions = [None; 10];
    let hits = m.lookup_with_hash_bulk(&keys, &sigs, &mut positions).unwrap();
    assert_eq!(hits, 0b11111);
    assert!(positions[..5].iter().all(Option::is_some));
    assert!(positions[5..].iter().all(Option::is_none));

    let mut data = [0usize; 10];
    let hits = m.lookup_with_hash_bulk_data(&keys, &sigs, &mut data).unwrap();
    assert_eq!(hits, 0b11111);
    assert_eq!(&data[..5], &[1000, 1001, 1002, 1003, 1004]);
}

#[test]
fn bulk_finds_keys_in_extension_chain() {
    let params = Params::new("bulk_ext", 64, 4).with_flags(Flags::EXT_TABLE);
    let m = CuckooMap::with_hasher(&params, |_: &[u8], _: u32| 0u32).unwrap();
    let owned: Vec<[u8; 4]> = (0..40u32).map(key).collect();
    let keys: Vec<&[u8]> = owned.iter().map(|k| &k[..]).collect();
    for k in &keys[..30] {
        m.add_key(k).unwrap();
    }

    let mut positions = vec![None; 40];
    let hits = m.lookup_bulk(&keys, &mut positions).unwrap();
    assert_eq!(hits, (1u64 << 30) - 1);
}

#[test]
fn bulk_rejects_bad_batches() {
    let m = CuckooMap::new(&Params::new("bulk_args", 256, 4)).unwrap();
    let mut positions = vec![None; LOOKUP_BULK_MAX + 1];

    let empty: Vec<&[u8]> = Vec::new();
    assert!(matches!(m.lookup_bulk(&empty, &mut positions), Err(Error::InvalidArgument(_))));

    let owned: Vec<[u8; 4]> = (0..LOOKUP_BULK_MAX as u32 + 1).map(key).collect();
    let too_many: Vec<&[u8]> = owned.iter().map(|k| &k[..]).collect();
    assert!(matches!(m.lookup_bulk(&too_many, &mut positions), Err(Error::InvalidArgument(_))));

    let keys = &too_many[..4];
    let mut short = [None; 3];
    assert!(matches!(m.lookup_bulk(keys, &mut short), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        m.lookup_with_hash_bulk(keys, &[1, 2], &mut positions),
        Err(Error::InvalidArgument(_))
    ));

    let bad: [&[u8]; 2] = [b"abcd", b"abc"];
    assert!(matches!(m.lookup_bulk(&bad, &mut positions), Err(Error::InvalidArgument(_))));
}
