use cuckoomap_rs::{CuckooMap, Params};

fn main() {
    println!("Creating CuckooMap...");
    let map = CuckooMap::new(&Params::new("simple", 1024, 4)).expect("create table");

    println!("Adding keys...");
    for k in 1u32..=3 {
        let pos = map.add_key_data(&k.to_le_bytes(), k as usize * 10).expect("add");
        println!("  key {} -> position {}", k, pos);
    }

    println!("Deleting key 2...");
    let pos = map.del_key(&2u32.to_le_bytes()).expect("delete");
    println!("  freed position {}, {} keys left", pos, map.count());

    println!("Iterating...");
    for e in map.iter() {
        println!("  {:?} -> data {} at position {}", e.key, e.data, e.position);
    }

    println!("Done!");
}
