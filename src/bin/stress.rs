use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::scope;
use std::time::Instant;

use cow_btree::Tree;

const READERS: usize = 7;
const N: i64 = 1024 * 1024;

/// Spreads sequential indexes across the whole key space so inserts
/// land all over the tree instead of appending to one edge.
fn mix(i: i64) -> i64 {
    (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) as i64
}

fn writer(tree: Tree<i64, u64>) {
    for i in 0..N {
        let key = mix(i);
        tree.insert(key, key as u64);
    }
}

fn reader(tree: Tree<i64, u64>, done: &AtomicBool, gets: &AtomicU64) {
    let mut local = 0_u64;
    let mut i = 0;
    while !done.load(Ordering::Relaxed) {
        let key = mix(i % N);
        if let Some(value) = tree.get(key) {
            assert_eq!(value, key as u64);
        }
        local += 1;
        i += 1;
    }
    gets.fetch_add(local, Ordering::Relaxed);
}

fn main() {
    let tree = Tree::default();
    let done = AtomicBool::new(false);
    let gets = AtomicU64::new(0);

    let before = Instant::now();
    scope(|s| {
        let mut handles = vec![];

        for _ in 0..READERS {
            let tree = tree.clone();
            let done = &done;
            let gets = &gets;
            handles.push(s.spawn(move || reader(tree, done, gets)));
        }

        let write_handle = {
            let tree = tree.clone();
            s.spawn(move || writer(tree))
        };
        write_handle.join().unwrap();
        done.store(true, Ordering::Relaxed);

        for handle in handles {
            handle.join().unwrap();
        }
    });
    let elapsed = before.elapsed();

    assert_eq!(tree.len(), usize::try_from(N).unwrap());

    let inserts_per_second = N as u128 * 1000 / elapsed.as_millis();
    let gets_per_second = u128::from(gets.load(Ordering::Relaxed)) * 1000 / elapsed.as_millis();

    println!(
        "with 1 writer and {} readers, took {:?} to insert {} items \
         ({} inserts per second, {} gets per second)",
        READERS, elapsed, N, inserts_per_second, gets_per_second
    );
}
