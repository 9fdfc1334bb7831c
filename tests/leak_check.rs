use std::time::Instant;

use cow_btree::Tree;

mod alloc {
    use std::alloc::{Layout, System};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[global_allocator]
    static ALLOCATOR: Alloc = Alloc;

    static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
    static FREED: AtomicUsize = AtomicUsize::new(0);
    static RESIDENT: AtomicUsize = AtomicUsize::new(0);

    pub fn allocated() -> usize {
        ALLOCATED.swap(0, Ordering::Relaxed) / 1_000_000
    }

    pub fn freed() -> usize {
        FREED.swap(0, Ordering::Relaxed) / 1_000_000
    }

    pub fn resident() -> usize {
        RESIDENT.load(Ordering::Relaxed) / 1_000_000
    }

    #[derive(Default, Debug, Clone, Copy)]
    struct Alloc;

    // Poisoning the memory on both edges turns use-after-free of a
    // retired node into a loud wrong-value failure instead of a quiet
    // read of stale but plausible bytes.
    unsafe impl std::alloc::GlobalAlloc for Alloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let ret = System.alloc(layout);
            assert_ne!(
                ret,
                std::ptr::null_mut(),
                "alloc returned null pointer for layout {layout:?}"
            );
            ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
            RESIDENT.fetch_add(layout.size(), Ordering::Relaxed);
            std::ptr::write_bytes(ret, 0xaa, layout.size());
            ret
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            std::ptr::write_bytes(ptr, 0xdd, layout.size());
            FREED.fetch_add(layout.size(), Ordering::Relaxed);
            RESIDENT.fetch_sub(layout.size(), Ordering::Relaxed);
            System.dealloc(ptr, layout)
        }
    }
}

#[test]
fn leak_check() {
    let n: i64 = 256;
    let rounds: i64 = 64;

    let concurrency = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(8)
        * 2;

    // Small reclamation buffers keep retired nodes flowing through the
    // epoch queues instead of pooling in thread-local buffers.
    let run = |tree: Tree<i64, u64, 5, 16>,
               barrier: &std::sync::Barrier,
               low_bits: i64,
               round: i64| {
        let shift = concurrency.next_power_of_two().trailing_zeros();
        // fresh keys every round keep the writer cloning and retiring
        // nodes rather than only swapping values in place
        let unique_key = |key: i64| ((round * n + key) << shift) | low_bits;

        barrier.wait();
        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(tree.get(i), None);
            tree.insert(i, i as u64);
            assert_eq!(tree.get(i), Some(i as u64), "failed to get key {i}");
        }
        for key in 0..n {
            let i = unique_key(key);
            let flipped = !(i as u64);
            assert_eq!(tree.insert(i, flipped), Some(i as u64));
            assert_eq!(tree.get(i), Some(flipped), "failed to get key {i}");
        }
        if round > 0 {
            // spot-check that the previous round's entries survived
            for key in 0..n {
                let i = (((round - 1) * n + key) << shift) | low_bits;
                assert_eq!(tree.get(i), Some(!(i as u64)), "failed to get key {i}");
            }
        }
    };

    let before = Instant::now();
    let resident_before = alloc::resident();

    let tree = Tree::default();
    std::thread::scope(|s| {
        for round in 0..rounds {
            let barrier = std::sync::Arc::new(std::sync::Barrier::new(concurrency));
            let mut threads = vec![];
            for i in 0..concurrency {
                let tree_2 = tree.clone();
                let barrier_2 = barrier.clone();

                let thread =
                    s.spawn(move || run(tree_2, &barrier_2, i64::try_from(i).unwrap(), round));
                threads.push(thread);
            }
            for thread in threads {
                thread.join().unwrap();
            }
        }
    });

    let total = usize::try_from(n * rounds).unwrap() * concurrency;
    assert_eq!(tree.len(), total);

    drop(tree);

    let resident_after = alloc::resident();

    println!(
        "{:.2} million wps {} mb allocated {} mb freed {} mb resident to insert {} items",
        total as f64 / (before.elapsed().as_micros().max(1)) as f64,
        alloc::allocated(),
        alloc::freed(),
        resident_after,
        total,
    );

    assert_eq!(
        resident_after - resident_before,
        0,
        "leaked {resident_after}mb"
    );
}
