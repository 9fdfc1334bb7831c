use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cow_btree::Tree;

fn run_against_model<const ORDER: usize>(seed: u64, ops: usize) {
    let tree = Tree::<i64, u64, ORDER>::default();
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(seed);

    for _ in 0..ops {
        // extreme keys keep the sentinel handling honest
        let key = match rng.gen_range(0..64) {
            0 => i64::MAX,
            1 => i64::MIN,
            _ => rng.gen_range(-512_i64..512),
        };
        if rng.gen_bool(0.7) {
            let value = rng.gen::<u64>();
            assert_eq!(
                tree.insert(key, value),
                model.insert(key, value),
                "diverged on insert of key {key}"
            );
        } else {
            assert_eq!(
                tree.get(key),
                model.get(&key).copied(),
                "diverged on get of key {key}"
            );
        }
        assert_eq!(tree.len(), model.len());
    }

    for (key, value) in &model {
        assert_eq!(tree.get(*key), Some(*value), "failed to get key {key}");
    }
}

#[test]
fn deep_tree_matches_model() {
    for seed in 0..16 {
        run_against_model::<5>(seed, 4096);
    }
}

#[test]
fn default_tree_matches_model() {
    for seed in 16..24 {
        run_against_model::<17>(seed, 4096);
    }
}
