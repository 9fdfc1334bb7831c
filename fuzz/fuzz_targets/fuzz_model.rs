#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate cow_btree;

use arbitrary::Arbitrary;

use cow_btree::{KeySearch, Tree};

const KEYSPACE: i32 = 96;

#[derive(Debug)]
enum Op {
    Insert { key: i32, value: u64 },
    Get { key: i32 },
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(if u.ratio(2, 3)? {
            Op::Insert {
                key: u.int_in_range(-KEYSPACE..=KEYSPACE)?,
                value: u.arbitrary()?,
            }
        } else {
            Op::Get {
                key: u.int_in_range(-KEYSPACE..=KEYSPACE)?,
            }
        })
    }
}

fuzz_target!(|ops: Vec<Op>| {
    // a deep scalar tree and a wide vectorized tree have to agree with
    // the model and with each other
    let deep = Tree::<i32, u64, 5>::default();
    let wide = Tree::<i32, u64, 9>::with_key_search(KeySearch::Avx2);
    let mut model = std::collections::BTreeMap::new();

    for op in ops {
        match op {
            Op::Insert { key, value } => {
                let expected = model.insert(key, value);
                assert_eq!(deep.insert(key, value), expected);
                assert_eq!(wide.insert(key, value), expected);
            }
            Op::Get { key } => {
                let expected = model.get(&key).copied();
                assert_eq!(deep.get(key), expected);
                assert_eq!(wide.get(key), expected);
            }
        }

        for (key, value) in &model {
            assert_eq!(deep.get(*key), Some(*value));
            assert_eq!(wide.get(*key), Some(*value));
        }
    }

    assert_eq!(deep.len(), model.len());
    assert_eq!(wide.len(), model.len());
});
