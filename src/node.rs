//! Tree nodes and the shape changes that build new versions of them.
//!
//! Published nodes never change shape: keys and occupancy are frozen
//! the moment a node becomes reachable from the shared root, and only
//! leaf value slots stay writable, through atomic swaps. Every split
//! and every key arrival happens on a private copy that the writer
//! links in with a single pointer store.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::search::{find_index_scalar, KeySearch};
use crate::Key;

/// Key storage with the alignment that 256-bit loads require.
///
/// Slots at and past the occupancy count always hold `K::MAX`, so the
/// vectorized search can walk whole tiles without masking.
#[derive(Clone, Copy)]
#[repr(align(32))]
pub(crate) struct KeyArray<K, const ORDER: usize>([K; ORDER]);

/// Per-kind node payload. A leaf pairs each key with a value slot; an
/// index node keeps one more child than it has keys.
///
/// The arrays are sized `ORDER` so that both kinds share a layout; a
/// node holds at most `ORDER - 1` keys and the final key slot is a
/// permanent sentinel.
pub(crate) enum Data<K, const ORDER: usize> {
    Leaf([AtomicU64; ORDER]),
    Index([AtomicPtr<Node<K, ORDER>>; ORDER]),
}

pub(crate) struct Node<K, const ORDER: usize> {
    keys: KeyArray<K, ORDER>,
    len: u16,
    data: Data<K, ORDER>,
}

impl<K, const ORDER: usize> Node<K, ORDER> {
    pub(crate) const MAX_KEYS: usize = ORDER - 1;
    pub(crate) const MIN_DEG: usize = (ORDER + 1) / 2;

    pub(crate) fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() == Self::MAX_KEYS
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self.data, Data::Leaf(_))
    }

    pub(crate) fn values(&self) -> &[AtomicU64; ORDER] {
        match &self.data {
            Data::Leaf(values) => values,
            Data::Index(_) => unreachable!(),
        }
    }

    pub(crate) fn children(&self) -> &[AtomicPtr<Node<K, ORDER>>; ORDER] {
        match &self.data {
            Data::Index(children) => children,
            Data::Leaf(_) => unreachable!(),
        }
    }

    fn values_mut(&mut self) -> &mut [AtomicU64; ORDER] {
        match &mut self.data {
            Data::Leaf(values) => values,
            Data::Index(_) => unreachable!(),
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut [AtomicPtr<Node<K, ORDER>>; ORDER] {
        match &mut self.data {
            Data::Index(children) => children,
            Data::Leaf(_) => unreachable!(),
        }
    }
}

impl<K: Key, const ORDER: usize> Node<K, ORDER> {
    pub(crate) fn new_leaf() -> Box<Node<K, ORDER>> {
        Box::new(Node {
            keys: KeyArray([K::MAX; ORDER]),
            len: 0,
            data: Data::Leaf(std::array::from_fn(|_| AtomicU64::new(0))),
        })
    }

    pub(crate) fn new_index() -> Box<Node<K, ORDER>> {
        Box::new(Node {
            keys: KeyArray([K::MAX; ORDER]),
            len: 0,
            data: Data::Index(std::array::from_fn(|_| {
                AtomicPtr::new(std::ptr::null_mut())
            })),
        })
    }

    pub(crate) fn key(&self, i: usize) -> K {
        self.keys.0[i]
    }

    /// Position of the first live key at or above `query`, or the
    /// occupancy count when every live key is below it.
    pub(crate) fn find(&self, query: K, search: KeySearch) -> usize {
        let keys = &self.keys.0[..Self::MAX_KEYS];
        match search {
            KeySearch::Scalar => find_index_scalar(keys, self.len(), query),
            KeySearch::Avx2 => K::find_index_vector(keys, self.len(), query),
        }
    }

    /// Places `key` in this leaf, which must be private and, when the
    /// key is new, not yet full. Returns the previous bits when the key
    /// was already present.
    pub(crate) fn leaf_insert(&mut self, key: K, bits: u64, search: KeySearch) -> Option<u64> {
        let i = self.find(key, search);
        if i < self.len() && self.key(i) == key {
            let values = self.values_mut();
            return Some(std::mem::replace(values[i].get_mut(), bits));
        }
        let len = self.len();
        debug_assert!(len < Self::MAX_KEYS);
        self.keys.0.copy_within(i..len, i + 1);
        self.keys.0[i] = key;
        let values = self.values_mut();
        for j in (i..len).rev() {
            let moved = *values[j].get_mut();
            *values[j + 1].get_mut() = moved;
        }
        *values[i].get_mut() = bits;
        self.len += 1;
        None
    }

    /// Copies `len` keys starting at `start` into a fresh node of the
    /// same kind, along with the matching values or the matching
    /// `len + 1` children.
    fn carve(&self, start: usize, len: usize) -> Box<Node<K, ORDER>> {
        let mut half = match &self.data {
            Data::Leaf(_) => Self::new_leaf(),
            Data::Index(_) => Self::new_index(),
        };
        half.len = len as u16;
        half.keys.0[..len].copy_from_slice(&self.keys.0[start..start + len]);
        match (&self.data, &mut half.data) {
            (Data::Leaf(src), Data::Leaf(dst)) => {
                for j in 0..len {
                    *dst[j].get_mut() = src[start + j].load(Ordering::Acquire);
                }
            }
            (Data::Index(src), Data::Index(dst)) => {
                for j in 0..=len {
                    *dst[j].get_mut() = src[start + j].load(Ordering::Acquire);
                }
            }
            (Data::Leaf(_), Data::Index(_)) | (Data::Index(_), Data::Leaf(_)) => unreachable!(),
        }
        half
    }

    /// Splits the full, still-published `child` into two fresh halves
    /// and links them into this node at child position `i`, promoting
    /// the median key. This node must be private and have room.
    ///
    /// A split leaf keeps the promoted key in its right half so that
    /// lookups for it land on a real slot; a split index node promotes
    /// the median out entirely. Returns the promoted key, which the
    /// caller uses to pick the half to continue into: queries at or
    /// above it belong to the right half.
    pub(crate) fn split_child(&mut self, i: usize, child: &Node<K, ORDER>) -> K {
        debug_assert!(child.is_full());
        debug_assert!(!self.is_full());

        let median = child.key(Self::MIN_DEG - 1);
        let (left, right) = if child.is_leaf() {
            (
                child.carve(0, Self::MIN_DEG - 1),
                child.carve(Self::MIN_DEG - 1, ORDER - Self::MIN_DEG),
            )
        } else {
            (
                child.carve(0, Self::MIN_DEG - 1),
                child.carve(Self::MIN_DEG, ORDER - Self::MIN_DEG - 1),
            )
        };

        let len = self.len();
        self.keys.0.copy_within(i..len, i + 1);
        self.keys.0[i] = median;
        let children = self.children_mut();
        for j in (i + 1..=len).rev() {
            let moved = *children[j].get_mut();
            *children[j + 1].get_mut() = moved;
        }
        *children[i].get_mut() = Box::into_raw(left);
        *children[i + 1].get_mut() = Box::into_raw(right);
        self.len += 1;
        median
    }
}

/// Clones load each slot individually. The source must not be under
/// mutation, which the single-writer lock provides.
impl<K: Key, const ORDER: usize> Clone for Node<K, ORDER> {
    fn clone(&self) -> Node<K, ORDER> {
        Node {
            keys: self.keys,
            len: self.len,
            data: match &self.data {
                Data::Leaf(values) => Data::Leaf(std::array::from_fn(|i| {
                    AtomicU64::new(values[i].load(Ordering::Acquire))
                })),
                Data::Index(children) => Data::Index(std::array::from_fn(|i| {
                    AtomicPtr::new(children[i].load(Ordering::Acquire))
                })),
            },
        }
    }
}

/// Frees `ptr` and every node reachable below it.
///
/// # Safety
///
/// `ptr` must have come out of `Box::into_raw`, and its subtree must no
/// longer be reachable by any other thread.
pub(crate) unsafe fn drop_subtree<K, const ORDER: usize>(ptr: *mut Node<K, ORDER>) {
    let mut node = unsafe { Box::from_raw(ptr) };
    let len = node.len();
    if let Data::Index(children) = &mut node.data {
        for slot in &mut children[..=len] {
            unsafe { drop_subtree(*slot.get_mut()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with<const ORDER: usize>(pairs: &[(i32, u64)]) -> Box<Node<i32, ORDER>> {
        let mut leaf = Node::new_leaf();
        for (key, bits) in pairs {
            assert_eq!(leaf.leaf_insert(*key, *bits, KeySearch::Scalar), None);
        }
        leaf
    }

    #[test]
    fn leaf_insert_keeps_sorted_order() {
        let leaf = leaf_with::<17>(&[(30, 3), (10, 1), (40, 4), (20, 2)]);
        assert_eq!(leaf.len(), 4);
        for (i, want) in [10, 20, 30, 40].into_iter().enumerate() {
            assert_eq!(leaf.key(i), want);
            assert_eq!(leaf.values()[i].load(Ordering::Acquire), i as u64 + 1);
        }
        for i in 4..17 {
            assert_eq!(leaf.key(i), i32::MAX);
        }
    }

    #[test]
    fn leaf_insert_replaces_in_place() {
        let mut leaf = leaf_with::<17>(&[(10, 1), (20, 2)]);
        assert_eq!(leaf.leaf_insert(10, 9, KeySearch::Scalar), Some(1));
        assert_eq!(leaf.len(), 2);
        assert_eq!(leaf.values()[0].load(Ordering::Acquire), 9);
    }

    #[test]
    fn leaf_split_keeps_median_on_the_right() {
        let leaf = leaf_with::<5>(&[(10, 1), (20, 2), (30, 3), (40, 4)]);
        assert!(leaf.is_full());

        let mut parent = Node::<i32, 5>::new_index();
        let median = parent.split_child(0, &leaf);
        assert_eq!(median, 30);
        assert_eq!(parent.len(), 1);
        assert_eq!(parent.key(0), 30);

        let left = unsafe { &*parent.children()[0].load(Ordering::Acquire) };
        let right = unsafe { &*parent.children()[1].load(Ordering::Acquire) };
        assert_eq!(left.len(), 2);
        assert_eq!((left.key(0), left.key(1)), (10, 20));
        assert_eq!(right.len(), 2);
        assert_eq!((right.key(0), right.key(1)), (30, 40));
        assert_eq!(left.values()[1].load(Ordering::Acquire), 2);
        assert_eq!(right.values()[0].load(Ordering::Acquire), 3);
        for i in 2..4 {
            assert_eq!(left.key(i), i32::MAX);
            assert_eq!(right.key(i), i32::MAX);
        }

        unsafe { drop_subtree(Box::into_raw(parent)) };
    }

    #[test]
    fn index_split_promotes_the_median_out() {
        let mut full = Node::<i32, 5>::new_index();
        for (i, key) in [10, 20, 30, 40].into_iter().enumerate() {
            full.keys.0[i] = key;
        }
        full.len = 4;
        for j in 0..5 {
            *full.children_mut()[j].get_mut() = Box::into_raw(Node::<i32, 5>::new_leaf());
        }

        let mut parent = Node::<i32, 5>::new_index();
        let median = parent.split_child(0, &full);
        assert_eq!(median, 30);

        let left = unsafe { &*parent.children()[0].load(Ordering::Acquire) };
        let right = unsafe { &*parent.children()[1].load(Ordering::Acquire) };
        assert_eq!(left.len(), 2);
        assert_eq!((left.key(0), left.key(1)), (10, 20));
        assert_eq!(right.len(), 1);
        assert_eq!(right.key(0), 40);
        for j in 0..=left.len() {
            assert!(!left.children()[j].load(Ordering::Acquire).is_null());
        }
        for j in 0..=right.len() {
            assert!(!right.children()[j].load(Ordering::Acquire).is_null());
        }
        assert!(right.children()[right.len() + 1]
            .load(Ordering::Acquire)
            .is_null());

        // The halves own the grandchildren now; `full` has no drop
        // glue, so releasing it only frees the one allocation.
        unsafe { drop_subtree(Box::into_raw(parent)) };
    }

    #[test]
    fn split_inserts_halves_at_interior_positions() {
        // A parent whose slot 0 holds a full leaf, as the descent sees
        // it just before splitting.
        let mut parent = Node::<i32, 5>::new_index();
        let full = Box::into_raw(leaf_with::<5>(&[(1, 1), (2, 2), (3, 3), (4, 4)]));
        let sibling = Box::into_raw(leaf_with::<5>(&[(400, 4)]));
        parent.keys.0[0] = 300;
        parent.len = 1;
        *parent.children_mut()[0].get_mut() = full;
        *parent.children_mut()[1].get_mut() = sibling;

        let median = parent.split_child(0, unsafe { &*full });
        assert_eq!(median, 3);
        // the split replaced slot 0, so the displaced leaf is ours
        drop(unsafe { Box::from_raw(full) });

        assert_eq!(parent.len(), 2);
        assert_eq!((parent.key(0), parent.key(1)), (3, 300));
        let ptrs: Vec<_> = (0..=2)
            .map(|j| parent.children()[j].load(Ordering::Acquire))
            .collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        let mid = unsafe { &*ptrs[1] };
        assert_eq!((mid.key(0), mid.key(1)), (3, 4));
        assert_eq!(ptrs[2], sibling);

        unsafe { drop_subtree(Box::into_raw(parent)) };
    }

    #[test]
    fn wide_leaf_split_shape() {
        let pairs: Vec<(i32, u64)> = (1..=16).map(|k| (k * 10, k as u64)).collect();
        let leaf = leaf_with::<17>(&pairs);
        assert!(leaf.is_full());

        let mut parent = Node::<i32, 17>::new_index();
        let median = parent.split_child(0, &leaf);
        assert_eq!(median, 90);

        let left = unsafe { &*parent.children()[0].load(Ordering::Acquire) };
        let right = unsafe { &*parent.children()[1].load(Ordering::Acquire) };
        assert_eq!(left.len(), 8);
        assert_eq!(right.len(), 8);
        assert_eq!(left.key(7), 80);
        assert_eq!(right.key(0), 90);
        assert_eq!(right.key(7), 160);

        unsafe { drop_subtree(Box::into_raw(parent)) };
    }
}
