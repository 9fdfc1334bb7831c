#![cfg_attr(
    test,
    deny(
        missing_docs,
        future_incompatible,
        nonstandard_style,
        rust_2018_idioms,
        missing_copy_implementations,
        unused_qualifications,
    )
)]
#![cfg_attr(test, deny(
    clippy::empty_enum,
    clippy::explicit_into_iter_loop,
    clippy::explicit_iter_loop,
    clippy::expl_impl_clone_on_copy,
    clippy::fallible_impl_from,
    clippy::get_unwrap,
    clippy::match_like_matches_macro,
    clippy::maybe_infinite_iter,
    clippy::mem_forget,
    clippy::mut_mut,
    clippy::needless_continue,
    clippy::non_ascii_literal,
    clippy::shadow_reuse,
    clippy::shadow_same,
    clippy::shadow_unrelated,
    clippy::string_add,
    clippy::string_add_assign,
    clippy::unicode_not_nfc,
    clippy::unimplemented,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding,
    clippy::wildcard_dependencies,
))]
#![cfg_attr(
    test,
    warn(
        clippy::missing_const_for_fn,
        clippy::multiple_crate_versions,
        clippy::wildcard_enum_match_arm,
    )
)]

//! A copy-on-write B+ tree with lock-free reads, a serialized writer,
//! and SIMD key search.
//!
//! [`Tree`] maps fixed-width signed integer keys to fixed-size values.
//! Readers walk the tree without any locks: an epoch guard keeps the
//! nodes they can see alive, and leaf value slots are loaded with a
//! single atomic operation. The writer rebuilds only the nodes an
//! insert changes and splices the finished replacement in with one
//! atomic pointer store, so a reader always observes a fully formed
//! tree, either the one before the insert or the one after it.
//!
//! Unused key slots in every node are padded with the key type's
//! maximum value, which lets the position search compare an entire
//! 256-bit register of keys per step on CPUs with avx2. Pick the
//! comparator per tree with [`Tree::with_key_search`], or let
//! [`Default`] detect it.
//!
//! The tree fan-out (`ORDER`) and the memory reclamation granularity
//! (`LOCAL_GC_BUFFER_SIZE`) are tunable; the defaults suit point
//! lookups over 4-byte and 8-byte keys well. There is no deletion and
//! no range scan: this structure is built for insert-heavy, read-mostly
//! indexes that only ever grow.

#[cfg(not(feature = "fault_injection"))]
#[inline]
const fn debug_delay() {}

/// Induces random jitter around atomic operations, shaking out more
/// possible interleavings between readers and the writer. It compiles
/// away entirely in normal builds.
#[cfg(feature = "fault_injection")]
fn debug_delay() {
    use rand::{thread_rng, Rng};

    match thread_rng().gen_range(0..100) {
        0..=97 => {}
        98 => std::thread::yield_now(),
        _ => std::thread::sleep(std::time::Duration::from_micros(50)),
    }
}

use std::fmt;
use std::marker::PhantomData;
use std::sync::{
    atomic::{AtomicPtr, AtomicUsize, Ordering},
    Arc,
};

#[cfg(feature = "timing")]
use std::sync::atomic::AtomicU64;
#[cfg(feature = "timing")]
use std::time::{Duration, Instant};

use ebr::Ebr;
use parking_lot::Mutex;
use smallvec::SmallVec;

mod node;
mod search;
mod trace;

use node::{drop_subtree, Node};
use trace::{debug_log, trace_log};

pub use search::KeySearch;

/// Nodes a single insert unlinked from the tree, waiting for their
/// deferred reclamation once the splice has made them unreachable.
type Retired<K, const ORDER: usize> = SmallVec<[*mut Node<K, ORDER>; 8]>;

/// Keys the tree can index: fixed-width signed integers.
///
/// The comparison kernels rely on two properties of implementors. `MAX`
/// pads every unoccupied key slot, so vectorized comparisons never read
/// garbage, and the 256-bit compare instructions order lanes as signed
/// integers, which is why the unsigned widths are absent.
pub trait Key: Copy + Ord + Send + Sync + 'static {
    /// Greatest value of the type; fills every unoccupied key slot.
    const MAX: Self;

    /// Locates the first slot at or above `query` in a sentinel-padded
    /// key array. The default is the scalar walk; the provided integer
    /// impls dispatch to vector kernels when the CPU allows it.
    fn find_index_vector(keys: &[Self], len: usize, query: Self) -> usize {
        search::find_index_scalar(keys, len, query)
    }
}

macro_rules! impl_key {
    ($($t:ty => $vector:path),* $(,)?) => {
        $(
            impl Key for $t {
                const MAX: $t = <$t>::MAX;

                #[inline]
                fn find_index_vector(keys: &[$t], len: usize, query: $t) -> usize {
                    $vector(keys, len, query)
                }
            }
        )*
    }
}

impl_key!(
    i8 => search::find_index_i8,
    i16 => search::find_index_i16,
    i32 => search::find_index_i32,
    i64 => search::find_index_i64,
);

/// Values the tree can store inline in a leaf's atomic slots.
///
/// Each value travels through the tree as a `u64` bit pattern, which is
/// what lets a reader load it with one atomic operation while the
/// writer overwrites it in place. Types wider than eight bytes have no
/// single-copy atomicity on current hardware, so they are out.
pub trait Value: Copy + Send + Sync + 'static {
    /// Packs the value into its transport bits.
    fn to_bits(self) -> u64;

    /// The inverse of [`Value::to_bits`]; must reproduce the value
    /// exactly.
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl Value for $t {
                #[inline]
                fn to_bits(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn from_bits(bits: u64) -> $t {
                    bits as $t
                }
            }
        )*
    }
}

impl_value!(u8, u16, u32, usize, i8, i16, i32, i64, isize);

impl Value for u64 {
    #[inline]
    fn to_bits(self) -> u64 {
        self
    }

    #[inline]
    fn from_bits(bits: u64) -> u64 {
        bits
    }
}

/// A concurrent ordered map from fixed-width signed integer keys to
/// fixed-size values.
///
/// Readers never block and never lock: [`Tree::get`] walks the tree
/// under an epoch guard and finishes with a single atomic value load.
/// Writers are serialized by an internal lock. Each insert copies only
/// the nodes it has to change, finishes them in private, and publishes
/// the result with one atomic pointer store, so readers always observe
/// either the tree before the insert or the tree after it, never a
/// partial state. Nodes displaced by an insert are handed to epoch
/// based reclamation and freed once no reader can still be looking at
/// them.
///
/// A `Tree` handle is `Send` but not `Sync`: clone one handle per
/// thread. Clones share the same tree.
///
/// The default `ORDER` of 17 gives nodes sixteen key slots, which for
/// 4-byte keys is exactly two 32-byte comparison tiles. See
/// [`Tree::with_key_search`] for how the comparator is chosen.
///
/// # Examples
///
/// ```
/// let tree = cow_btree::Tree::<i64, u64>::default();
///
/// assert_eq!(tree.insert(1, 10), None);
/// assert_eq!(tree.get(1), Some(10));
/// assert_eq!(tree.insert(1, 11), Some(10));
///
/// let reader = tree.clone();
/// std::thread::spawn(move || {
///     assert_eq!(reader.get(1), Some(11));
/// })
/// .join()
/// .unwrap();
/// ```
#[derive(Clone)]
pub struct Tree<K, V, const ORDER: usize = 17, const LOCAL_GC_BUFFER_SIZE: usize = 128>
where
    K: Key,
    V: Value,
{
    // epoch-based reclamation
    ebr: Ebr<Box<Node<K, ORDER>>, LOCAL_GC_BUFFER_SIZE>,
    // the tree structure, kept apart so that a mutable ebr handle can
    // coexist with shared references to it
    inner: Arc<Inner<K, ORDER>>,
    // an eventually consistent, lagging count of the number of items
    len: Arc<AtomicUsize>,
    // values only travel through nodes as raw bits
    values: PhantomData<fn(V) -> V>,
}

impl<K, V, const ORDER: usize, const LOCAL_GC_BUFFER_SIZE: usize> fmt::Debug
    for Tree<K, V, ORDER, LOCAL_GC_BUFFER_SIZE>
where
    K: Key,
    V: Value,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("len", &self.len())
            .field("key_search", &self.key_search())
            .finish_non_exhaustive()
    }
}

impl<K, V, const ORDER: usize, const LOCAL_GC_BUFFER_SIZE: usize> Default
    for Tree<K, V, ORDER, LOCAL_GC_BUFFER_SIZE>
where
    K: Key,
    V: Value,
{
    fn default() -> Tree<K, V, ORDER, LOCAL_GC_BUFFER_SIZE> {
        Tree::with_key_search(KeySearch::detect())
    }
}

struct Inner<K, const ORDER: usize> {
    root: AtomicPtr<Node<K, ORDER>>,
    // serializes writers; readers never touch it
    writer: Mutex<()>,
    key_search: KeySearch,
    #[cfg(feature = "timing")]
    slowest_op: AtomicU64,
    #[cfg(feature = "timing")]
    fastest_op: AtomicU64,
}

impl<K, const ORDER: usize> Drop for Inner<K, ORDER> {
    fn drop(&mut self) {
        #[cfg(feature = "timing")]
        self.print_timing();

        let root = *self.root.get_mut();
        if !root.is_null() {
            // SAFETY: this is the last handle, so no guard can reach
            // any of these nodes any more.
            unsafe { drop_subtree(root) };
        }
    }
}

#[cfg(feature = "timing")]
impl<K, const ORDER: usize> Inner<K, ORDER> {
    fn print_timing(&self) {
        println!(
            "min : {:?}",
            Duration::from_nanos(self.fastest_op.load(Ordering::Acquire))
        );
        println!(
            "max : {:?}",
            Duration::from_nanos(self.slowest_op.load(Ordering::Acquire))
        );
    }

    fn record_timing(&self, time: Duration) {
        let nanos = time.as_nanos() as u64;
        let min = self.fastest_op.load(Ordering::Relaxed);
        if nanos < min {
            self.fastest_op.fetch_min(nanos, Ordering::Relaxed);
        }

        let max = self.slowest_op.load(Ordering::Relaxed);
        if nanos > max {
            self.slowest_op.fetch_max(nanos, Ordering::Relaxed);
        }
    }
}

impl<K, V, const ORDER: usize, const LOCAL_GC_BUFFER_SIZE: usize>
    Tree<K, V, ORDER, LOCAL_GC_BUFFER_SIZE>
where
    K: Key,
    V: Value,
{
    /// Builds a tree that uses the requested key search strategy.
    ///
    /// The request is downgraded to [`KeySearch::Scalar`] when the CPU
    /// lacks the required features, or when `ORDER - 1` keys of `K` do
    /// not fill a whole number of 32-byte tiles. [`Tree::key_search`]
    /// reports what the tree settled on.
    ///
    /// # Examples
    ///
    /// ```
    /// use cow_btree::{KeySearch, Tree};
    ///
    /// // sixteen one-byte keys fall short of a full tile, so this
    /// // tree quietly runs the scalar comparator
    /// let tree = Tree::<i8, u64, 17>::with_key_search(KeySearch::Avx2);
    /// assert_eq!(tree.key_search(), KeySearch::Scalar);
    /// ```
    pub fn with_key_search(requested: KeySearch) -> Tree<K, V, ORDER, LOCAL_GC_BUFFER_SIZE> {
        assert!(ORDER > 3, "Tree ORDER must be greater than 3");
        assert!(
            ORDER <= 1 << 16,
            "Tree ORDER must fit node occupancy counts in 16 bits"
        );
        assert!(
            LOCAL_GC_BUFFER_SIZE > 0,
            "LOCAL_GC_BUFFER_SIZE must be greater than 0"
        );

        let tiled = (ORDER - 1) * size_of::<K>() % 32 == 0;
        let key_search =
            if requested == KeySearch::Avx2 && tiled && KeySearch::detect() == KeySearch::Avx2 {
                KeySearch::Avx2
            } else {
                KeySearch::Scalar
            };

        Tree {
            ebr: Ebr::default(),
            inner: Arc::new(Inner {
                root: AtomicPtr::new(std::ptr::null_mut()),
                writer: Mutex::new(()),
                key_search,
                #[cfg(feature = "timing")]
                slowest_op: u64::MIN.into(),
                #[cfg(feature = "timing")]
                fastest_op: u64::MAX.into(),
            }),
            len: Arc::new(0.into()),
            values: PhantomData,
        }
    }

    /// The key comparison strategy this tree settled on.
    pub fn key_search(&self) -> KeySearch {
        self.inner.key_search
    }

    /// Atomically get the value associated with this key.
    ///
    /// # Examples
    ///
    /// ```
    /// let tree = cow_btree::Tree::<i64, u64>::default();
    ///
    /// tree.insert(1, 1);
    ///
    /// assert_eq!(tree.get(0), None);
    /// assert_eq!(tree.get(1), Some(1));
    /// ```
    pub fn get(&self, key: K) -> Option<V> {
        #[cfg(feature = "timing")]
        let before = Instant::now();

        let _guard = self.ebr.pin();
        let key_search = self.inner.key_search;

        debug_delay();
        let mut ptr = self.inner.root.load(Ordering::Acquire);
        let mut ret = None;

        while !ptr.is_null() {
            // SAFETY: the pinned guard keeps every node that was
            // published when we loaded its pointer alive.
            let node = unsafe { &*ptr };
            let i = node.find(key, key_search);
            if node.is_leaf() {
                if i < node.len() && node.key(i) == key {
                    debug_delay();
                    ret = Some(V::from_bits(node.values()[i].load(Ordering::Acquire)));
                }
                break;
            }
            // an equal separator sends us right, where the key lives
            let child_i = if i < node.len() && node.key(i) == key {
                i + 1
            } else {
                i
            };
            debug_delay();
            ptr = node.children()[child_i].load(Ordering::Acquire);
        }

        #[cfg(feature = "timing")]
        self.inner.record_timing(before.elapsed());

        ret
    }

    /// Atomically insert a key-value pair into the tree, returning the
    /// previous value associated with this key if one existed.
    ///
    /// Writers take turns behind an internal lock; readers are never
    /// blocked by an insert.
    ///
    /// # Examples
    ///
    /// ```
    /// let tree = cow_btree::Tree::<i64, u64>::default();
    ///
    /// assert_eq!(tree.insert(1, 1), None);
    /// assert_eq!(tree.insert(1, 2), Some(1));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        #[cfg(feature = "timing")]
        let before = Instant::now();

        let mut guard = self.ebr.pin();
        let _writer = self.inner.writer.lock();

        let bits = value.to_bits();
        let key_search = self.inner.key_search;
        let mut retired: Retired<K, ORDER> = SmallVec::new();

        debug_delay();
        let root_ptr = self.inner.root.load(Ordering::Acquire);

        let prev = if root_ptr.is_null() {
            debug_log!("installing the first root leaf");
            let mut leaf = Node::<K, ORDER>::new_leaf();
            leaf.leaf_insert(key, bits, key_search);
            debug_delay();
            self.inner
                .root
                .store(Box::into_raw(leaf), Ordering::Release);
            None
        } else {
            // SAFETY: we hold the writer lock, so nothing can retire
            // this node while we look at it.
            let root = unsafe { &*root_ptr };
            if root.is_full() {
                debug_log!("root is full, growing the tree by one level");
                let mut grown = Node::<K, ORDER>::new_index();
                let median = grown.split_child(0, root);
                retired.push(root_ptr);
                let steer = usize::from(key >= median);
                let half_ptr = *grown.children_mut()[steer].get_mut();
                // SAFETY: the halves were created by the split above
                // and are not yet published; we own them outright.
                let half = unsafe { &mut *half_ptr };
                let ret = Self::insert_private(half, key, bits, key_search, &mut retired);
                debug_delay();
                self.inner
                    .root
                    .store(Box::into_raw(grown), Ordering::Release);
                ret
            } else {
                self.insert_published(&self.inner.root, key, bits, &mut retired)
            }
        };

        if !retired.is_empty() {
            trace_log!("retiring {} superseded nodes", retired.len());
        }
        for ptr in retired {
            // SAFETY: the splice above made these nodes unreachable for
            // new readers; the guard delays reuse until pinned readers
            // have moved on.
            let superseded: Box<Node<K, ORDER>> = unsafe { Box::from_raw(ptr) };
            guard.defer_drop(superseded);
        }

        if prev.is_none() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "timing")]
        self.inner.record_timing(before.elapsed());

        prev.map(V::from_bits)
    }

    /// Descends through published, non-full nodes. The first node that
    /// has to change is rebuilt privately and spliced in with a single
    /// store to `slot`; everything above it stays untouched.
    fn insert_published(
        &self,
        slot: &AtomicPtr<Node<K, ORDER>>,
        key: K,
        bits: u64,
        retired: &mut Retired<K, ORDER>,
    ) -> Option<u64> {
        let key_search = self.inner.key_search;
        debug_delay();
        let node_ptr = slot.load(Ordering::Acquire);
        // SAFETY: published nodes stay alive at least until every guard
        // pinned before their retirement is gone; ours is pinned.
        let node = unsafe { &*node_ptr };
        debug_assert!(!node.is_full());

        if node.is_leaf() {
            let i = node.find(key, key_search);
            if i < node.len() && node.key(i) == key {
                // Overwrites never reshape a leaf. Swapping the value
                // slot in place is already atomic for readers.
                debug_delay();
                return Some(node.values()[i].swap(bits, Ordering::AcqRel));
            }
            let mut replacement = Box::new(node.clone());
            replacement.leaf_insert(key, bits, key_search);
            debug_delay();
            slot.store(Box::into_raw(replacement), Ordering::Release);
            retired.push(node_ptr);
            return None;
        }

        let i = node.find(key, key_search);
        let child_i = if i < node.len() && node.key(i) == key {
            i + 1
        } else {
            i
        };
        let child_slot = &node.children()[child_i];
        debug_delay();
        let child_ptr = child_slot.load(Ordering::Acquire);
        // SAFETY: as above; the child is published and guard-protected.
        let child = unsafe { &*child_ptr };

        if !child.is_full() {
            return self.insert_published(child_slot, key, bits, retired);
        }

        // The child must split, which changes this node's key set too.
        // Clone this node as the splice point, split the child into
        // fresh halves inside the clone, finish the descent on private
        // nodes, and publish the whole rebuilt subtree at once.
        let mut replacement = Box::new(node.clone());
        let median = replacement.split_child(child_i, child);
        retired.push(child_ptr);
        let steer = child_i + usize::from(key >= median);
        let half_ptr = *replacement.children_mut()[steer].get_mut();
        // SAFETY: the halves were created by the split above and are
        // not yet published; we own them outright.
        let half = unsafe { &mut *half_ptr };
        let ret = Self::insert_private(half, key, bits, key_search, retired);
        debug_delay();
        slot.store(Box::into_raw(replacement), Ordering::Release);
        retired.push(node_ptr);
        ret
    }

    /// Continues an insert below the splice point. Every published node
    /// the descent still has to change is split into fresh halves or
    /// path-copied before it is touched; nothing here is visible to
    /// readers until the caller publishes the splice point.
    fn insert_private(
        node: &mut Node<K, ORDER>,
        key: K,
        bits: u64,
        key_search: KeySearch,
        retired: &mut Retired<K, ORDER>,
    ) -> Option<u64> {
        if node.is_leaf() {
            return node.leaf_insert(key, bits, key_search);
        }

        let i = node.find(key, key_search);
        let child_i = if i < node.len() && node.key(i) == key {
            i + 1
        } else {
            i
        };
        let child_ptr = *node.children_mut()[child_i].get_mut();
        // SAFETY: children of a private node are either published nodes
        // kept alive by our guard, or fresh halves we own.
        let child = unsafe { &*child_ptr };

        if child.is_full() {
            let median = node.split_child(child_i, child);
            retired.push(child_ptr);
            let steer = child_i + usize::from(key >= median);
            let half_ptr = *node.children_mut()[steer].get_mut();
            // SAFETY: fresh halves are unpublished and exclusively ours.
            let half = unsafe { &mut *half_ptr };
            return Self::insert_private(half, key, bits, key_search, retired);
        }

        let copy_ptr = Box::into_raw(Box::new(child.clone()));
        *node.children_mut()[child_i].get_mut() = copy_ptr;
        retired.push(child_ptr);
        // SAFETY: the path copy is unpublished and exclusively ours.
        let copy = unsafe { &mut *copy_ptr };
        Self::insert_private(copy, key, bits, key_search, retired)
    }

    /// A **lagging**, eventually-consistent length count. It is not
    /// updated atomically with [`Tree::insert`], but shortly after the
    /// insert's splice completes.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// A **lagging**, eventually-consistent check for emptiness, based
    /// on the correspondingly non-atomic `len` method.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const fn _test_impls() {
    const fn send<T: Send>() {}
    const fn clone<T: Clone>() {}
    send::<Tree<i64, u64>>();
    clone::<Tree<i64, u64>>();
}

#[cfg(test)]
impl<K, V, const ORDER: usize, const LOCAL_GC_BUFFER_SIZE: usize>
    Tree<K, V, ORDER, LOCAL_GC_BUFFER_SIZE>
where
    K: Key + fmt::Debug,
    V: Value,
{
    /// Walks the whole tree and asserts its structural invariants:
    /// strictly sorted keys, sentinel padding, key range bounds, child
    /// counts, and a uniform leaf depth.
    fn check_invariants(&self) {
        fn walk<K: Key + fmt::Debug, const ORDER: usize>(
            node: &Node<K, ORDER>,
            lo: Option<K>,
            hi: Option<K>,
            depth: usize,
            leaf_depth: &mut Option<usize>,
        ) {
            assert!(node.len() >= 1, "node with no keys");
            assert!(node.len() <= Node::<K, ORDER>::MAX_KEYS);
            for i in 1..node.len() {
                assert!(
                    node.key(i - 1) < node.key(i),
                    "keys out of order at slot {i}"
                );
            }
            for i in node.len()..ORDER {
                assert_eq!(node.key(i), K::MAX, "slot {i} lost its sentinel");
            }
            if let Some(bound) = lo {
                assert!(node.key(0) >= bound, "key below its subtree bound");
            }
            if let Some(bound) = hi {
                assert!(
                    node.key(node.len() - 1) < bound,
                    "key above its subtree bound"
                );
            }

            if node.is_leaf() {
                if let Some(expected) = *leaf_depth {
                    assert_eq!(depth, expected, "leaves at differing depths");
                } else {
                    *leaf_depth = Some(depth);
                }
            } else {
                for i in 0..=node.len() {
                    let child = node.children()[i].load(Ordering::Acquire);
                    assert!(!child.is_null(), "live child slot {i} is null");
                    let child_lo = if i == 0 { lo } else { Some(node.key(i - 1)) };
                    let child_hi = if i == node.len() {
                        hi
                    } else {
                        Some(node.key(i))
                    };
                    // SAFETY: test-only walk while the tree is quiescent.
                    unsafe { walk(&*child, child_lo, child_hi, depth + 1, leaf_depth) };
                }
                for i in node.len() + 1..ORDER {
                    assert!(
                        node.children()[i].load(Ordering::Acquire).is_null(),
                        "stale pointer in dormant child slot {i}"
                    );
                }
            }
        }

        let root = self.inner.root.load(Ordering::Acquire);
        if root.is_null() {
            return;
        }
        let mut leaf_depth = None;
        // SAFETY: test-only walk while the tree is quiescent.
        unsafe { walk(&*root, None, None, 0, &mut leaf_depth) };
    }
}

#[test]
fn basic_tree() {
    let tree = Tree::<i64, u64>::default();
    assert!(tree.is_empty());
    assert_eq!(tree.get(0), None);

    let n = 999;
    for i in 0..=n {
        assert_eq!(tree.get(i), None);
        assert_eq!(tree.insert(i, i as u64), None);
        assert_eq!(tree.get(i), Some(i as u64), "failed to get key {i}");
    }

    assert!(!tree.is_empty());
    assert_eq!(tree.len(), usize::try_from(n).unwrap() + 1);
    for i in 0..=n {
        assert_eq!(tree.get(i), Some(i as u64), "failed to get key {i}");
    }
    assert_eq!(tree.get(n + 1), None);
    tree.check_invariants();
}

#[test]
fn first_split_shape() {
    let tree = Tree::<i32, u64, 5>::default();
    for i in 1..=5 {
        tree.insert(i, i as u64);
    }

    // five sequential inserts at this fan-out force exactly one split
    let root = unsafe { &*tree.inner.root.load(Ordering::Acquire) };
    assert!(!root.is_leaf());
    assert_eq!(root.len(), 1);
    let left = unsafe { &*root.children()[0].load(Ordering::Acquire) };
    let right = unsafe { &*root.children()[1].load(Ordering::Acquire) };
    assert!(left.is_leaf());
    assert!(right.is_leaf());
    assert!(left.len() >= 2);
    assert!(right.len() >= 2);
    tree.check_invariants();
}

#[test]
fn overwrites_keep_len_stable() {
    let tree = Tree::<i32, u32, 5>::default();
    for i in 0..100 {
        assert_eq!(tree.insert(i, 1), None);
    }
    for i in 0..100 {
        assert_eq!(tree.insert(i, 2), Some(1), "overwrite of key {i}");
    }
    assert_eq!(tree.len(), 100);
    for i in 0..100 {
        assert_eq!(tree.get(i), Some(2));
    }
    tree.check_invariants();
}

#[test]
fn split_routes_equal_keys_right() {
    // Overwriting the key that is about to be promoted exercises the
    // split-then-descend path: the write must land in the right half,
    // which retains the promoted key.
    let tree = Tree::<i32, u64, 5>::default();
    for i in 1..=4 {
        assert_eq!(tree.insert(i, i as u64), None);
    }
    // the root leaf is now full and 3 is about to become the separator
    assert_eq!(tree.insert(3, 33), Some(3));
    assert_eq!(tree.len(), 4);
    for (key, want) in [(1, 1), (2, 2), (3, 33), (4, 4)] {
        assert_eq!(tree.get(key), Some(want));
    }
    tree.check_invariants();
}

#[test]
fn maximum_key_is_usable() {
    // The padding sentinel is not a reserved value: the occupancy
    // bound keeps real maximum keys and padding apart.
    let tree = Tree::<i32, u64, 5>::default();
    assert_eq!(tree.insert(i32::MAX, 1), None);
    for i in 0..50 {
        assert_eq!(tree.insert(i, 2), None);
    }
    assert_eq!(tree.get(i32::MAX), Some(1));
    assert_eq!(tree.insert(i32::MAX, 3), Some(1));
    assert_eq!(tree.get(i32::MAX), Some(3));
    assert_eq!(tree.len(), 51);
    tree.check_invariants();
}

#[test]
fn deep_trees_stay_ordered() {
    let tree = Tree::<i64, i64, 5>::default();
    let n = 500_i64;
    // a multiplicative stride visits keys in a scattered order
    for i in 0..n {
        let key = (i * 389) % 1009;
        assert_eq!(tree.insert(key, key * 2), None);
    }
    for i in 0..n {
        let key = (i * 389) % 1009;
        assert_eq!(tree.get(key), Some(key * 2));
    }
    assert_eq!(tree.len(), 500);
    tree.check_invariants();
}

#[test]
fn descending_inserts() {
    let tree = Tree::<i32, u32, 5>::default();
    for i in (0..200).rev() {
        assert_eq!(tree.insert(i, i as u32), None);
    }
    for i in 0..200 {
        assert_eq!(tree.get(i), Some(i as u32));
    }
    tree.check_invariants();
}

#[test]
fn narrow_keys_fall_back_to_scalar() {
    let tree = Tree::<i8, u64, 17>::with_key_search(KeySearch::Avx2);
    assert_eq!(tree.key_search(), KeySearch::Scalar);

    for i in i8::MIN..=i8::MAX {
        assert_eq!(tree.insert(i, i as u64), None);
    }
    for i in i8::MIN..=i8::MAX {
        assert_eq!(tree.get(i), Some(i as u64));
    }
    assert_eq!(tree.len(), 256);
    tree.check_invariants();
}

#[test]
fn detected_search_is_kept_for_tiled_layouts() {
    // sixteen 4-byte keys fill exactly two tiles, so the detected
    // strategy sticks
    let tree = Tree::<i32, u64>::default();
    assert_eq!(tree.key_search(), KeySearch::detect());
}

#[test]
fn clones_share_the_tree() {
    let handle = Tree::<i64, u64>::default();
    let sibling = handle.clone();
    handle.insert(1, 10);
    assert_eq!(sibling.get(1), Some(10));
    sibling.insert(2, 20);
    assert_eq!(handle.get(2), Some(20));
    assert_eq!(handle.len(), 2);
}

#[test]
fn timing_tree() {
    use std::time::Instant;

    let tree = Tree::<i64, u64>::default();

    let n = 1024 * 1024_i64;

    let insert = Instant::now();
    for i in 0..n {
        tree.insert(i, i as u64);
    }
    let insert_elapsed = insert.elapsed();
    println!(
        "{} inserts/s, total {:?}",
        (n * 1_000_000) / i64::try_from(insert_elapsed.as_micros().max(1)).unwrap_or(i64::MAX),
        insert_elapsed
    );

    let gets = Instant::now();
    for i in 0..n {
        tree.get(i);
    }
    let gets_elapsed = gets.elapsed();
    println!(
        "{} gets/s, total {:?}",
        (n * 1_000_000) / i64::try_from(gets_elapsed.as_micros().max(1)).unwrap_or(i64::MAX),
        gets_elapsed
    );
}
