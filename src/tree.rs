//! A Merkleized AVL tree: a balanced binary search tree whose every node is
//! content-addressed by a cryptographic hash, giving each version of the key
//! set a single root hash that commits to all of its contents.
//!
//! All data lives in the leaves; inner nodes route lookups through a
//! partition key (the smallest key of their right subtree) and commit to
//! their children's hashes. Mutation is copy-on-write: `set` and `delete`
//! build a fresh spine of nodes that shares every unchanged subtree with the
//! previous version, and only swap the root pointer once the new spine is
//! fully constructed and hashed. A failed operation therefore leaves the
//! tree exactly as it was.
//!
//! Saved nodes are written to a [`KvStore`] under their content hash, one
//! record per hash, so structurally identical subtrees are stored once no
//! matter how many roots reference them. Loading attaches to a root hash
//! without reading anything beyond the root record; children are fetched
//! lazily on first touch.
//!
//! One handle is a single-writer structure. Persisted nodes are immutable,
//! so any number of handles over saved roots may read concurrently.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use digest::Digest;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::node::{empty_root_hash, leaf_hash, Child, InnerNode, LeafNode, Node, EMPTY_TAG};
use crate::prelude::{FromBytes, ToBytes};
use crate::proof::{Proof, ProofStep, Side};
use crate::store::KvStore;

pub struct Tree<D: Digest> {
    root: Option<Child>,
    size: i64,
    store: Option<Arc<dyn KvStore>>,
    _digest: PhantomData<D>,
}

/// Outcome of removing a key from a subtree.
enum Removed {
    /// The key is not in this subtree.
    Absent,
    /// This node was the matching leaf; the parent collapses into the
    /// sibling.
    Leaf(Vec<u8>),
    /// The subtree was rebuilt without the key. `first` carries the new
    /// smallest key of a right subtree so ancestors can fix their partition
    /// keys.
    Subtree {
        child: Child,
        first: Option<Vec<u8>>,
        value: Vec<u8>,
    },
}

impl<D: Digest> Tree<D> {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            root: None,
            size: 0,
            store: Some(store),
            _digest: PhantomData,
        }
    }

    /// A tree without a backing store. Everything stays in memory;
    /// [`Tree::save`] and [`Tree::load`] report [`Error::NoStore`].
    pub fn detached() -> Self {
        Self {
            root: None,
            size: 0,
            store: None,
            _digest: PhantomData,
        }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Root hash of the current version. The empty tree hashes to the fixed
    /// sentinel from [`empty_root_hash`], not to a zero hash.
    pub fn hash(&self) -> Hash {
        match &self.root {
            None => Self::empty_hash(),
            Some(child) => child.hash(),
        }
    }

    pub fn empty_hash() -> Hash {
        empty_root_hash::<D>()
    }

    /// Inserts or updates `key`, returning whether it already existed.
    ///
    /// An update replaces the leaf and reseals the path to the root without
    /// rebalancing; an insert splits a leaf and rebalances every ancestor
    /// bottom-up. Rotation choice is the classic AVL rule and depends only
    /// on the shape of the subtree at hand: a balance factor above 1 takes a
    /// single right rotation when the left child's factor is non-negative
    /// and a left-right double rotation otherwise, mirrored for the right
    /// side.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        let root = match &self.root {
            None => {
                self.root = Some(Self::seal(Node::new_leaf(key, value)));
                self.size = 1;
                return Ok(false);
            }
            Some(child) => child.clone(),
        };
        let (node, updated) = self.set_rec(&root, key, value)?;
        self.root = Some(Self::seal(node));
        if !updated {
            self.size += 1;
        }
        Ok(updated)
    }

    /// Looks up `key`, returning its in-order rank and value.
    ///
    /// The rank counts the keys smaller than `key`; for an absent key it is
    /// the position the key would be inserted at. Missing children are
    /// loaded from the store for the duration of the call only, so lookups
    /// never mutate the handle.
    pub fn get(&self, key: &[u8]) -> Result<(i64, Option<Vec<u8>>)> {
        let root = match &self.root {
            None => return Ok((0, None)),
            Some(child) => child,
        };
        let node = self.resolve(root)?;
        self.get_at(&node, key)
    }

    /// Removes `key`, returning its value and whether anything was removed.
    /// Removing a key that is not present is a no-op, not an error.
    pub fn delete(&mut self, key: &[u8]) -> Result<(Option<Vec<u8>>, bool)> {
        let root = match &self.root {
            None => return Ok((None, false)),
            Some(child) => child.clone(),
        };
        match self.remove_rec(&root, key)? {
            Removed::Absent => Ok((None, false)),
            Removed::Leaf(value) => {
                self.root = None;
                self.size = 0;
                Ok((Some(value), true))
            }
            Removed::Subtree { child, value, .. } => {
                self.root = Some(child);
                self.size -= 1;
                Ok((Some(value), true))
            }
        }
    }

    /// Writes every node of the current version that is not yet in the
    /// store, as one atomic batch, and returns the root hash.
    ///
    /// Nodes are collected post-order and existence-checked by hash first,
    /// so a record shared with any previously saved version is never written
    /// twice. Saving an already persisted tree writes nothing.
    pub fn save(&mut self) -> Result<Hash> {
        let store = self.store.clone().ok_or(Error::NoStore)?;
        let root = match &self.root {
            None => {
                let hash = Self::empty_hash();
                if store.get(hash.as_ref())?.is_none() {
                    store.set(hash.as_ref(), &[EMPTY_TAG])?;
                }
                return Ok(hash);
            }
            Some(child) => child.clone(),
        };
        let mut batch = Vec::new();
        Self::collect_unsaved(store.as_ref(), &root, &mut batch)?;
        if !batch.is_empty() {
            store.write_batch(&batch)?;
        }
        self.root = Some(Self::mark_persisted(&root));
        Ok(root.hash())
    }

    /// Attaches this handle to a previously saved root hash.
    ///
    /// Only the root record is read; everything below stays on disk until a
    /// traversal touches it. A hash with no record fails with
    /// [`Error::NotFound`].
    pub fn load(&mut self, root: Hash) -> Result<()> {
        if root == Self::empty_hash() {
            self.root = None;
            self.size = 0;
            return Ok(());
        }
        let node = self.load_node(root)?;
        self.size = node.size();
        self.root = Some(Child::Node(root, Arc::new(node)));
        Ok(())
    }

    /// Builds a membership proof for `key`, or `None` when absent.
    pub fn proof(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Proof)>> {
        let root = match &self.root {
            None => return Ok(None),
            Some(child) => child.clone(),
        };
        let mut steps = Vec::new();
        let value = match self.proof_rec(&root, key, &mut steps)? {
            None => return Ok(None),
            Some(value) => value,
        };
        let proof = Proof {
            leaf_hash: leaf_hash::<D>(key, &value),
            root_hash: root.hash(),
            steps,
        };
        Ok(Some((value, proof)))
    }

    /// In-order traversal of every `(key, value)` in `[start, end)`, where
    /// an empty `end` means unbounded. The callback returns true to stop;
    /// the return value reports whether it did.
    pub fn iterate_range(
        &self,
        start: &[u8],
        end: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<bool> {
        match &self.root {
            None => Ok(false),
            Some(child) => self.iterate_rec(child, start, end, f),
        }
    }

    fn set_rec(&self, child: &Child, key: &[u8], value: &[u8]) -> Result<(Node, bool)> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Leaf(leaf) => Ok(match key.cmp(leaf.key.as_slice()) {
                Ordering::Equal => (Node::new_leaf(key, value), true),
                Ordering::Less => (
                    Node::Inner(InnerNode {
                        key: leaf.key.clone(),
                        height: 1,
                        size: 2,
                        left: Self::seal(Node::new_leaf(key, value)),
                        right: child.clone(),
                        persisted: false,
                    }),
                    false,
                ),
                Ordering::Greater => (
                    Node::Inner(InnerNode {
                        key: key.to_vec(),
                        height: 1,
                        size: 2,
                        left: child.clone(),
                        right: Self::seal(Node::new_leaf(key, value)),
                        persisted: false,
                    }),
                    false,
                ),
            }),
            Node::Inner(inner) => {
                let mut next = inner.working_copy();
                let updated = if key < inner.key.as_slice() {
                    let (new_left, updated) = self.set_rec(&inner.left, key, value)?;
                    next.left = Self::seal(new_left);
                    updated
                } else {
                    let (new_right, updated) = self.set_rec(&inner.right, key, value)?;
                    next.right = Self::seal(new_right);
                    updated
                };
                if updated {
                    // value swap: shape, height and size are unchanged
                    return Ok((Node::Inner(next), true));
                }
                self.update_height_and_size(&mut next)?;
                let next = self.balance(next)?;
                Ok((Node::Inner(next), false))
            }
        }
    }

    fn get_at(&self, node: &Node, key: &[u8]) -> Result<(i64, Option<Vec<u8>>)> {
        match node {
            Node::Leaf(leaf) => Ok(match leaf.key.as_slice().cmp(key) {
                Ordering::Equal => (0, Some(leaf.value.clone())),
                Ordering::Less => (1, None),
                Ordering::Greater => (0, None),
            }),
            Node::Inner(inner) => {
                if key < inner.key.as_slice() {
                    let left = self.resolve(&inner.left)?;
                    self.get_at(&left, key)
                } else {
                    let right = self.resolve(&inner.right)?;
                    let (index, value) = self.get_at(&right, key)?;
                    Ok((index + inner.size - right.size(), value))
                }
            }
        }
    }

    fn remove_rec(&self, child: &Child, key: &[u8]) -> Result<Removed> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Leaf(leaf) => Ok(if leaf.key.as_slice() == key {
                Removed::Leaf(leaf.value.clone())
            } else {
                Removed::Absent
            }),
            Node::Inner(inner) => {
                if key < inner.key.as_slice() {
                    match self.remove_rec(&inner.left, key)? {
                        Removed::Absent => Ok(Removed::Absent),
                        Removed::Leaf(value) => Ok(Removed::Subtree {
                            child: inner.right.clone(),
                            first: Some(inner.key.clone()),
                            value,
                        }),
                        Removed::Subtree {
                            child: new_left,
                            first,
                            value,
                        } => {
                            let mut next = inner.working_copy();
                            next.left = new_left;
                            self.update_height_and_size(&mut next)?;
                            let next = self.balance(next)?;
                            Ok(Removed::Subtree {
                                child: Self::seal(Node::Inner(next)),
                                first,
                                value,
                            })
                        }
                    }
                } else {
                    match self.remove_rec(&inner.right, key)? {
                        Removed::Absent => Ok(Removed::Absent),
                        Removed::Leaf(value) => Ok(Removed::Subtree {
                            child: inner.left.clone(),
                            first: None,
                            value,
                        }),
                        Removed::Subtree {
                            child: new_right,
                            first,
                            value,
                        } => {
                            let mut next = inner.working_copy();
                            next.right = new_right;
                            if let Some(first) = first {
                                // the right subtree lost its smallest key
                                next.key = first;
                            }
                            self.update_height_and_size(&mut next)?;
                            let next = self.balance(next)?;
                            Ok(Removed::Subtree {
                                child: Self::seal(Node::Inner(next)),
                                first: None,
                                value,
                            })
                        }
                    }
                }
            }
        }
    }

    fn proof_rec(
        &self,
        child: &Child,
        key: &[u8],
        steps: &mut Vec<ProofStep>,
    ) -> Result<Option<Vec<u8>>> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Leaf(leaf) => Ok(if leaf.key.as_slice() == key {
                Some(leaf.value.clone())
            } else {
                None
            }),
            Node::Inner(inner) => {
                // steps are pushed on the way back up, leaf first
                if key < inner.key.as_slice() {
                    let found = self.proof_rec(&inner.left, key, steps)?;
                    if found.is_some() {
                        steps.push(ProofStep {
                            side: Side::Right,
                            height: inner.height,
                            size: inner.size,
                            sibling: inner.right.hash(),
                        });
                    }
                    Ok(found)
                } else {
                    let found = self.proof_rec(&inner.right, key, steps)?;
                    if found.is_some() {
                        steps.push(ProofStep {
                            side: Side::Left,
                            height: inner.height,
                            size: inner.size,
                            sibling: inner.left.hash(),
                        });
                    }
                    Ok(found)
                }
            }
        }
    }

    fn iterate_rec(
        &self,
        child: &Child,
        start: &[u8],
        end: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<bool> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Leaf(leaf) => Ok(if leaf.key.as_slice() >= start && before_end(&leaf.key, end) {
                f(&leaf.key, &leaf.value)
            } else {
                false
            }),
            Node::Inner(inner) => {
                // left subtree holds keys below the partition key, right
                // subtree the partition key and above
                if start < inner.key.as_slice() && self.iterate_rec(&inner.left, start, end, f)? {
                    return Ok(true);
                }
                if before_end(&inner.key, end) {
                    self.iterate_rec(&inner.right, start, end, f)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Finishes a freshly built node: computes its content hash and freezes
    /// it behind an `Arc`. Children of a node being sealed are always
    /// already sealed themselves.
    fn seal(node: Node) -> Child {
        let hash = node.hash::<D>();
        Child::Node(hash, Arc::new(node))
    }

    fn resolve<'a>(&self, child: &'a Child) -> Result<Cow<'a, Node>> {
        match child {
            Child::Node(_, node) => Ok(Cow::Borrowed(node)),
            Child::Hash(hash) => Ok(Cow::Owned(self.load_node(*hash)?)),
        }
    }

    fn load_node(&self, hash: Hash) -> Result<Node> {
        let store = self.store.as_ref().ok_or(Error::NoStore)?;
        let bytes = store.get(hash.as_ref())?.ok_or(Error::NotFound(hash))?;
        Node::from_bytes(&bytes)
    }

    /// Loads `child` into memory in place, caching it for the rest of the
    /// operation. Only ever called on working copies, never on nodes shared
    /// with an older version.
    fn hydrate<'a>(&self, child: &'a mut Child) -> Result<&'a Node> {
        if let Child::Hash(hash) = *child {
            *child = Child::Node(hash, Arc::new(self.load_node(hash)?));
        }
        match child {
            Child::Node(_, node) => Ok(node),
            Child::Hash(_) => unreachable!("hydrate replaced the hash variant above"),
        }
    }

    fn update_height_and_size(&self, node: &mut InnerNode) -> Result<()> {
        let (left_height, left_size) = {
            let left = self.hydrate(&mut node.left)?;
            (left.height(), left.size())
        };
        let (right_height, right_size) = {
            let right = self.hydrate(&mut node.right)?;
            (right.height(), right.size())
        };
        node.height = 1 + left_height.max(right_height);
        node.size = left_size + right_size;
        Ok(())
    }

    fn balance_factor(&self, node: &mut InnerNode) -> Result<i32> {
        let left_height = self.hydrate(&mut node.left)?.height();
        let right_height = self.hydrate(&mut node.right)?.height();
        Ok(left_height - right_height)
    }

    /// Restores the AVL balance of a node whose children are already
    /// balanced, after one insertion or removal below it.
    fn balance(&self, mut node: InnerNode) -> Result<InnerNode> {
        let factor = self.balance_factor(&mut node)?;
        if factor > 1 {
            let mut left = self.inner_working_copy(&node.left)?;
            if self.balance_factor(&mut left)? >= 0 {
                return self.rotate_right(node, left);
            }
            let left_right = self.inner_working_copy(&left.right)?;
            let new_left = self.rotate_left(left, left_right)?;
            return self.rotate_right(node, new_left);
        }
        if factor < -1 {
            let mut right = self.inner_working_copy(&node.right)?;
            if self.balance_factor(&mut right)? <= 0 {
                return self.rotate_left(node, right);
            }
            let right_left = self.inner_working_copy(&right.left)?;
            let new_right = self.rotate_right(right, right_left)?;
            return self.rotate_left(node, new_right);
        }
        Ok(node)
    }

    fn rotate_right(&self, mut node: InnerNode, mut pivot: InnerNode) -> Result<InnerNode> {
        node.left = pivot.right;
        self.update_height_and_size(&mut node)?;
        pivot.right = Self::seal(Node::Inner(node));
        self.update_height_and_size(&mut pivot)?;
        Ok(pivot)
    }

    fn rotate_left(&self, mut node: InnerNode, mut pivot: InnerNode) -> Result<InnerNode> {
        node.right = pivot.left;
        self.update_height_and_size(&mut node)?;
        pivot.left = Self::seal(Node::Inner(node));
        self.update_height_and_size(&mut pivot)?;
        Ok(pivot)
    }

    /// A working copy of a child that is about to pivot in a rotation.
    /// Rotation pivots sit at height 1 or above, so a leaf here means the
    /// stored tree violates the balance invariant.
    fn inner_working_copy(&self, child: &Child) -> Result<InnerNode> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Inner(inner) => Ok(inner.working_copy()),
            Node::Leaf(_) => Err(Error::Corrupt(
                "rotation pivot must be an inner node".to_string(),
            )),
        }
    }

    fn collect_unsaved(
        store: &dyn KvStore,
        child: &Child,
        batch: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        let (hash, node) = match child {
            Child::Hash(_) => return Ok(()),
            Child::Node(hash, node) => (hash, node),
        };
        if node.persisted() {
            return Ok(());
        }
        if let Node::Inner(inner) = node.as_ref() {
            Self::collect_unsaved(store, &inner.left, batch)?;
            Self::collect_unsaved(store, &inner.right, batch)?;
        }
        if store.get(hash.as_ref())?.is_none() {
            batch.push((hash.as_ref().to_vec(), node.to_bytes()));
        }
        Ok(())
    }

    /// Rebuilds the dirty spine with the persisted flag set, sharing
    /// everything that already was. Hashes are copied, never recomputed.
    fn mark_persisted(child: &Child) -> Child {
        match child {
            Child::Hash(hash) => Child::Hash(*hash),
            Child::Node(_, node) if node.persisted() => child.clone(),
            Child::Node(hash, node) => {
                let marked = match node.as_ref() {
                    Node::Leaf(leaf) => Node::Leaf(LeafNode {
                        persisted: true,
                        ..leaf.clone()
                    }),
                    Node::Inner(inner) => Node::Inner(InnerNode {
                        key: inner.key.clone(),
                        height: inner.height,
                        size: inner.size,
                        left: Self::mark_persisted(&inner.left),
                        right: Self::mark_persisted(&inner.right),
                        persisted: true,
                    }),
                };
                Child::Node(*hash, Arc::new(marked))
            }
        }
    }
}

fn before_end(key: &[u8], end: &[u8]) -> bool {
    end.is_empty() || key < end
}

impl<D: Digest> Clone for Tree<D> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            size: self.size,
            store: self.store.clone(),
            _digest: PhantomData,
        }
    }
}

impl<D: Digest> Default for Tree<D> {
    fn default() -> Self {
        Self::detached()
    }
}

impl<D: Digest> PartialEq for Tree<D> {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl<D: Digest> Eq for Tree<D> {}

impl<D: Digest> std::fmt::Debug for Tree<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.hash())
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
impl<D: Digest> Tree<D> {
    /// Full-tree walk asserting the AVL and ordering invariants.
    pub(crate) fn check_invariants(&self) {
        match &self.root {
            None => assert_eq!(self.size, 0),
            Some(root) => {
                let (_, size) = self.check_subtree(root, None, None);
                assert_eq!(size, self.size, "tree size must match the root's");
            }
        }
    }

    fn check_subtree(
        &self,
        child: &Child,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> (i32, i64) {
        let node = self.resolve(child).expect("subtree must be loadable");
        match &*node {
            Node::Leaf(leaf) => {
                if let Some(lower) = lower {
                    assert!(leaf.key.as_slice() >= lower, "leaf key below lower bound");
                }
                if let Some(upper) = upper {
                    assert!(leaf.key.as_slice() < upper, "leaf key at or above upper bound");
                }
                (0, 1)
            }
            Node::Inner(inner) => {
                let (left_height, left_size) =
                    self.check_subtree(&inner.left, lower, Some(&inner.key));
                let (right_height, right_size) =
                    self.check_subtree(&inner.right, Some(&inner.key), upper);
                assert_eq!(inner.height, 1 + left_height.max(right_height));
                assert_eq!(inner.size, left_size + right_size);
                assert!(
                    (left_height - right_height).abs() <= 1,
                    "AVL balance violated at {:?}",
                    inner.key
                );
                (inner.height, inner.size)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    use paste::paste;

    use crate::error::{Error, Result};
    use crate::store::{KvStore, MemoryStore};

    /// A store whose reads can be failed on demand, for exercising error
    /// propagation and mutation atomicity.
    struct FailingStore {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    impl FailingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail: AtomicBool::new(false),
            }
        }

        fn fail_reads(&self, fail: bool) {
            self.fail.store(fail, AtomicOrdering::Relaxed);
        }
    }

    impl KvStore for FailingStore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            if self.fail.load(AtomicOrdering::Relaxed) {
                return Err(Error::StoreIo("injected read failure".to_string()));
            }
            self.inner.get(key)
        }

        fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.set(key, value)
        }

        fn write_batch(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
            self.inner.write_batch(pairs)
        }
    }

    macro_rules! generate_tree_tests {
        ($digest:ty) => {
            paste! {
                #[allow(non_snake_case)]
                mod [<$digest _tests>] {
                    use std::sync::Arc;

                    use proptest::prelude::*;

                    use super::*;
                    use crate::error::Error;
                    use crate::hash::Hash;
                    use crate::kv::KeyValue;
                    use crate::node::leaf_hash;
                    use crate::store::MemoryStore;
                    use crate::testing::kv_pairs;
                    use crate::tree::Tree;

                    type TestTree = Tree<$digest>;

                    fn records(tag: &str, count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
                        (0..count)
                            .map(|i| {
                                (
                                    format!("{}:key:{:02}", tag, i).into_bytes(),
                                    format!("{}:value:{:02}", tag, i).into_bytes(),
                                )
                            })
                            .collect()
                    }

                    #[test]
                    fn test_set_and_get() {
                        let mut tree = TestTree::detached();
                        assert!(!tree.set(b"1", b"one").unwrap());
                        assert!(!tree.set(b"2", b"two").unwrap());
                        assert!(tree.set(b"2", b"TWO").unwrap());
                        assert!(!tree.set(b"5", b"five").unwrap());
                        assert_eq!(tree.size(), 3);

                        let (index, value) = tree.get(&[0x00]).unwrap();
                        assert_eq!((index, value), (0, None));

                        let (index, value) = tree.get(b"1").unwrap();
                        assert_eq!(index, 0);
                        assert_eq!(value.as_deref(), Some(&b"one"[..]));

                        let (index, value) = tree.get(b"2").unwrap();
                        assert_eq!(index, 1);
                        assert_eq!(value.as_deref(), Some(&b"TWO"[..]));

                        let (index, value) = tree.get(b"4").unwrap();
                        assert_eq!((index, value), (2, None));
                    }

                    #[test]
                    fn test_update_keeps_size_and_changes_hash() {
                        let mut tree = TestTree::detached();
                        tree.set(b"a", b"1").unwrap();
                        tree.set(b"b", b"2").unwrap();
                        let before = tree.hash();
                        assert!(tree.set(b"a", b"changed").unwrap());
                        assert_eq!(tree.size(), 2);
                        assert_ne!(tree.hash(), before);
                        assert_eq!(tree.get(b"a").unwrap().1.as_deref(), Some(&b"changed"[..]));
                    }

                    #[test]
                    fn test_empty_keys_are_rejected() {
                        let mut tree = TestTree::detached();
                        assert!(matches!(tree.set(b"", b"v"), Err(Error::InvalidKey)));
                        assert!(tree.is_empty());
                        // absent, not an error, on the read paths
                        assert_eq!(tree.get(b"").unwrap(), (0, None));
                        assert_eq!(tree.delete(b"").unwrap(), (None, false));
                    }

                    #[test]
                    fn test_delete() {
                        let mut tree = TestTree::detached();
                        tree.set(b"a", b"1").unwrap();
                        tree.set(b"b", b"2").unwrap();
                        tree.set(b"c", b"3").unwrap();

                        let (value, removed) = tree.delete(b"b").unwrap();
                        assert!(removed);
                        assert_eq!(value.as_deref(), Some(&b"2"[..]));
                        assert_eq!(tree.size(), 2);
                        assert_eq!(tree.get(b"b").unwrap().1, None);
                        tree.check_invariants();

                        let (value, removed) = tree.delete(b"zzz").unwrap();
                        assert!(!removed);
                        assert!(value.is_none());
                        assert_eq!(tree.size(), 2);

                        tree.delete(b"a").unwrap();
                        tree.delete(b"c").unwrap();
                        assert!(tree.is_empty());
                        assert_eq!(tree.size(), 0);
                        assert_eq!(tree.hash(), TestTree::empty_hash());
                    }

                    #[test]
                    fn test_empty_hash_is_a_sentinel() {
                        assert_ne!(TestTree::empty_hash(), Hash::zero());
                        assert_ne!(TestTree::empty_hash(), leaf_hash::<$digest>(b"", b""));
                    }

                    #[test]
                    fn test_detached_tree_has_no_store() {
                        let mut tree = TestTree::detached();
                        tree.set(b"a", b"1").unwrap();
                        assert!(matches!(tree.save(), Err(Error::NoStore)));
                        assert!(matches!(tree.load(Hash::zero()), Err(Error::NoStore)));
                    }

                    #[test]
                    fn test_load_unknown_root_is_not_found() {
                        let store = Arc::new(MemoryStore::new());
                        let mut tree = TestTree::new(store);
                        let missing = Hash::digest::<$digest>(b"never saved");
                        assert!(matches!(tree.load(missing), Err(Error::NotFound(_))));
                    }

                    #[test]
                    fn test_save_and_load_empty_tree() {
                        let store = Arc::new(MemoryStore::new());
                        let mut tree = TestTree::new(store.clone());
                        let hash = tree.save().unwrap();
                        assert_eq!(hash, TestTree::empty_hash());

                        let mut reloaded = TestTree::new(store);
                        reloaded.load(hash).unwrap();
                        assert!(reloaded.is_empty());
                        assert_eq!(reloaded.size(), 0);
                    }

                    #[test]
                    fn test_persistence_across_versions() {
                        let store = Arc::new(MemoryStore::new());
                        let mut tree = TestTree::new(store.clone());
                        let pairs = records("base", 10);
                        for (key, value) in &pairs {
                            tree.set(key, value).unwrap();
                        }
                        let hash1 = tree.save().unwrap();
                        assert_eq!(hash1, tree.hash());

                        // lazy loading: only the root record is read up front
                        let mut derived = TestTree::new(store.clone());
                        derived.load(hash1).unwrap();
                        assert_eq!(derived.size(), 10);
                        for (key, value) in &pairs {
                            assert_eq!(derived.get(key).unwrap().1.as_deref(), Some(&value[..]));
                        }

                        // overwrite half of the keys in a second version
                        for (key, _) in pairs.iter().take(5) {
                            derived.set(key, b"overwritten").unwrap();
                        }
                        let hash2 = derived.save().unwrap();
                        assert_ne!(hash1, hash2);

                        // the first version is untouched by the second
                        let mut original = TestTree::new(store.clone());
                        original.load(hash1).unwrap();
                        for (key, value) in &pairs {
                            assert_eq!(original.get(key).unwrap().1.as_deref(), Some(&value[..]));
                        }

                        let mut updated = TestTree::new(store);
                        updated.load(hash2).unwrap();
                        for (key, _) in pairs.iter().take(5) {
                            assert_eq!(
                                updated.get(key).unwrap().1.as_deref(),
                                Some(&b"overwritten"[..])
                            );
                        }
                        for (key, value) in pairs.iter().skip(5) {
                            assert_eq!(updated.get(key).unwrap().1.as_deref(), Some(&value[..]));
                        }
                    }

                    #[test]
                    fn test_save_writes_each_node_once() {
                        let store = Arc::new(MemoryStore::new());
                        let mut tree = TestTree::new(store.clone());
                        for (key, value) in records("idem", 8) {
                            tree.set(&key, &value).unwrap();
                        }
                        let hash = tree.save().unwrap();
                        let written = store.len();
                        assert!(written > 0);

                        // a second save of the same version writes nothing
                        assert_eq!(tree.save().unwrap(), hash);
                        assert_eq!(store.len(), written);
                    }

                    #[test]
                    fn test_unchanged_subtrees_are_shared_across_saves() {
                        let store = Arc::new(MemoryStore::new());
                        let mut tree = TestTree::new(store.clone());
                        for (key, value) in records("shared", 16) {
                            tree.set(&key, &value).unwrap();
                        }
                        tree.save().unwrap();
                        let after_first = store.len();

                        // touching one key must not re-store the whole tree
                        tree.set(b"shared:key:00", b"new value").unwrap();
                        tree.save().unwrap();
                        let rewritten = store.len() - after_first;
                        assert!(rewritten >= 1);
                        assert!(
                            (rewritten as i64) <= tree_path_bound(tree.size()),
                            "save rewrote {} records for a single-key change",
                            rewritten
                        );
                    }

                    #[test]
                    fn test_replay_determinism_across_save_boundaries() {
                        let store = Arc::new(MemoryStore::new());
                        let pairs = records("replay", 20);

                        let mut direct = TestTree::new(store.clone());
                        for (key, value) in &pairs {
                            direct.set(key, value).unwrap();
                        }
                        let direct_hash = direct.save().unwrap();

                        let mut first = TestTree::new(store.clone());
                        for (key, value) in pairs.iter().take(10) {
                            first.set(key, value).unwrap();
                        }
                        let middle = first.save().unwrap();

                        let mut second = TestTree::new(store);
                        second.load(middle).unwrap();
                        for (key, value) in pairs.iter().skip(10) {
                            second.set(key, value).unwrap();
                        }
                        assert_eq!(second.save().unwrap(), direct_hash);
                    }

                    #[test]
                    fn test_failed_set_leaves_tree_untouched() {
                        let store = Arc::new(FailingStore::new());
                        let mut tree = TestTree::new(store.clone());
                        for (key, value) in records("atomic", 8) {
                            tree.set(&key, &value).unwrap();
                        }
                        let root = tree.save().unwrap();

                        let mut reloaded = TestTree::new(store.clone());
                        reloaded.load(root).unwrap();

                        store.fail_reads(true);
                        assert!(matches!(
                            reloaded.set(b"atomic:key:03", b"changed"),
                            Err(Error::StoreIo(_))
                        ));
                        assert_eq!(reloaded.hash(), root);
                        assert_eq!(reloaded.size(), 8);

                        store.fail_reads(false);
                        assert!(reloaded.set(b"atomic:key:03", b"changed").unwrap());
                        assert_ne!(reloaded.hash(), root);
                    }

                    #[test_strategy::proptest]
                    fn test_same_history_yields_same_hash(
                        #[strategy(kv_pairs(1..24).prop_shuffle())] pairs: Vec<KeyValue>,
                    ) {
                        let mut a = TestTree::detached();
                        let mut b = TestTree::detached();
                        for kv in &pairs {
                            a.set(&kv.key, &kv.value)?;
                            b.set(&kv.key, &kv.value)?;
                        }
                        prop_assert_eq!(a.hash(), b.hash());
                        prop_assert_eq!(a.size(), b.size());
                    }

                    #[test_strategy::proptest]
                    fn test_avl_invariants_hold_after_mutations(
                        #[strategy(kv_pairs(1..32).prop_shuffle())] pairs: Vec<KeyValue>,
                    ) {
                        let mut tree = TestTree::detached();
                        for kv in &pairs {
                            tree.set(&kv.key, &kv.value)?;
                            tree.check_invariants();
                        }
                        prop_assert_eq!(tree.size() as usize, pairs.len());

                        let mut remaining = pairs.len();
                        for kv in pairs.iter().step_by(2) {
                            let (value, removed) = tree.delete(&kv.key)?;
                            prop_assert!(removed);
                            prop_assert_eq!(value.as_deref(), Some(kv.value.as_slice()));
                            remaining -= 1;
                            tree.check_invariants();
                        }
                        prop_assert_eq!(tree.size() as usize, remaining);
                    }

                    #[test_strategy::proptest]
                    fn test_get_returns_what_was_set(
                        #[strategy(kv_pairs(1..24).prop_shuffle())] pairs: Vec<KeyValue>,
                    ) {
                        let mut tree = TestTree::detached();
                        for kv in &pairs {
                            tree.set(&kv.key, &kv.value)?;
                        }
                        for kv in &pairs {
                            let (_, value) = tree.get(&kv.key)?;
                            prop_assert_eq!(value.as_deref(), Some(kv.value.as_slice()));
                        }
                    }

                    #[test_strategy::proptest]
                    fn test_get_index_is_in_order_rank(
                        #[strategy(kv_pairs(1..24).prop_shuffle())] pairs: Vec<KeyValue>,
                    ) {
                        let mut tree = TestTree::detached();
                        for kv in &pairs {
                            tree.set(&kv.key, &kv.value)?;
                        }
                        let mut sorted: Vec<&KeyValue> = pairs.iter().collect();
                        sorted.sort_by(|a, b| a.key.cmp(&b.key));
                        for (rank, kv) in sorted.iter().enumerate() {
                            let (index, _) = tree.get(&kv.key)?;
                            prop_assert_eq!(index, rank as i64);
                        }
                    }

                    #[test_strategy::proptest]
                    fn test_saved_tree_roundtrips(
                        #[strategy(kv_pairs(1..24).prop_shuffle())] pairs: Vec<KeyValue>,
                    ) {
                        let store = Arc::new(MemoryStore::new());
                        let mut tree = TestTree::new(store.clone());
                        for kv in &pairs {
                            tree.set(&kv.key, &kv.value)?;
                        }
                        let root = tree.save()?;

                        let mut reloaded = TestTree::new(store);
                        reloaded.load(root)?;
                        reloaded.check_invariants();
                        prop_assert_eq!(reloaded.hash(), root);
                        prop_assert_eq!(reloaded.size(), pairs.len() as i64);
                        for kv in &pairs {
                            let (_, value) = reloaded.get(&kv.key)?;
                            prop_assert_eq!(value.as_deref(), Some(kv.value.as_slice()));
                        }
                    }

                    /// Nodes rewritten for a single-key change: one leaf plus
                    /// the spine above it, with slack for rotations.
                    fn tree_path_bound(size: i64) -> i64 {
                        let mut height = 0;
                        let mut capacity = 1i64;
                        while capacity < size {
                            capacity *= 2;
                            height += 1;
                        }
                        2 * (height + 1)
                    }
                }
            }
        };
    }

    #[cfg(feature = "blake3")]
    type Blake3 = blake3::Hasher;
    #[cfg(feature = "blake3")]
    generate_tree_tests!(Blake3);

    #[cfg(feature = "blake2")]
    type Blake2s256 = blake2::Blake2s256;
    #[cfg(feature = "blake2")]
    generate_tree_tests!(Blake2s256);

    #[cfg(feature = "sha2")]
    type Sha256 = sha2::Sha256;
    #[cfg(feature = "sha2")]
    generate_tree_tests!(Sha256);
}
