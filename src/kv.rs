//! Batch key/value facade over the tree: apply a list of writes or removals
//! against a named root hash and get the new root hash back, plus paged
//! range listing and single-key proof helpers.

use std::sync::Arc;

use digest::Digest;
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::strategy::BoxedStrategy;

use crate::error::Result;
use crate::hash::Hash;
use crate::prelude::{FromBytes, ToBytes};
use crate::proof::Proof;
use crate::store::KvStore;
use crate::tree::Tree;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Arbitrary for KeyValue {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (vec(any::<u8>(), 1..32), vec(any::<u8>(), 0..32))
            .prop_map(|(key, value)| KeyValue { key, value })
            .boxed()
    }
}

/// Applies `pairs` in order on top of `prior` (the empty tree when `None`),
/// saves, and returns the new root hash.
pub fn set_kv_pair<D: Digest>(
    store: Arc<dyn KvStore>,
    prior: Option<Hash>,
    pairs: &[KeyValue],
) -> Result<Hash> {
    let mut tree = Tree::<D>::new(store);
    if let Some(root) = prior {
        tree.load(root)?;
    }
    for kv in pairs {
        tree.set(&kv.key, &kv.value)?;
    }
    tree.save()
}

/// Removes `keys` in order from the version at `root` and returns the new
/// root hash plus the removed values. Keys that are not present are skipped.
pub fn del_kv_pair<D: Digest>(
    store: Arc<dyn KvStore>,
    root: Hash,
    keys: &[Vec<u8>],
) -> Result<(Hash, Vec<Vec<u8>>)> {
    let mut tree = Tree::<D>::new(store);
    tree.load(root)?;
    let mut removed = Vec::new();
    for key in keys {
        if let (Some(value), true) = tree.delete(key)? {
            removed.push(value);
        }
    }
    Ok((tree.save()?, removed))
}

/// Builds a serialized membership proof for `key` under `root`, or `None`
/// when the key is absent.
pub fn get_kv_pair_proof<D: Digest>(
    store: Arc<dyn KvStore>,
    root: Hash,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let mut tree = Tree::<D>::new(store);
    tree.load(root)?;
    Ok(tree.proof(key)?.map(|(_, proof)| proof.to_bytes()))
}

/// Checks a serialized proof for `kv` against `root`. Corrupt proof bytes
/// are an error; a proof that simply does not check out returns false.
pub fn verify_kv_pair_proof<D: Digest>(
    root: Hash,
    kv: &KeyValue,
    proof_bytes: &[u8],
) -> Result<bool> {
    let proof = Proof::from_bytes(proof_bytes)?;
    Ok(proof.verify::<D>(&kv.key, &kv.value, root))
}

/// Every `(key, value)` pair under `root`, in key order.
pub fn tree_leaves<D: Digest>(store: Arc<dyn KvStore>, root: Hash) -> Result<Vec<KeyValue>> {
    let mut tree = Tree::<D>::new(store);
    tree.load(root)?;
    let mut leaves = Vec::new();
    tree.iterate_range(&[], &[], &mut |key, value| {
        leaves.push(KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        false
    })?;
    Ok(leaves)
}

/// One page of a range listing.
///
/// Without a suffix the listing walks `[start, end)` and stops after `count`
/// entries; `next_key` is then the first key that was *not* returned, and
/// resuming from it continues seamlessly. With a suffix only keys strictly
/// longer than the suffix whose trailing bytes equal it are collected
/// (shorter keys are skipped without counting); `next_key` is then the last
/// key that *was* returned, and [`list`] resumes exclusively past it. Either
/// way pages never overlap and never skip a matching key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub start: Vec<u8>,
    /// Exclusive upper bound; empty means unbounded.
    pub end: Vec<u8>,
    pub suffix: Option<Vec<u8>>,
    pub count: usize,
    /// `next_key` of the previous page, if resuming.
    pub resume_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListReply {
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub next_key: Option<Vec<u8>>,
}

/// Lists one page of keys under `root` per `req`. See [`ListRequest`].
pub fn list<D: Digest>(store: Arc<dyn KvStore>, root: Hash, req: &ListRequest) -> Result<ListReply> {
    let mut tree = Tree::<D>::new(store);
    tree.load(root)?;

    let start = req.resume_key.as_deref().unwrap_or(&req.start);
    let resumed_suffix_key = match &req.suffix {
        Some(_) => req.resume_key.as_deref(),
        None => None,
    };

    let mut reply = ListReply::default();
    tree.iterate_range(start, &req.end, &mut |key, value| match &req.suffix {
        None => {
            if reply.keys.len() >= req.count {
                reply.next_key = Some(key.to_vec());
                return true;
            }
            reply.keys.push(key.to_vec());
            reply.values.push(value.to_vec());
            false
        }
        Some(suffix) => {
            if key.len() <= suffix.len() || !key.ends_with(suffix) {
                return false;
            }
            if resumed_suffix_key == Some(key) {
                return false;
            }
            reply.keys.push(key.to_vec());
            reply.values.push(value.to_vec());
            if reply.keys.len() >= req.count {
                reply.next_key = Some(key.to_vec());
                return true;
            }
            false
        }
    })?;
    Ok(reply)
}

/// The `[start, end)` range covering exactly the keys that begin with
/// `prefix`. A prefix of all `0xff` bytes has no finite upper bound; the
/// returned end is then empty, meaning unbounded.
pub fn prefix_bounds(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let start = prefix.to_vec();
    let mut end = prefix.to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return (start, end);
        }
    }
    (start, Vec::new())
}
