use std::sync::Arc;

use digest::Digest;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::prelude::{FromBytes, ToBytes};

pub(crate) const LEAF_TAG: u8 = 0x00;
pub(crate) const INNER_TAG: u8 = 0x01;
pub(crate) const EMPTY_TAG: u8 = 0x02;

/// A reference to a subtree: either still on disk, known only by content
/// hash, or resident in memory. The loaded arm keeps the hash next to the
/// node, so the hash of any child is available without touching the store.
///
/// Nodes behind an `Arc` are immutable and already hashed. Cloning a `Child`
/// therefore shares the subtree, which is what makes copy-on-write mutation
/// cheap: a new tree version points at the unchanged children of the old one.
#[derive(Debug, Clone)]
pub enum Child {
    Hash(Hash),
    Node(Hash, Arc<Node>),
}

impl Child {
    pub fn hash(&self) -> Hash {
        match self {
            Child::Hash(hash) => *hash,
            Child::Node(hash, _) => *hash,
        }
    }
}

/// A tree node. Leaves carry the key/value pairs; inner nodes only route
/// lookups and commit to their children.
#[derive(Debug, Clone)]
pub enum Node {
    Leaf(LeafNode),
    Inner(InnerNode),
}

#[derive(Debug, Clone)]
pub struct LeafNode {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub(crate) persisted: bool,
}

#[derive(Debug, Clone)]
pub struct InnerNode {
    /// Partition key: the smallest key stored in the right subtree. Lookups
    /// route left when the probe key is smaller, right otherwise, without
    /// dereferencing children.
    pub key: Vec<u8>,
    pub height: i32,
    pub size: i64,
    pub left: Child,
    pub right: Child,
    pub(crate) persisted: bool,
}

impl InnerNode {
    /// A mutable copy for the next tree version. Children are shared; the
    /// copy is not yet persisted anywhere.
    pub(crate) fn working_copy(&self) -> InnerNode {
        InnerNode {
            persisted: false,
            ..self.clone()
        }
    }
}

impl Node {
    pub fn new_leaf(key: &[u8], value: &[u8]) -> Node {
        Node::Leaf(LeafNode {
            key: key.to_vec(),
            value: value.to_vec(),
            persisted: false,
        })
    }

    pub fn height(&self) -> i32 {
        match self {
            Node::Leaf(_) => 0,
            Node::Inner(inner) => inner.height,
        }
    }

    pub fn size(&self) -> i64 {
        match self {
            Node::Leaf(_) => 1,
            Node::Inner(inner) => inner.size,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Node::Leaf(leaf) => &leaf.key,
            Node::Inner(inner) => &inner.key,
        }
    }

    pub(crate) fn persisted(&self) -> bool {
        match self {
            Node::Leaf(leaf) => leaf.persisted,
            Node::Inner(inner) => inner.persisted,
        }
    }

    /// Content hash of the node under digest `D`.
    pub fn hash<D: Digest>(&self) -> Hash {
        match self {
            Node::Leaf(leaf) => leaf_hash::<D>(&leaf.key, &leaf.value),
            Node::Inner(inner) => inner_hash::<D>(
                inner.height,
                inner.size,
                inner.left.hash(),
                inner.right.hash(),
            ),
        }
    }
}

/// Content hash of a leaf holding `(key, value)`.
///
/// The preimage is tagged and commits to the leaf's fixed height 0 and
/// size 1, so a leaf can never collide with an inner node or the empty-tree
/// sentinel under the same digest.
pub fn leaf_hash<D: Digest>(key: &[u8], value: &[u8]) -> Hash {
    let mut preimage = Vec::with_capacity(1 + 4 + 8 + 4 + key.len() + 4 + value.len());
    preimage.push(LEAF_TAG);
    preimage.extend_from_slice(&0i32.to_be_bytes());
    preimage.extend_from_slice(&1i64.to_be_bytes());
    put_slice(&mut preimage, key);
    put_slice(&mut preimage, value);
    Hash::digest::<D>(&preimage)
}

/// Content hash of an inner node. The partition key is deliberately not part
/// of the preimage: proofs recompute ancestors from child hashes alone.
pub fn inner_hash<D: Digest>(height: i32, size: i64, left: Hash, right: Hash) -> Hash {
    let mut preimage = Vec::with_capacity(1 + 4 + 8 + 2 * Hash::LEN);
    preimage.push(INNER_TAG);
    preimage.extend_from_slice(&height.to_be_bytes());
    preimage.extend_from_slice(&size.to_be_bytes());
    preimage.extend_from_slice(left.as_ref());
    preimage.extend_from_slice(right.as_ref());
    Hash::digest::<D>(&preimage)
}

/// The well-known hash of the empty tree. Distinct from every node hash and
/// from the hash of a leaf with an empty value.
pub fn empty_root_hash<D: Digest>() -> Hash {
    Hash::digest::<D>(&[EMPTY_TAG])
}

impl ToBytes for Node {
    type Output = Vec<u8>;

    /// Storage record for the node. Unlike the hash preimage it carries the
    /// partition key, which routing needs after a reload.
    fn to_bytes(&self) -> Self::Output {
        match self {
            Node::Leaf(leaf) => {
                let mut bytes = vec![LEAF_TAG];
                put_slice(&mut bytes, &leaf.key);
                put_slice(&mut bytes, &leaf.value);
                bytes
            }
            Node::Inner(inner) => {
                let mut bytes = vec![INNER_TAG];
                bytes.extend_from_slice(&inner.height.to_be_bytes());
                bytes.extend_from_slice(&inner.size.to_be_bytes());
                put_slice(&mut bytes, &inner.key);
                bytes.extend_from_slice(inner.left.hash().as_ref());
                bytes.extend_from_slice(inner.right.hash().as_ref());
                bytes
            }
        }
    }
}

impl FromBytes for Node {
    /// Decodes a storage record. Decoded nodes are marked persisted, and
    /// their children start out as unloaded hashes.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let tag = take(&mut cursor, 1, "node tag")?[0];
        let node = match tag {
            LEAF_TAG => {
                let key = take_slice(&mut cursor, "leaf key")?.to_vec();
                let value = take_slice(&mut cursor, "leaf value")?.to_vec();
                Node::Leaf(LeafNode {
                    key,
                    value,
                    persisted: true,
                })
            }
            INNER_TAG => {
                let height = take_i32(&mut cursor, "inner height")?;
                let size = take_i64(&mut cursor, "inner size")?;
                let key = take_slice(&mut cursor, "partition key")?.to_vec();
                let left = take_hash(&mut cursor, "left hash")?;
                let right = take_hash(&mut cursor, "right hash")?;
                if height < 1 || size < 2 {
                    return Err(Error::Deserialization(format!(
                        "inner node with height {} and size {}",
                        height, size
                    )));
                }
                Node::Inner(InnerNode {
                    key,
                    height,
                    size,
                    left: Child::Hash(left),
                    right: Child::Hash(right),
                    persisted: true,
                })
            }
            other => {
                return Err(Error::Deserialization(format!(
                    "unknown node tag {:#04x}",
                    other
                )))
            }
        };
        if !cursor.is_empty() {
            return Err(Error::Deserialization(
                "trailing bytes after node record".to_string(),
            ));
        }
        Ok(node)
    }
}

pub(crate) fn put_slice(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

pub(crate) fn take<'a>(bytes: &mut &'a [u8], n: usize, what: &str) -> Result<&'a [u8]> {
    if bytes.len() < n {
        return Err(Error::Deserialization(format!("truncated {}", what)));
    }
    let (head, tail) = bytes.split_at(n);
    *bytes = tail;
    Ok(head)
}

pub(crate) fn take_slice<'a>(bytes: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    let len = take_u32(bytes, what)? as usize;
    take(bytes, len, what)
}

pub(crate) fn take_u32(bytes: &mut &[u8], what: &str) -> Result<u32> {
    let head = take(bytes, 4, what)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(head);
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn take_i32(bytes: &mut &[u8], what: &str) -> Result<i32> {
    let head = take(bytes, 4, what)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(head);
    Ok(i32::from_be_bytes(buf))
}

pub(crate) fn take_i64(bytes: &mut &[u8], what: &str) -> Result<i64> {
    let head = take(bytes, 8, what)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(head);
    Ok(i64::from_be_bytes(buf))
}

pub(crate) fn take_hash(bytes: &mut &[u8], what: &str) -> Result<Hash> {
    Hash::from_slice(take(bytes, Hash::LEN, what)?)
}
