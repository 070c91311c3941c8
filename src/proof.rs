use digest::Digest;
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::strategy::BoxedStrategy;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::node::{inner_hash, leaf_hash, take, take_i32, take_i64, take_u32};
use crate::prelude::{FromBytes, ToBytes};

/// Which side of the parent the recorded sibling occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One level of a membership proof: the sibling hash at that level plus the
/// parent inner node's height and size, which its hash preimage commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub side: Side,
    pub height: i32,
    pub size: i64,
    pub sibling: Hash,
}

/// A sibling path from a leaf up to a root, sufficient to recompute the root
/// hash from the leaf alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub leaf_hash: Hash,
    pub root_hash: Hash,
    pub steps: Vec<ProofStep>,
}

impl Proof {
    /// Checks that `(key, value)` is committed to by `root`.
    ///
    /// Recomputes the leaf hash, folds it through the recorded siblings and
    /// byte-compares the result against `root`. A `false` return means the
    /// data must not be trusted; it is never an operational error.
    pub fn verify<D: Digest>(&self, key: &[u8], value: &[u8], root: Hash) -> bool {
        let mut hash = leaf_hash::<D>(key, value);
        if hash != self.leaf_hash {
            return false;
        }
        for step in &self.steps {
            hash = match step.side {
                Side::Left => inner_hash::<D>(step.height, step.size, step.sibling, hash),
                Side::Right => inner_hash::<D>(step.height, step.size, hash, step.sibling),
            };
        }
        hash == root
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let leaf_hash = crate::node::take_hash(&mut cursor, "proof leaf hash")?;
        let root_hash = crate::node::take_hash(&mut cursor, "proof root hash")?;
        let count = take_u32(&mut cursor, "proof step count")? as usize;
        let mut steps = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let side = match take(&mut cursor, 1, "proof step side")?[0] {
                0 => Side::Left,
                1 => Side::Right,
                other => {
                    return Err(Error::MalformedProof(format!(
                        "unknown side marker {:#04x}",
                        other
                    )))
                }
            };
            let height = take_i32(&mut cursor, "proof step height")?;
            let size = take_i64(&mut cursor, "proof step size")?;
            let sibling = crate::node::take_hash(&mut cursor, "proof step sibling")?;
            steps.push(ProofStep {
                side,
                height,
                size,
                sibling,
            });
        }
        if !cursor.is_empty() {
            return Err(Error::MalformedProof(
                "trailing bytes after proof".to_string(),
            ));
        }
        Ok(Proof {
            leaf_hash,
            root_hash,
            steps,
        })
    }
}

impl ToBytes for Proof {
    type Output = Vec<u8>;

    fn to_bytes(&self) -> Self::Output {
        let mut bytes = Vec::with_capacity(2 * Hash::LEN + 4 + self.steps.len() * 45);
        bytes.extend_from_slice(self.leaf_hash.as_ref());
        bytes.extend_from_slice(self.root_hash.as_ref());
        bytes.extend_from_slice(&(self.steps.len() as u32).to_be_bytes());
        for step in &self.steps {
            bytes.push(match step.side {
                Side::Left => 0,
                Side::Right => 1,
            });
            bytes.extend_from_slice(&step.height.to_be_bytes());
            bytes.extend_from_slice(&step.size.to_be_bytes());
            bytes.extend_from_slice(step.sibling.as_ref());
        }
        bytes
    }
}

impl FromBytes for Proof {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes).map_err(|err| match err {
            Error::MalformedProof(_) => err,
            other => Error::MalformedProof(format!("{}", other)),
        })
    }
}

/// Decodes a serialized proof and binds it to the expected root and leaf
/// digests.
///
/// Corrupt bytes and digest mismatches both surface as
/// [`Error::MalformedProof`]; a proof that decodes and binds but does not
/// check out against a root is reported by [`Proof::verify`] returning
/// false, not by an error.
pub fn read_proof(root: Hash, leaf: Hash, bytes: &[u8]) -> Result<Proof> {
    let proof = Proof::from_bytes(bytes)?;
    if proof.leaf_hash != leaf {
        return Err(Error::MalformedProof("leaf digest mismatch".to_string()));
    }
    if proof.root_hash != root {
        return Err(Error::MalformedProof("root digest mismatch".to_string()));
    }
    Ok(proof)
}

impl Arbitrary for Side {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        prop_oneof![Just(Side::Left), Just(Side::Right)].boxed()
    }
}

impl Arbitrary for ProofStep {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (any::<Side>(), 1..64i32, 2..1_000_000i64, any::<Hash>())
            .prop_map(|(side, height, size, sibling)| ProofStep {
                side,
                height,
                size,
                sibling,
            })
            .boxed()
    }
}

impl Arbitrary for Proof {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (any::<Hash>(), any::<Hash>(), vec(any::<ProofStep>(), 0..12))
            .prop_map(|(leaf_hash, root_hash, steps)| Proof {
                leaf_hash,
                root_hash,
                steps,
            })
            .boxed()
    }
}
