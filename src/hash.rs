use std::fmt::{Display, Formatter};
use std::hash::{Hash as StdHash, Hasher};

use digest::Digest;
use proptest::prelude::*;
use proptest::strategy::BoxedStrategy;

use crate::error::{Error, Result};
use crate::prelude::{FromBytes, FromHex, ToBytes, ToHex};

/// Content hash of a node, and the handle a tree version is known by.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Hash([u8; Hash::LEN]);

impl Hash {
    /// Width of a hash in bytes. Digest algorithms with wider output are
    /// truncated to this many bytes.
    pub const LEN: usize = 32;

    pub fn new<T: Into<[u8; Hash::LEN]>>(data: T) -> Self {
        Hash(data.into())
    }

    /// Builds a hash from a slice, which must be exactly [`Hash::LEN`]
    /// bytes long.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != Hash::LEN {
            return Err(Error::Deserialization(format!(
                "expected {} hash bytes, got {}",
                Hash::LEN,
                slice.len()
            )));
        }
        let mut inner = [0u8; Hash::LEN];
        inner.copy_from_slice(slice);
        Ok(Hash(inner))
    }

    /// Returns the all-zeroes hash. Never a valid content hash; useful as a
    /// placeholder in fixtures.
    pub fn zero() -> Self {
        Self([0u8; Hash::LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; Hash::LEN]
    }

    /// Hashes `data` with the digest algorithm `D`.
    pub fn digest<D: Digest>(data: &[u8]) -> Self {
        let output = D::digest(data);
        let mut inner = [0u8; Hash::LEN];
        let len = output.len().min(Hash::LEN);
        inner[..len].copy_from_slice(&output[..len]);
        Hash(inner)
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl StdHash for Hash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Default for Hash {
    fn default() -> Self {
        Hash::zero()
    }
}

impl Arbitrary for Hash {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        any::<[u8; Hash::LEN]>().prop_map(Hash::new).boxed()
    }
}

impl From<[u8; Hash::LEN]> for Hash {
    fn from(array: [u8; Hash::LEN]) -> Self {
        Hash(array)
    }
}

impl From<Hash> for [u8; Hash::LEN] {
    fn from(val: Hash) -> Self {
        val.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl ToBytes for Hash {
    type Output = [u8; Hash::LEN];

    fn to_bytes(&self) -> Self::Output {
        self.0
    }
}

impl FromBytes for Hash {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_slice(bytes)
    }
}

impl ToHex for Hash {
    fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromHex for Hash {
    fn from_hex(input: &str) -> Result<Self> {
        let bytes = hex::decode(input)?;
        Self::from_slice(&bytes)
    }
}
