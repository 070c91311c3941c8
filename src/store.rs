use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Byte-oriented key/value store the tree persists its nodes into.
///
/// Records are content-addressed and immutable, so writes are idempotent:
/// storing the same key twice always stores the same bytes. Implementations
/// surface their own failures as [`Error::StoreIo`]; the tree never retries.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Atomic multi-write: either every pair lands or none does.
    fn write_batch(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()>;
}

/// In-memory [`KvStore`] backed by a `BTreeMap`, for tests and ephemeral
/// trees.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held. Tests use this to observe that repeated saves
    /// do not duplicate nodes.
    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(map) => map.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self
            .inner
            .read()
            .map_err(|_| Error::StoreIo("store lock poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| Error::StoreIo("store lock poisoned".to_string()))?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| Error::StoreIo("store lock poisoned".to_string()))?;
        for (key, value) in pairs {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}
