use proptest::{
    collection::{btree_map, vec},
    prelude::*,
    sample::SizeRange,
};

use crate::kv::KeyValue;

/// Generates key/value pairs with distinct, non-empty keys, sorted by key.
/// Shuffle with `prop_shuffle` where the insertion order should vary.
pub fn kv_pairs(size: impl Into<SizeRange>) -> impl Strategy<Value = Vec<KeyValue>> {
    btree_map(vec(any::<u8>(), 1..32), vec(any::<u8>(), 0..32), size).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(key, value)| KeyValue { key, value })
            .collect()
    })
}
