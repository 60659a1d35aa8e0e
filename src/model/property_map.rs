//! PropertyMap: the key-value store on every node.

use std::collections::BTreeMap;
use super::Value;

/// A map of property names to values.
///
/// Ordered so that store records and JSON snapshots serialize the same way
/// on every run.
pub type PropertyMap = BTreeMap<String, Value>;

/// Convert iterator of (key, value) pairs into a map value.
impl<K, V> From<Vec<(K, V)>> for Value
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from(pairs: Vec<(K, V)>) -> Self {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
