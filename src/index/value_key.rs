//! Hashable canonical form of a [`Value`], used as the key of the
//! (property, value) index.

use crate::model::Value;

/// Canonical, hashable mirror of `Value`.
///
/// Two values produce equal keys exactly when they are structurally equal.
/// Floats are keyed by their bit pattern with `-0.0` folded onto `0.0`;
/// non-finite floats never reach the index (see [`Value::validate`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    String(String),
    Int(i64),
    Float(u64),
    Bool(bool),
    Date(i64, u32),
    Bytes(Vec<u8>),
    List(Vec<ValueKey>),
    Map(Vec<(String, ValueKey)>),
}

impl From<&Value> for ValueKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => ValueKey::String(s.clone()),
            Value::Int(i) => ValueKey::Int(*i),
            Value::Float(f) => {
                let f = if *f == 0.0 { 0.0 } else { *f };
                ValueKey::Float(f.to_bits())
            }
            Value::Bool(b) => ValueKey::Bool(*b),
            Value::Date(d) => ValueKey::Date(d.timestamp(), d.timestamp_subsec_nanos()),
            Value::Bytes(b) => ValueKey::Bytes(b.clone()),
            Value::List(items) => ValueKey::List(items.iter().map(ValueKey::from).collect()),
            // BTreeMap iteration is sorted, so the entry order is canonical.
            Value::Map(entries) => ValueKey::Map(
                entries.iter().map(|(k, v)| (k.clone(), ValueKey::from(v))).collect(),
            ),
        }
    }
}
