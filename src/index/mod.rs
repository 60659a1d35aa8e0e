//! # Attribute Index
//!
//! Reverse lookup structures so that "all nodes of type T", "all nodes
//! tagged G", "all nodes with property P [= v]" resolve without a scan.
//!
//! Every lookup returns an [`IdSet`], ordered by node id and therefore by
//! creation order. The index is pure data: it is owned by a
//! [`NodeStore`](crate::store::NodeStore) snapshot and only ever updated
//! from committed change records, so a reader holding a snapshot never
//! observes a half-applied batch.

mod value_key;

use std::collections::BTreeSet;

use hashbrown::HashMap;

use crate::model::{Node, NodeId, NodeKind, Value};
use crate::query::Combinator;

pub use value_key::ValueKey;

/// Ordered set of node ids.
pub type IdSet = BTreeSet<NodeId>;

/// Key that matches every populated key of an index.
pub const WILDCARD: &str = "*";

/// The string-keyed indices a lookup can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Type,
    Tag,
    Group,
    Property,
}

// ============================================================================
// KeyIndex
// ============================================================================

/// key → ids. Keys whose last member leaves are dropped, so every key
/// present is populated.
#[derive(Debug, Clone, Default)]
struct KeyIndex {
    keys: HashMap<String, IdSet>,
}

impl KeyIndex {
    fn insert(&mut self, key: &str, id: NodeId) {
        self.keys.entry_ref(key).or_default().insert(id);
    }

    fn remove(&mut self, key: &str, id: NodeId) {
        if let Some(ids) = self.keys.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.keys.remove(key);
            }
        }
    }

    fn get(&self, key: &str) -> IdSet {
        if key == WILDCARD {
            return self.all();
        }
        self.keys.get(key).cloned().unwrap_or_default()
    }

    fn all(&self) -> IdSet {
        self.keys.values().flatten().copied().collect()
    }

    fn lookup<S: AsRef<str>>(&self, names: &[S], combinator: Combinator) -> IdSet {
        let mut sets = names.iter().map(|name| self.get(name.as_ref()));
        let Some(first) = sets.next() else {
            return IdSet::new();
        };
        match combinator {
            Combinator::Or => sets.fold(first, |mut acc, set| {
                acc.extend(set);
                acc
            }),
            Combinator::And => {
                let mut acc = first;
                for set in sets {
                    if acc.is_empty() {
                        break;
                    }
                    acc.retain(|id| set.contains(id));
                }
                acc
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.keys().cloned().collect();
        keys.sort();
        keys
    }
}

// ============================================================================
// AttributeIndex
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct AttributeIndex {
    kinds: HashMap<NodeKind, IdSet>,
    types: KeyIndex,
    tags: KeyIndex,
    groups: KeyIndex,
    properties: KeyIndex,
    /// property name → value → ids
    values: HashMap<String, HashMap<ValueKey, IdSet>>,
}

impl AttributeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, ns: Namespace) -> &KeyIndex {
        match ns {
            Namespace::Type => &self.types,
            Namespace::Tag => &self.tags,
            Namespace::Group => &self.groups,
            Namespace::Property => &self.properties,
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn by_kind(&self, kind: NodeKind) -> IdSet {
        self.kinds.get(&kind).cloned().unwrap_or_default()
    }

    pub fn by_type(&self, key: &str) -> IdSet {
        self.types.get(key)
    }

    pub fn by_tag(&self, key: &str) -> IdSet {
        self.tags.get(key)
    }

    pub fn by_group(&self, key: &str) -> IdSet {
        self.groups.get(key)
    }

    /// Nodes that have the property `name`, whatever its value.
    pub fn by_property(&self, name: &str) -> IdSet {
        self.properties.get(name)
    }

    /// Nodes whose property `name` is structurally equal to `value`.
    pub fn by_property_value(&self, name: &str, value: &Value) -> IdSet {
        self.values
            .get(name)
            .and_then(|by_value| by_value.get(&ValueKey::from(value)))
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve a list of keys in one namespace. An empty list is the empty
    /// set whatever the combinator.
    pub fn lookup<S: AsRef<str>>(&self, ns: Namespace, names: &[S], combinator: Combinator) -> IdSet {
        self.namespace(ns).lookup(names, combinator)
    }

    /// Populated keys of a namespace, sorted.
    pub fn keys(&self, ns: Namespace) -> Vec<String> {
        self.namespace(ns).keys()
    }

    /// Every indexed node.
    pub fn all(&self) -> IdSet {
        self.kinds.values().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    pub(crate) fn insert_node(&mut self, node: &Node) {
        let id = node.id();
        self.kinds.entry(node.kind()).or_default().insert(id);
        self.types.insert(node.node_type(), id);
        for tag in node.tags() {
            self.tags.insert(tag, id);
        }
        for group in node.groups() {
            self.groups.insert(group, id);
        }
        for (name, value) in node.properties() {
            self.add_property(id, name, value);
        }
    }

    pub(crate) fn remove_node(&mut self, node: &Node) {
        let id = node.id();
        if let Some(ids) = self.kinds.get_mut(&node.kind()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.kinds.remove(&node.kind());
            }
        }
        self.types.remove(node.node_type(), id);
        for tag in node.tags() {
            self.tags.remove(tag, id);
        }
        for group in node.groups() {
            self.groups.remove(group, id);
        }
        for (name, value) in node.properties() {
            self.remove_property(id, name, value);
        }
    }

    pub(crate) fn add_tag(&mut self, id: NodeId, tag: &str) {
        self.tags.insert(tag, id);
    }

    pub(crate) fn remove_tag(&mut self, id: NodeId, tag: &str) {
        self.tags.remove(tag, id);
    }

    pub(crate) fn add_group(&mut self, id: NodeId, group: &str) {
        self.groups.insert(group, id);
    }

    pub(crate) fn remove_group(&mut self, id: NodeId, group: &str) {
        self.groups.remove(group, id);
    }

    pub(crate) fn add_property(&mut self, id: NodeId, name: &str, value: &Value) {
        self.properties.insert(name, id);
        self.values
            .entry_ref(name)
            .or_default()
            .entry(ValueKey::from(value))
            .or_default()
            .insert(id);
    }

    pub(crate) fn update_property(&mut self, id: NodeId, name: &str, old: &Value, new: &Value) {
        self.remove_value(id, name, old);
        self.add_property(id, name, new);
    }

    pub(crate) fn remove_property(&mut self, id: NodeId, name: &str, old: &Value) {
        self.properties.remove(name, id);
        self.remove_value(id, name, old);
    }

    fn remove_value(&mut self, id: NodeId, name: &str, old: &Value) {
        let Some(by_value) = self.values.get_mut(name) else {
            return;
        };
        let key = ValueKey::from(old);
        if let Some(ids) = by_value.get_mut(&key) {
            ids.remove(&id);
            if ids.is_empty() {
                by_value.remove(&key);
            }
        }
        if by_value.is_empty() {
            self.values.remove(name);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
