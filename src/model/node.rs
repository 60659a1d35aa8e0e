//! Node in the object graph.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PropertyMap, Value};

/// Opaque node identifier.
///
/// Allocated from a per-graph monotonic counter, so ordering by id is
/// ordering by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a node is: a noun, or one of the two verb kinds that link nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Entity,
    Relationship,
    Bond,
}

impl NodeKind {
    pub const ALL: [NodeKind; 3] = [NodeKind::Entity, NodeKind::Relationship, NodeKind::Bond];

    /// Relationships and bonds carry `subject` / `object` links.
    pub fn is_link(&self) -> bool {
        !matches!(self, NodeKind::Entity)
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Entity => "Entity",
            NodeKind::Relationship => "Relationship",
            NodeKind::Bond => "Bond",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One of the two link slots of a relationship or bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LinkSlot {
    Subject,
    Object,
}

impl std::fmt::Display for LinkSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkSlot::Subject => f.write_str("subject"),
            LinkSlot::Object => f.write_str("object"),
        }
    }
}

/// The two string-set memberships every node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Membership {
    Tag,
    Group,
}

/// A node in the object graph.
///
/// Values of this type are snapshots: mutating a `Node` you hold never
/// touches the graph. All writes go through a [`Batch`](crate::tx::Batch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) node_type: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) properties: PropertyMap,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) groups: BTreeSet<String>,
    pub(crate) subject: Option<NodeId>,
    pub(crate) object: Option<NodeId>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        kind: NodeKind,
        node_type: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            node_type: node_type.into(),
            created_at,
            properties: PropertyMap::new(),
            tags: BTreeSet::new(),
            groups: BTreeSet::new(),
            subject: None,
            object: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    pub fn subject(&self) -> Option<NodeId> {
        self.subject
    }

    pub fn object(&self) -> Option<NodeId> {
        self.object
    }

    /// The node referenced through `slot`. Always `None` for entities.
    pub fn link(&self, slot: LinkSlot) -> Option<NodeId> {
        match slot {
            LinkSlot::Subject => self.subject,
            LinkSlot::Object => self.object,
        }
    }

    /// Iterate the populated link slots.
    pub fn links(&self) -> impl Iterator<Item = (LinkSlot, NodeId)> {
        [(LinkSlot::Subject, self.subject), (LinkSlot::Object, self.object)]
            .into_iter()
            .filter_map(|(slot, target)| target.map(|t| (slot, t)))
    }

    pub(crate) fn members(&self, set: Membership) -> &BTreeSet<String> {
        match set {
            Membership::Tag => &self.tags,
            Membership::Group => &self.groups,
        }
    }

    pub(crate) fn members_mut(&mut self, set: Membership) -> &mut BTreeSet<String> {
        match set {
            Membership::Tag => &mut self.tags,
            Membership::Group => &mut self.groups,
        }
    }

    pub(crate) fn set_link(&mut self, slot: LinkSlot, target: Option<NodeId>) {
        match slot {
            LinkSlot::Subject => self.subject = target,
            LinkSlot::Object => self.object = target,
        }
    }

    /// The "other" end of a link node from the given node.
    pub fn other_end(&self, from: NodeId) -> Option<NodeId> {
        if self.subject == Some(from) {
            self.object
        } else if self.object == Some(from) {
            self.subject
        } else {
            None
        }
    }
}
