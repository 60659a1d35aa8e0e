//! Working batches.
//!
//! A [`Batch`] is one caller's buffering context: a copy-on-write overlay
//! over the committed snapshot it was opened on, plus the ordered log of
//! mutations issued against it. Batches never block each other and nothing
//! in a batch is visible to other callers until it is committed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::commit::BufferGuard;
use crate::index::WILDCARD;
use crate::model::{LinkSlot, Membership, Node, NodeId, NodeKind, Value};
use crate::store::NodeStore;
use crate::store::apply::{self, ChangeRecord, NodeSource};
use crate::watch::ChangeSource;
use crate::{Error, Result};

/// Opaque batch identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// How a membership mutation treats the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipOp {
    Add,
    Remove,
    /// Resolved against the snapshot the batch is committed onto, so it
    /// always produces exactly one change.
    Toggle,
}

/// One buffered mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Create {
        id: NodeId,
        kind: NodeKind,
        node_type: String,
        created_at: DateTime<Utc>,
    },
    SetProperty {
        id: NodeId,
        name: String,
        value: Option<Value>,
    },
    Membership {
        id: NodeId,
        set: Membership,
        name: String,
        op: MembershipOp,
    },
    SetLink {
        id: NodeId,
        slot: LinkSlot,
        target: Option<NodeId>,
    },
    Delete {
        id: NodeId,
    },
}

impl Mutation {
    /// The node this mutation writes to.
    pub fn target(&self) -> NodeId {
        match self {
            Mutation::Create { id, .. }
            | Mutation::SetProperty { id, .. }
            | Mutation::Membership { id, .. }
            | Mutation::SetLink { id, .. }
            | Mutation::Delete { id } => *id,
        }
    }
}

// ============================================================================
// Overlay
// ============================================================================

/// Copy-on-write view of a snapshot. `None` marks a node deleted in the
/// batch.
#[derive(Debug, Clone)]
struct Overlay {
    base: Arc<NodeStore>,
    touched: HashMap<NodeId, Option<Node>>,
}

impl NodeSource for Overlay {
    fn node(&self, id: NodeId) -> Option<&Node> {
        match self.touched.get(&id) {
            Some(slot) => slot.as_ref(),
            None => self.base.get(id),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if !self.touched.contains_key(&id) {
            let node = self.base.get(id)?.clone();
            self.touched.insert(id, Some(node));
        }
        self.touched.get_mut(&id).and_then(Option::as_mut)
    }

    fn insert(&mut self, node: Node) {
        self.touched.insert(node.id(), Some(node));
    }

    fn remove(&mut self, id: NodeId) -> Option<Node> {
        let prior = self.node(id).cloned();
        if prior.is_some() {
            self.touched.insert(id, None);
        }
        prior
    }

    fn referrers_of(&self, id: NodeId) -> Vec<(NodeId, LinkSlot)> {
        let mut candidates: Vec<(NodeId, LinkSlot)> = Vec::new();
        for slot in [LinkSlot::Subject, LinkSlot::Object] {
            candidates.extend(self.base.referrers(id, slot).into_iter().map(|r| (r, slot)));
        }
        for (referrer, node) in &self.touched {
            if let Some(node) = node {
                candidates.extend(node.links().filter(|(_, t)| *t == id).map(|(slot, _)| (*referrer, slot)));
            }
        }
        candidates.sort();
        candidates.dedup();
        candidates.retain(|(referrer, slot)| {
            self.node(*referrer).and_then(|n| n.link(*slot)) == Some(id)
        });
        candidates
    }
}

// ============================================================================
// Batch
// ============================================================================

/// A buffered set of mutations, opened with [`Graph::batch`](crate::Graph::batch)
/// and applied atomically by [`Graph::commit`](crate::Graph::commit).
///
/// Mutation methods validate synchronously and fail without recording
/// anything. Whether a recorded mutation is an add, an update, a removal
/// or a no-op is decided at commit time against the newest snapshot.
pub struct Batch {
    tx: TxId,
    pub(crate) source: ChangeSource,
    overlay: Overlay,
    ops: Vec<Mutation>,
    ids: Arc<AtomicU64>,
    guard: BufferGuard,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("tx", &self.tx)
            .field("source", &self.source)
            .field("base_version", &self.overlay.base.version())
            .field("ops", &self.ops.len())
            .finish()
    }
}

impl Batch {
    pub(crate) fn new(tx: TxId, base: Arc<NodeStore>, ids: Arc<AtomicU64>, guard: BufferGuard) -> Self {
        Self {
            tx,
            source: ChangeSource::Local,
            overlay: Overlay { base, touched: HashMap::new() },
            ops: Vec::new(),
            ids,
            guard,
        }
    }

    pub fn tx(&self) -> TxId {
        self.tx
    }

    pub fn source(&self) -> ChangeSource {
        self.source
    }

    /// Version of the committed snapshot this batch was opened on.
    pub fn base_version(&self) -> u64 {
        self.overlay.base.version()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn guard(&self) -> &BufferGuard {
        &self.guard
    }

    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.ops
    }

    // ========================================================================
    // Reads (see the batch's own writes)
    // ========================================================================

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.overlay.node(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.overlay.node(id).is_some()
    }

    pub fn get(&self, id: NodeId, key: &str) -> Option<&Value> {
        self.overlay.node(id).and_then(|n| n.get(key))
    }

    // ========================================================================
    // Node lifecycle
    // ========================================================================

    /// Create a node and return its freshly allocated id.
    pub fn create(&mut self, kind: NodeKind, node_type: impl Into<String>) -> Result<NodeId> {
        let node_type = node_type.into();
        check_name("node type", &node_type)?;
        let id = NodeId(self.ids.fetch_add(1, Ordering::Relaxed));
        self.record(Mutation::Create { id, kind, node_type, created_at: Utc::now() })?;
        Ok(id)
    }

    pub fn create_entity(&mut self, node_type: impl Into<String>) -> Result<NodeId> {
        self.create(NodeKind::Entity, node_type)
    }

    /// Create a relationship or bond and set both links in one step.
    pub fn create_link(
        &mut self,
        kind: NodeKind,
        node_type: impl Into<String>,
        subject: Option<NodeId>,
        object: Option<NodeId>,
    ) -> Result<NodeId> {
        if !kind.is_link() {
            return Err(Error::InvalidOperation(format!("{kind} nodes carry no links")));
        }
        for target in [subject, object].into_iter().flatten() {
            if !self.contains(target) {
                return Err(Error::NotFound(format!("Node {target}")));
            }
        }
        let id = self.create(kind, node_type)?;
        self.set_link(id, LinkSlot::Subject, subject)?;
        self.set_link(id, LinkSlot::Object, object)?;
        Ok(id)
    }

    /// Delete a node. Links referencing it are cleared in the same batch;
    /// the link nodes themselves are kept.
    pub fn delete(&mut self, id: NodeId) -> Result<()> {
        self.record(Mutation::Delete { id })
    }

    // ========================================================================
    // Properties
    // ========================================================================

    pub fn set_property(&mut self, id: NodeId, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.put_property(id, name, Some(value.into()))
    }

    pub fn remove_property(&mut self, id: NodeId, name: impl Into<String>) -> Result<()> {
        self.put_property(id, name, None)
    }

    /// Set (`Some`) or remove (`None`) a property.
    pub fn put_property(&mut self, id: NodeId, name: impl Into<String>, value: Option<Value>) -> Result<()> {
        let name = name.into();
        check_name("property name", &name)?;
        if let Some(value) = &value {
            value.validate()?;
        }
        self.record(Mutation::SetProperty { id, name, value })
    }

    // ========================================================================
    // Tags and groups
    // ========================================================================

    pub fn add_tags<I, S>(&mut self, id: NodeId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership(id, Membership::Tag, MembershipOp::Add, names)
    }

    pub fn remove_tags<I, S>(&mut self, id: NodeId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership(id, Membership::Tag, MembershipOp::Remove, names)
    }

    pub fn toggle_tags<I, S>(&mut self, id: NodeId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership(id, Membership::Tag, MembershipOp::Toggle, names)
    }

    pub fn add_to_groups<I, S>(&mut self, id: NodeId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership(id, Membership::Group, MembershipOp::Add, names)
    }

    pub fn remove_from_groups<I, S>(&mut self, id: NodeId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership(id, Membership::Group, MembershipOp::Remove, names)
    }

    pub fn toggle_groups<I, S>(&mut self, id: NodeId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership(id, Membership::Group, MembershipOp::Toggle, names)
    }

    fn membership<I, S>(&mut self, id: NodeId, set: Membership, op: MembershipOp, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let what = match set {
            Membership::Tag => "tag",
            Membership::Group => "group",
        };
        for name in &names {
            check_name(what, name)?;
        }
        if !self.contains(id) {
            return Err(Error::NotFound(format!("Node {id}")));
        }
        for name in names {
            self.record(Mutation::Membership { id, set, name, op })?;
        }
        Ok(())
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Point `slot` of a relationship or bond at `target`, or clear it.
    pub fn set_link(&mut self, id: NodeId, slot: LinkSlot, target: Option<NodeId>) -> Result<()> {
        self.record(Mutation::SetLink { id, slot, target })
    }

    fn record(&mut self, op: Mutation) -> Result<()> {
        let mut scratch: Vec<ChangeRecord> = Vec::new();
        apply::apply(&mut self.overlay, self.ops.len(), &op, &mut scratch)?;
        self.ops.push(op);
        Ok(())
    }
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidValue(format!("{what} must not be empty")));
    }
    if name == WILDCARD {
        return Err(Error::InvalidValue(format!("{what} '{WILDCARD}' is reserved for wildcard lookups")));
    }
    Ok(())
}
