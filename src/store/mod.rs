//! # Node Store
//!
//! The canonical, committed state of one graph: node records, the
//! [`AttributeIndex`] over them, and the reverse link index
//! ("which link nodes reference me, through which slot").
//!
//! A `NodeStore` is never mutated in place once published. The commit
//! writer replays a batch onto a clone and swaps the whole snapshot, so a
//! reader holding an `Arc<NodeStore>` always sees a consistent graph.

pub(crate) mod apply;

use hashbrown::HashMap;
use tracing::warn;

use crate::index::{AttributeIndex, IdSet};
use crate::model::{LinkSlot, Node, NodeId};
use crate::storage::NodeRecord;
use crate::tx::Mutation;
use crate::watch::Change;

use apply::{ChangeRecord, NodeSource};

/// Link nodes referencing one node, per slot.
#[derive(Debug, Clone, Default)]
struct Referrers {
    subject: IdSet,
    object: IdSet,
}

impl Referrers {
    fn slot_mut(&mut self, slot: LinkSlot) -> &mut IdSet {
        match slot {
            LinkSlot::Subject => &mut self.subject,
            LinkSlot::Object => &mut self.object,
        }
    }

    fn is_empty(&self) -> bool {
        self.subject.is_empty() && self.object.is_empty()
    }
}

/// Result of replaying a mutation log onto a snapshot.
pub(crate) struct Replay {
    pub store: NodeStore,
    pub records: Vec<ChangeRecord>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct NodeStore {
    nodes: HashMap<NodeId, Node>,
    index: AttributeIndex,
    referrers: HashMap<NodeId, Referrers>,
    version: u64,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a snapshot from persisted records.
    ///
    /// Duplicate ids keep the last record. Links pointing at ids that are
    /// not part of the record set are dropped.
    pub fn hydrate(records: impl IntoIterator<Item = NodeRecord>) -> Self {
        let mut by_id: HashMap<NodeId, NodeRecord> = HashMap::new();
        for record in records {
            by_id.insert(record.id, record);
        }

        let mut store = NodeStore::new();
        let mut ids: Vec<NodeId> = by_id.keys().copied().collect();
        ids.sort();

        for id in ids {
            let Some(record) = by_id.get(&id) else { continue };
            let mut node = Node::from(record.clone());
            for slot in [LinkSlot::Subject, LinkSlot::Object] {
                if let Some(target) = node.link(slot) {
                    if !by_id.contains_key(&target) {
                        warn!(node = %id, %slot, %target, "dropping dangling link during hydration");
                        node.set_link(slot, None);
                    }
                }
            }
            store.observe(&ChangeRecord { seq: 0, node: node.clone(), change: Change::Inserted });
            store.nodes.insert(id, node);
        }
        store
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of commits folded into this snapshot since it was opened.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn index(&self) -> &AttributeIndex {
        &self.index
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.index.all().into_iter().filter_map(|id| self.nodes.get(&id))
    }

    /// Link nodes whose `slot` references `id`.
    pub fn referrers(&self, id: NodeId, slot: LinkSlot) -> IdSet {
        self.referrers
            .get(&id)
            .map(|refs| match slot {
                LinkSlot::Subject => refs.subject.clone(),
                LinkSlot::Object => refs.object.clone(),
            })
            .unwrap_or_default()
    }

    /// Largest id in the snapshot, used to resume id allocation.
    pub fn max_id(&self) -> Option<NodeId> {
        self.nodes.keys().max().copied()
    }

    /// Replay a mutation log onto a copy of this snapshot.
    ///
    /// Mutations whose target vanished under a newer snapshot are skipped;
    /// the rest still apply.
    pub(crate) fn replay(&self, ops: &[Mutation]) -> Replay {
        let mut store = self.clone();
        let mut records = Vec::new();
        let mut skipped = 0;

        for (seq, op) in ops.iter().enumerate() {
            if let Err(err) = apply::apply(&mut store, seq, op, &mut records) {
                skipped += 1;
                warn!(node = %op.target(), error = %err, "skipping stale mutation");
            }
        }
        if !records.is_empty() {
            store.version += 1;
        }
        Replay { store, records, skipped }
    }

    fn link(&mut self, target: NodeId, slot: LinkSlot, referrer: NodeId) {
        self.referrers.entry(target).or_default().slot_mut(slot).insert(referrer);
    }

    fn unlink(&mut self, target: NodeId, slot: LinkSlot, referrer: NodeId) {
        if let Some(refs) = self.referrers.get_mut(&target) {
            refs.slot_mut(slot).remove(&referrer);
            if refs.is_empty() {
                self.referrers.remove(&target);
            }
        }
    }
}

impl NodeSource for NodeStore {
    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id(), node);
    }

    fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.nodes.remove(&id)
    }

    fn referrers_of(&self, id: NodeId) -> Vec<(NodeId, LinkSlot)> {
        let Some(refs) = self.referrers.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<(NodeId, LinkSlot)> = refs
            .subject
            .iter()
            .map(|r| (*r, LinkSlot::Subject))
            .chain(refs.object.iter().map(|r| (*r, LinkSlot::Object)))
            .collect();
        out.sort();
        out
    }

    fn observe(&mut self, record: &ChangeRecord) {
        let id = record.node.id();
        match &record.change {
            Change::Inserted => {
                self.index.insert_node(&record.node);
                for (slot, target) in record.node.links() {
                    self.link(target, slot, id);
                }
            }
            Change::Deleted => {
                self.index.remove_node(&record.node);
                for (slot, target) in record.node.links() {
                    self.unlink(target, slot, id);
                }
                self.referrers.remove(&id);
            }
            Change::PropertyAdded { name, value } => self.index.add_property(id, name, value),
            Change::PropertyUpdated { name, old, new } => self.index.update_property(id, name, old, new),
            Change::PropertyRemoved { name, old } => self.index.remove_property(id, name, old),
            Change::TagAdded(tag) => self.index.add_tag(id, tag),
            Change::TagRemoved(tag) => self.index.remove_tag(id, tag),
            Change::GroupAdded(group) => self.index.add_group(id, group),
            Change::GroupRemoved(group) => self.index.remove_group(id, group),
            Change::LinkChanged { slot, old, new } => {
                if let Some(old) = old {
                    self.unlink(*old, *slot, id);
                }
                if let Some(new) = new {
                    self.link(*new, *slot, id);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
