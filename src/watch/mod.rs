//! # Watches
//!
//! Subscriptions to committed changes. A subscription pairs a
//! [`Predicate`] with a callback; after every commit the writer turns the
//! batch's change records into an ordered event list and hands each event
//! to every subscription whose predicate matches the event's node.
//!
//! ## Event order within one commit
//!
//! | Phase | Events |
//! |-------|--------|
//! | 0 | node inserts |
//! | 1 | per inserted node: its tag, group and property adds, in the order first issued |
//! | 2 | link sets |
//! | 3-5 | property adds, updates, removes |
//! | 6-7 | tag adds, removes |
//! | 8-9 | group adds, removes |
//! | 10 | link clears |
//! | 11 | node deletes |
//!
//! Inserted nodes are reported by their end-of-batch state. A node created
//! and deleted in the same batch produces no events.

pub mod delegate;
pub mod event;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Graph;
use crate::model::{LinkSlot, Node, NodeId};
use crate::query::Predicate;
use crate::storage::PersistentStore;
use crate::store::NodeStore;
use crate::store::apply::ChangeRecord;

pub use delegate::WatchDelegate;
pub use event::{Change, ChangeEvent, ChangeSource};

/// Handle returned by [`Graph::watch`](crate::Graph::watch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

pub type WatchCallback<B> = Arc<dyn Fn(&Graph<B>, &ChangeEvent) + Send + Sync>;

struct Subscription<B: PersistentStore> {
    id: SubscriptionId,
    predicate: Predicate,
    callback: WatchCallback<B>,
}

// ============================================================================
// Registry
// ============================================================================

pub(crate) struct WatchRegistry<B: PersistentStore> {
    subscriptions: RwLock<Vec<Arc<Subscription<B>>>>,
    next_id: AtomicU64,
}

impl<B: PersistentStore> WatchRegistry<B> {
    pub(crate) fn new() -> Self {
        Self { subscriptions: RwLock::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub(crate) fn subscribe(&self, predicate: Predicate, callback: WatchCallback<B>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Arc::new(Subscription { id, predicate, callback }));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub(crate) fn clear(&self) {
        self.subscriptions.write().clear();
    }

    /// Deliver `events` in order. The subscription list is captured first,
    /// so callbacks may watch or unwatch without deadlocking; such changes
    /// take effect from the next commit. A callback that panics loses that
    /// one delivery and nothing else.
    pub(crate) fn dispatch(&self, graph: &Graph<B>, events: &[ChangeEvent]) -> usize {
        let subs: Vec<Arc<Subscription<B>>> = self.subscriptions.read().clone();
        if subs.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        for event in events {
            for sub in &subs {
                if !sub.predicate.matches(&event.node) {
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(|| (sub.callback)(graph, event))).is_err() {
                    warn!(
                        graph = graph.name(),
                        subscription = sub.id.0,
                        node = %event.node_id(),
                        "watch callback panicked"
                    );
                    continue;
                }
                delivered += 1;
            }
        }
        debug!(graph = graph.name(), events = events.len(), delivered, "dispatched watch events");
        delivered
    }
}

// ============================================================================
// Event compilation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Insert,
    InsertedAttribute,
    LinkSet,
    PropertyAdd,
    PropertyUpdate,
    PropertyRemove,
    TagAdd,
    TagRemove,
    GroupAdd,
    GroupRemove,
    LinkClear,
    Delete,
}

impl Phase {
    fn of(change: &Change) -> Phase {
        match change {
            Change::Inserted => Phase::Insert,
            Change::Deleted => Phase::Delete,
            Change::PropertyAdded { .. } => Phase::PropertyAdd,
            Change::PropertyUpdated { .. } => Phase::PropertyUpdate,
            Change::PropertyRemoved { .. } => Phase::PropertyRemove,
            Change::TagAdded(_) => Phase::TagAdd,
            Change::TagRemoved(_) => Phase::TagRemove,
            Change::GroupAdded(_) => Phase::GroupAdd,
            Change::GroupRemoved(_) => Phase::GroupRemove,
            Change::LinkChanged { new: Some(_), .. } => Phase::LinkSet,
            Change::LinkChanged { new: None, .. } => Phase::LinkClear,
        }
    }
}

/// The attribute a change touches, used to fold repeated writes to a
/// freshly inserted node into one add.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AttrKey {
    Property(String),
    Tag(String),
    Group(String),
    Link(LinkSlot),
}

impl AttrKey {
    fn of(change: &Change) -> Option<AttrKey> {
        match change {
            Change::Inserted | Change::Deleted => None,
            Change::PropertyAdded { name, .. }
            | Change::PropertyUpdated { name, .. }
            | Change::PropertyRemoved { name, .. } => Some(AttrKey::Property(name.clone())),
            Change::TagAdded(tag) | Change::TagRemoved(tag) => Some(AttrKey::Tag(tag.clone())),
            Change::GroupAdded(group) | Change::GroupRemoved(group) => Some(AttrKey::Group(group.clone())),
            Change::LinkChanged { slot, .. } => Some(AttrKey::Link(*slot)),
        }
    }

    /// The add event for this attribute on a node's final state, if the
    /// node still carries it.
    fn added_on(&self, node: &Node) -> Option<Change> {
        match self {
            AttrKey::Property(name) => node
                .get(name)
                .map(|value| Change::PropertyAdded { name: name.clone(), value: value.clone() }),
            AttrKey::Tag(tag) => node.has_tag(tag).then(|| Change::TagAdded(tag.clone())),
            AttrKey::Group(group) => node.is_member_of(group).then(|| Change::GroupAdded(group.clone())),
            AttrKey::Link(slot) => node
                .link(*slot)
                .map(|target| Change::LinkChanged { slot: *slot, old: None, new: Some(target) }),
        }
    }
}

/// Order a batch's change records into the event list watchers receive.
///
/// `committed` is the snapshot the records were replayed into.
pub(crate) fn compile(records: &[ChangeRecord], committed: &NodeStore) -> Vec<(Node, Change)> {
    let inserted: HashMap<NodeId, usize> = records
        .iter()
        .filter(|r| matches!(r.change, Change::Inserted))
        .map(|r| (r.node.id(), r.seq))
        .collect();

    let mut seen: HashSet<(NodeId, AttrKey)> = HashSet::new();
    let mut staged: Vec<(Phase, usize, usize, Node, Change)> = Vec::with_capacity(records.len());

    for record in records {
        let id = record.node.id();
        let Some(&insert_seq) = inserted.get(&id) else {
            staged.push((Phase::of(&record.change), record.seq, record.seq, record.node.clone(), record.change.clone()));
            continue;
        };
        // Created in this batch: report the final state, or nothing if it
        // did not survive the batch.
        let Some(last) = committed.get(id) else { continue };
        if matches!(record.change, Change::Inserted) {
            staged.push((Phase::Insert, insert_seq, record.seq, last.clone(), Change::Inserted));
            continue;
        }
        let Some(key) = AttrKey::of(&record.change) else { continue };
        if !seen.insert((id, key.clone())) {
            continue;
        }
        if let Some(change) = key.added_on(last) {
            let (phase, group) = match key {
                AttrKey::Link(_) => (Phase::LinkSet, record.seq),
                _ => (Phase::InsertedAttribute, insert_seq),
            };
            staged.push((phase, group, record.seq, last.clone(), change));
        }
    }

    staged.sort_by_key(|(phase, group, seq, _, _)| (*phase, *group, *seq));
    staged.into_iter().map(|(_, _, _, node, change)| (node, change)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Membership, NodeKind, Value};
    use crate::tx::{MembershipOp, Mutation};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn create(id: u64, kind: NodeKind) -> Mutation {
        Mutation::Create { id: NodeId(id), kind, node_type: "T".into(), created_at: Utc::now() }
    }

    fn tag(id: u64, name: &str, op: MembershipOp) -> Mutation {
        Mutation::Membership { id: NodeId(id), set: Membership::Tag, name: name.into(), op }
    }

    fn prop(id: u64, name: &str, value: Option<i64>) -> Mutation {
        Mutation::SetProperty { id: NodeId(id), name: name.into(), value: value.map(Value::from) }
    }

    fn changes(base: &NodeStore, ops: &[Mutation]) -> Vec<(NodeId, Change)> {
        let replay = base.replay(ops);
        compile(&replay.records, &replay.store).into_iter().map(|(n, c)| (n.id(), c)).collect()
    }

    #[test]
    fn test_inserted_node_reports_net_attributes() {
        let events = changes(
            &NodeStore::new(),
            &[
                create(1, NodeKind::Entity),
                prop(1, "a", Some(1)),
                tag(1, "x", MembershipOp::Add),
                prop(1, "a", Some(2)),
                prop(1, "b", Some(3)),
                prop(1, "b", None),
            ],
        );

        assert_eq!(
            events,
            vec![
                (NodeId(1), Change::Inserted),
                (NodeId(1), Change::PropertyAdded { name: "a".into(), value: Value::from(2) }),
                (NodeId(1), Change::TagAdded("x".into())),
            ]
        );
    }

    #[test]
    fn test_create_then_delete_is_silent() {
        let ops = [create(1, NodeKind::Entity), prop(1, "a", Some(1)), Mutation::Delete { id: NodeId(1) }];
        assert!(changes(&NodeStore::new(), &ops).is_empty());
    }

    #[test]
    fn test_phase_order_for_existing_nodes() {
        let seed = [
            create(1, NodeKind::Entity),
            prop(1, "gone", Some(0)),
            prop(1, "kept", Some(0)),
            tag(1, "old", MembershipOp::Add),
        ];
        let base = NodeStore::new().replay(&seed).store;

        let events = changes(
            &base,
            &[
                tag(1, "old", MembershipOp::Remove),
                prop(1, "gone", None),
                tag(1, "new", MembershipOp::Add),
                prop(1, "kept", Some(1)),
                prop(1, "fresh", Some(1)),
                create(2, NodeKind::Entity),
            ],
        );

        let kinds: Vec<(u64, Phase)> = events.iter().map(|(id, c)| (id.0, Phase::of(c))).collect();
        assert_eq!(
            kinds,
            vec![
                (2, Phase::Insert),
                (1, Phase::PropertyAdd),
                (1, Phase::PropertyUpdate),
                (1, Phase::PropertyRemove),
                (1, Phase::TagAdd),
                (1, Phase::TagRemove),
            ]
        );
    }

    #[test]
    fn test_link_sets_follow_inserted_attributes() {
        let events = changes(
            &NodeStore::new(),
            &[
                create(1, NodeKind::Entity),
                create(2, NodeKind::Relationship),
                Mutation::SetLink { id: NodeId(2), slot: LinkSlot::Subject, target: Some(NodeId(1)) },
                tag(2, "x", MembershipOp::Add),
            ],
        );

        assert_eq!(
            events,
            vec![
                (NodeId(1), Change::Inserted),
                (NodeId(2), Change::Inserted),
                (NodeId(2), Change::TagAdded("x".into())),
                (NodeId(2), Change::LinkChanged { slot: LinkSlot::Subject, old: None, new: Some(NodeId(1)) }),
            ]
        );
    }

    #[test]
    fn test_toggle_twice_fires_two_events() {
        let base = NodeStore::new().replay(&[create(1, NodeKind::Entity)]).store;
        let events = changes(&base, &[tag(1, "g", MembershipOp::Toggle), tag(1, "g", MembershipOp::Toggle)]);

        assert_eq!(
            events,
            vec![(NodeId(1), Change::TagAdded("g".into())), (NodeId(1), Change::TagRemoved("g".into()))]
        );
    }
}
