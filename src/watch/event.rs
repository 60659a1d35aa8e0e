//! Change events delivered to watchers.

use serde::{Deserialize, Serialize};

use crate::model::{LinkSlot, Node, NodeId, Value};

/// Where a committed batch came from.
///
/// Everything issued through [`Graph::commit`](crate::Graph::commit) is
/// `Local`; [`Graph::apply_external`](crate::Graph::apply_external) marks
/// batches replayed from another replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeSource {
    #[default]
    Local,
    External,
}

/// One logical change to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Inserted,
    Deleted,
    PropertyAdded { name: String, value: Value },
    PropertyUpdated { name: String, old: Value, new: Value },
    PropertyRemoved { name: String, old: Value },
    TagAdded(String),
    TagRemoved(String),
    GroupAdded(String),
    GroupRemoved(String),
    LinkChanged {
        slot: LinkSlot,
        old: Option<NodeId>,
        new: Option<NodeId>,
    },
}

impl Change {
    /// Whether watchers judge this change against the node's state before
    /// it happened (deletes, removes, link clears) rather than after.
    pub fn uses_prior_state(&self) -> bool {
        matches!(
            self,
            Change::Deleted
                | Change::PropertyRemoved { .. }
                | Change::TagRemoved(_)
                | Change::GroupRemoved(_)
                | Change::LinkChanged { new: None, .. }
        )
    }
}

/// A change as delivered to a subscription.
///
/// `node` is the state the subscription's predicate was evaluated against:
/// the post-change node for inserts, adds, updates and link sets, the
/// pre-change node for deletes, removes and link clears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Commit sequence number, shared by every event of one batch.
    pub sequence: u64,
    pub source: ChangeSource,
    pub node: Node,
    pub change: Change,
}

impl ChangeEvent {
    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }
}
