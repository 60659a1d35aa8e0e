//! Delegate-style watching.
//!
//! For callers that prefer one method per event kind over matching on
//! [`Change`]. Every method defaults to doing nothing.

use crate::Graph;
use crate::model::{LinkSlot, Node, NodeId, Value};
use crate::storage::PersistentStore;

use super::{Change, ChangeEvent, ChangeSource};

#[allow(unused_variables)]
pub trait WatchDelegate<B: PersistentStore>: Send + Sync + 'static {
    fn inserted(&self, graph: &Graph<B>, node: &Node, source: ChangeSource) {}

    /// `node` is the state just before the delete.
    fn deleted(&self, graph: &Graph<B>, node: &Node, source: ChangeSource) {}

    fn property_added(&self, graph: &Graph<B>, node: &Node, name: &str, value: &Value, source: ChangeSource) {}

    fn property_updated(
        &self,
        graph: &Graph<B>,
        node: &Node,
        name: &str,
        old: &Value,
        new: &Value,
        source: ChangeSource,
    ) {
    }

    fn property_removed(&self, graph: &Graph<B>, node: &Node, name: &str, old: &Value, source: ChangeSource) {}

    fn tag_added(&self, graph: &Graph<B>, node: &Node, tag: &str, source: ChangeSource) {}

    fn tag_removed(&self, graph: &Graph<B>, node: &Node, tag: &str, source: ChangeSource) {}

    fn group_added(&self, graph: &Graph<B>, node: &Node, group: &str, source: ChangeSource) {}

    fn group_removed(&self, graph: &Graph<B>, node: &Node, group: &str, source: ChangeSource) {}

    fn link_changed(
        &self,
        graph: &Graph<B>,
        node: &Node,
        slot: LinkSlot,
        old: Option<NodeId>,
        new: Option<NodeId>,
        source: ChangeSource,
    ) {
    }
}

/// Route one event to the matching delegate method.
pub(crate) fn forward<B, D>(delegate: &D, graph: &Graph<B>, event: &ChangeEvent)
where
    B: PersistentStore,
    D: WatchDelegate<B> + ?Sized,
{
    let node = &event.node;
    let source = event.source;
    match &event.change {
        Change::Inserted => delegate.inserted(graph, node, source),
        Change::Deleted => delegate.deleted(graph, node, source),
        Change::PropertyAdded { name, value } => delegate.property_added(graph, node, name, value, source),
        Change::PropertyUpdated { name, old, new } => delegate.property_updated(graph, node, name, old, new, source),
        Change::PropertyRemoved { name, old } => delegate.property_removed(graph, node, name, old, source),
        Change::TagAdded(tag) => delegate.tag_added(graph, node, tag, source),
        Change::TagRemoved(tag) => delegate.tag_removed(graph, node, tag, source),
        Change::GroupAdded(group) => delegate.group_added(graph, node, group, source),
        Change::GroupRemoved(group) => delegate.group_removed(graph, node, group, source),
        Change::LinkChanged { slot, old, new } => delegate.link_changed(graph, node, *slot, *old, *new, source),
    }
}
