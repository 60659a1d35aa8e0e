//! Mutation replay.
//!
//! A batch is an ordered log of [`Mutation`]s. The same replay function
//! runs twice: once against the batch's own overlay when the caller issues
//! the mutation (validation and read-your-writes), and once at commit time
//! against a copy of the newest committed snapshot, where it decides the
//! logical effect of every mutation.

use crate::model::{LinkSlot, Membership, Node, NodeId};
use crate::tx::{MembershipOp, Mutation};
use crate::watch::Change;
use crate::{Error, Result};

/// Node storage a mutation log can be replayed onto.
pub(crate) trait NodeSource {
    fn node(&self, id: NodeId) -> Option<&Node>;

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node>;

    fn insert(&mut self, node: Node);

    fn remove(&mut self, id: NodeId) -> Option<Node>;

    /// Link nodes that currently reference `id`, with the slot they use.
    fn referrers_of(&self, id: NodeId) -> Vec<(NodeId, LinkSlot)>;

    /// Called once per produced record, after the mutation completed.
    fn observe(&mut self, _record: &ChangeRecord) {}
}

/// A logical change with the node state watchers evaluate it against.
#[derive(Debug, Clone)]
pub(crate) struct ChangeRecord {
    /// Position of the originating mutation in the batch log.
    pub seq: usize,
    pub node: Node,
    pub change: Change,
}

fn missing(id: NodeId) -> Error {
    Error::NotFound(format!("Node {id}"))
}

/// Apply one mutation. No-ops push nothing. A mutation that fails leaves
/// the source untouched.
pub(crate) fn apply<S: NodeSource>(
    src: &mut S,
    seq: usize,
    op: &Mutation,
    out: &mut Vec<ChangeRecord>,
) -> Result<()> {
    let start = out.len();

    match op {
        Mutation::Create { id, kind, node_type, created_at } => {
            if src.node(*id).is_some() {
                return Err(Error::InvalidOperation(format!("Node {id} already exists")));
            }
            let node = Node::new(*id, *kind, node_type.clone(), *created_at);
            out.push(ChangeRecord { seq, node: node.clone(), change: Change::Inserted });
            src.insert(node);
        }

        Mutation::SetProperty { id, name, value } => {
            let node = src.node_mut(*id).ok_or_else(|| missing(*id))?;
            match (node.properties.get(name).cloned(), value) {
                (None, None) => {}
                (None, Some(new)) => {
                    node.properties.insert(name.clone(), new.clone());
                    out.push(ChangeRecord {
                        seq,
                        node: node.clone(),
                        change: Change::PropertyAdded { name: name.clone(), value: new.clone() },
                    });
                }
                (Some(old), Some(new)) if old == *new => {}
                (Some(old), Some(new)) => {
                    node.properties.insert(name.clone(), new.clone());
                    out.push(ChangeRecord {
                        seq,
                        node: node.clone(),
                        change: Change::PropertyUpdated { name: name.clone(), old, new: new.clone() },
                    });
                }
                (Some(old), None) => {
                    let prior = node.clone();
                    node.properties.remove(name);
                    out.push(ChangeRecord {
                        seq,
                        node: prior,
                        change: Change::PropertyRemoved { name: name.clone(), old },
                    });
                }
            }
        }

        Mutation::Membership { id, set, name, op } => {
            let node = src.node_mut(*id).ok_or_else(|| missing(*id))?;
            let present = node.members(*set).contains(name);
            let add = match op {
                MembershipOp::Add if present => None,
                MembershipOp::Remove if !present => None,
                MembershipOp::Add => Some(true),
                MembershipOp::Remove => Some(false),
                MembershipOp::Toggle => Some(!present),
            };
            match add {
                None => {}
                Some(true) => {
                    node.members_mut(*set).insert(name.clone());
                    let change = match set {
                        Membership::Tag => Change::TagAdded(name.clone()),
                        Membership::Group => Change::GroupAdded(name.clone()),
                    };
                    out.push(ChangeRecord { seq, node: node.clone(), change });
                }
                Some(false) => {
                    let prior = node.clone();
                    node.members_mut(*set).remove(name);
                    let change = match set {
                        Membership::Tag => Change::TagRemoved(name.clone()),
                        Membership::Group => Change::GroupRemoved(name.clone()),
                    };
                    out.push(ChangeRecord { seq, node: prior, change });
                }
            }
        }

        Mutation::SetLink { id, slot, target } => {
            if let Some(target) = target {
                if src.node(*target).is_none() {
                    return Err(missing(*target));
                }
            }
            let node = src.node_mut(*id).ok_or_else(|| missing(*id))?;
            if !node.kind().is_link() {
                return Err(Error::InvalidOperation(format!(
                    "{} {id} has no {slot} link",
                    node.kind()
                )));
            }
            let old = node.link(*slot);
            if old != *target {
                let prior = node.clone();
                node.set_link(*slot, *target);
                let state = if target.is_some() { node.clone() } else { prior };
                out.push(ChangeRecord {
                    seq,
                    node: state,
                    change: Change::LinkChanged { slot: *slot, old, new: *target },
                });
            }
        }

        Mutation::Delete { id } => {
            if src.node(*id).is_none() {
                return Err(missing(*id));
            }
            // Referencing links are cleared, the referencing nodes survive.
            for (referrer, slot) in src.referrers_of(*id) {
                if referrer == *id {
                    continue;
                }
                if let Some(link) = src.node_mut(referrer) {
                    let prior = link.clone();
                    link.set_link(slot, None);
                    out.push(ChangeRecord {
                        seq,
                        node: prior,
                        change: Change::LinkChanged { slot, old: Some(*id), new: None },
                    });
                }
            }
            let node = src.remove(*id).ok_or_else(|| missing(*id))?;
            out.push(ChangeRecord { seq, node, change: Change::Deleted });
        }
    }

    for record in &out[start..] {
        src.observe(record);
    }
    Ok(())
}
