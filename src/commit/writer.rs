//! The per-graph writer task.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use hashbrown::HashSet;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::{ActivePhase, CommitReceipt, CommitRequest, CommitStatus, OpenHandles};
use crate::model::{Membership, NodeId};
use crate::storage::{NodeRecord, PersistentStore, StoreOp, StoreResult};
use crate::store::apply::ChangeRecord;
use crate::store::{NodeStore, Replay};
use crate::tx::{Mutation, TxId};
use crate::watch::{self, Change, ChangeEvent, ChangeSource};
use crate::{Error, Graph, GraphInner, Result};

/// Drain commit requests in submission order until the queue is closed and
/// empty.
///
/// The graph itself is held until then, so a commit handed over before the
/// last handle dropped still reaches the store. User handles are only
/// tracked weakly; once they are all gone the queue closes and this loop
/// ends after the backlog.
pub(crate) async fn run<B: PersistentStore>(
    mut requests: UnboundedReceiver<CommitRequest>,
    inner: Arc<GraphInner<B>>,
    handles: Weak<OpenHandles>,
) {
    while let Some(request) = requests.recv().await {
        let handles = handles
            .upgrade()
            .unwrap_or_else(|| Arc::new(OpenHandles::new(Arc::clone(&inner.coordinator))));
        let graph = Graph { inner: Arc::clone(&inner), handles };
        let CommitRequest { tx, source, ops, completion } = request;
        let result = process(&graph, tx, source, ops).await;
        completion.complete(result);
    }
    debug!(graph = %inner.name, "commit writer stopped");
}

/// Returns the pipeline to `Idle` however `process` exits.
struct IdleOnExit<'a>(&'a CommitStatus);

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        self.0.set_phase(ActivePhase::Idle);
    }
}

async fn process<B: PersistentStore>(
    graph: &Graph<B>,
    tx: TxId,
    source: ChangeSource,
    ops: Vec<Mutation>,
) -> Result<CommitReceipt> {
    let inner = &graph.inner;
    let status = inner.coordinator.status();
    status.queued.fetch_sub(1, Ordering::AcqRel);
    status.set_phase(ActivePhase::Committing);
    let _idle = IdleOnExit(status);
    debug!(graph = %inner.name, %tx, mutations = ops.len(), "committing batch");

    let base = graph.snapshot();
    let Replay { store, records, skipped } = base.replay(&ops);

    if records.is_empty() {
        debug!(graph = %inner.name, %tx, skipped, "batch has no logical change");
        return Ok(CommitReceipt { tx, sequence: status.sequence(), events: 0, created: Vec::new(), skipped });
    }

    let changes = watch::compile(&records, &store);
    let store_ops = derive_store_ops(&records, &store);

    if let Err(err) = persist(&inner.store, store_ops).await {
        warn!(graph = %inner.name, %tx, error = %err, "store rejected batch, discarding");
        return Err(Error::StoreFailure(err));
    }

    let sequence = status.next_sequence();
    let created: Vec<NodeId> = changes
        .iter()
        .filter(|(_, change)| matches!(change, Change::Inserted))
        .map(|(node, _)| node.id())
        .collect();
    *inner.snapshot.write() = Arc::new(store);

    status.set_phase(ActivePhase::Notifying);
    let events: Vec<ChangeEvent> = changes
        .into_iter()
        .map(|(node, change)| ChangeEvent { sequence, source, node, change })
        .collect();
    inner.watchers.dispatch(graph, &events);

    debug!(graph = %inner.name, %tx, sequence, events = events.len(), "batch committed");
    Ok(CommitReceipt { tx, sequence, events: events.len(), created, skipped })
}

async fn persist<B: PersistentStore>(store: &B, ops: Vec<StoreOp>) -> StoreResult<()> {
    let txn = store.begin_transaction().await?;
    store.apply(txn, ops).await
}

/// Translate change records into store writes.
///
/// Nodes created by the batch are written once, in their final state, ahead
/// of every other op. Everything else follows in record order so the store
/// ends up exactly where the snapshot did.
fn derive_store_ops(records: &[ChangeRecord], committed: &NodeStore) -> Vec<StoreOp> {
    let fresh: HashSet<NodeId> = records
        .iter()
        .filter(|r| matches!(r.change, Change::Inserted))
        .map(|r| r.node.id())
        .collect();

    let mut ops: Vec<StoreOp> = records
        .iter()
        .filter(|r| matches!(r.change, Change::Inserted))
        .filter_map(|r| committed.get(r.node.id()))
        .map(|node| StoreOp::Create(NodeRecord::from(node)))
        .collect();

    for record in records.iter().filter(|r| !fresh.contains(&r.node.id())) {
        let id = record.node.id();
        let op = match &record.change {
            Change::Inserted => continue,
            Change::Deleted => StoreOp::Delete { id },
            Change::PropertyAdded { name, value } | Change::PropertyUpdated { name, new: value, .. } => {
                StoreOp::UpdateProperty { id, name: name.clone(), value: Some(value.clone()) }
            }
            Change::PropertyRemoved { name, .. } => StoreOp::UpdateProperty { id, name: name.clone(), value: None },
            Change::TagAdded(name) => membership(id, Membership::Tag, name, true),
            Change::TagRemoved(name) => membership(id, Membership::Tag, name, false),
            Change::GroupAdded(name) => membership(id, Membership::Group, name, true),
            Change::GroupRemoved(name) => membership(id, Membership::Group, name, false),
            Change::LinkChanged { slot, new, .. } => StoreOp::UpdateLink { id, slot: *slot, target: *new },
        };
        ops.push(op);
    }
    ops
}

fn membership(id: NodeId, set: Membership, name: &str, present: bool) -> StoreOp {
    StoreOp::UpdateMembership { id, set, name: name.to_string(), present }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinkSlot, NodeKind, Value};
    use chrono::Utc;

    fn create(id: u64, kind: NodeKind) -> Mutation {
        Mutation::Create { id: NodeId(id), kind, node_type: "T".into(), created_at: Utc::now() }
    }

    #[test]
    fn test_created_nodes_are_written_once_in_final_state() {
        let replay = NodeStore::new().replay(&[
            create(1, NodeKind::Entity),
            Mutation::SetProperty { id: NodeId(1), name: "a".into(), value: Some(Value::from(1)) },
            Mutation::SetProperty { id: NodeId(1), name: "a".into(), value: Some(Value::from(2)) },
        ]);

        let ops = derive_store_ops(&replay.records, &replay.store);
        assert_eq!(ops.len(), 1);
        let StoreOp::Create(record) = &ops[0] else { panic!("expected create, got {ops:?}") };
        assert_eq!(record.properties.get("a"), Some(&Value::from(2)));
    }

    #[test]
    fn test_existing_nodes_follow_record_order() {
        let base = NodeStore::new()
            .replay(&[
                create(1, NodeKind::Entity),
                create(2, NodeKind::Relationship),
                Mutation::SetLink { id: NodeId(2), slot: LinkSlot::Subject, target: Some(NodeId(1)) },
            ])
            .store;
        let replay = base.replay(&[
            Mutation::SetProperty { id: NodeId(2), name: "w".into(), value: None },
            Mutation::SetProperty { id: NodeId(2), name: "w".into(), value: Some(Value::from(1)) },
            Mutation::SetProperty { id: NodeId(2), name: "w".into(), value: None },
            Mutation::SetProperty { id: NodeId(2), name: "w".into(), value: Some(Value::from(3)) },
            Mutation::Delete { id: NodeId(1) },
        ]);

        let ops = derive_store_ops(&replay.records, &replay.store);
        assert_eq!(
            ops,
            vec![
                StoreOp::UpdateProperty { id: NodeId(2), name: "w".into(), value: Some(Value::from(1)) },
                StoreOp::UpdateProperty { id: NodeId(2), name: "w".into(), value: None },
                StoreOp::UpdateProperty { id: NodeId(2), name: "w".into(), value: Some(Value::from(3)) },
                StoreOp::UpdateLink { id: NodeId(2), slot: LinkSlot::Subject, target: None },
                StoreOp::Delete { id: NodeId(1) },
            ]
        );
    }
}
