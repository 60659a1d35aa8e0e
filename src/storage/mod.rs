//! # Persistent Store Contract
//!
//! The boundary between the graph and whatever durably keeps its nodes.
//! The commit writer derives a list of [`StoreOp`]s from every batch and
//! hands them to [`PersistentStore::apply`], which must apply all of them
//! or none.
//!
//! ## Implementations
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | `MemoryStore` | `memory` | Shared in-process map, failure injection for tests |
//! | `JsonFileStore` | `json` | Whole-graph JSON snapshot on disk |
//! | `AnyStore` | here | Enum dispatch over the above, chosen by `BackendConfig` |

pub mod json;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::index::WILDCARD;
use crate::model::{LinkSlot, Membership, Node, NodeId, NodeKind, PropertyMap, Value};

pub use json::{JsonFileStore, JsonTxn};
pub use memory::{MemoryStore, MemoryTxn};

// ============================================================================
// Records and operations
// ============================================================================

/// Flat, serializable form of a node as persisted by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub kind: NodeKind,
    pub node_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub subject: Option<NodeId>,
    #[serde(default)]
    pub object: Option<NodeId>,
}

impl NodeRecord {
    pub fn matches(&self, kind: NodeKind, node_type: &str) -> bool {
        self.kind == kind && (node_type == WILDCARD || self.node_type == node_type)
    }
}

impl From<&Node> for NodeRecord {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            kind: node.kind,
            node_type: node.node_type.clone(),
            created_at: node.created_at,
            properties: node.properties.clone(),
            tags: node.tags.clone(),
            groups: node.groups.clone(),
            subject: node.subject,
            object: node.object,
        }
    }
}

impl From<NodeRecord> for Node {
    fn from(record: NodeRecord) -> Self {
        let mut node = Node::new(record.id, record.kind, record.node_type, record.created_at);
        node.properties = record.properties;
        node.tags = record.tags;
        node.groups = record.groups;
        if record.kind.is_link() {
            node.subject = record.subject;
            node.object = record.object;
        }
        node
    }
}

/// One write handed to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOp {
    /// A node created in the batch, in its end-of-batch state.
    Create(NodeRecord),
    UpdateProperty {
        id: NodeId,
        name: String,
        value: Option<Value>,
    },
    UpdateMembership {
        id: NodeId,
        set: Membership,
        name: String,
        present: bool,
    },
    UpdateLink {
        id: NodeId,
        slot: LinkSlot,
        target: Option<NodeId>,
    },
    Delete {
        id: NodeId,
    },
}

impl StoreOp {
    pub fn target(&self) -> NodeId {
        match self {
            StoreOp::Create(record) => record.id,
            StoreOp::UpdateProperty { id, .. }
            | StoreOp::UpdateMembership { id, .. }
            | StoreOp::UpdateLink { id, .. }
            | StoreOp::Delete { id } => *id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store rejected the write: {0}")]
    Rejected(String),

    #[error("Store data is corrupt: {0}")]
    Corrupt(String),

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Apply `ops` to a record map. Any op that does not fit the current
/// records fails the whole list; callers apply to a copy and swap.
pub(crate) fn apply_ops(records: &mut BTreeMap<NodeId, NodeRecord>, ops: Vec<StoreOp>) -> StoreResult<()> {
    for op in ops {
        let target = op.target();
        match op {
            StoreOp::Create(record) => {
                if records.contains_key(&record.id) {
                    return Err(StoreError::Rejected(format!("node {target} already stored")));
                }
                records.insert(record.id, record);
            }
            StoreOp::Delete { id } => {
                if records.remove(&id).is_none() {
                    return Err(StoreError::Rejected(format!("node {target} not stored")));
                }
            }
            op => {
                let record = records
                    .get_mut(&target)
                    .ok_or_else(|| StoreError::Rejected(format!("node {target} not stored")))?;
                match op {
                    StoreOp::UpdateProperty { name, value: Some(value), .. } => {
                        record.properties.insert(name, value);
                    }
                    StoreOp::UpdateProperty { name, value: None, .. } => {
                        record.properties.remove(&name);
                    }
                    StoreOp::UpdateMembership { set, name, present, .. } => {
                        let members = match set {
                            Membership::Tag => &mut record.tags,
                            Membership::Group => &mut record.groups,
                        };
                        if present {
                            members.insert(name);
                        } else {
                            members.remove(&name);
                        }
                    }
                    StoreOp::UpdateLink { slot, target, .. } => match slot {
                        LinkSlot::Subject => record.subject = target,
                        LinkSlot::Object => record.object = target,
                    },
                    StoreOp::Create(_) | StoreOp::Delete { .. } => {}
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// PersistentStore Trait
// ============================================================================

/// The durable storage contract.
///
/// Called only from a graph's single commit writer, so implementations see
/// one `apply` at a time per graph.
#[async_trait]
pub trait PersistentStore: Send + Sync + 'static {
    /// Store-side transaction handle.
    type Txn: Send;

    async fn begin_transaction(&self) -> StoreResult<Self::Txn>;

    /// Apply every op or none of them.
    async fn apply(&self, txn: Self::Txn, ops: Vec<StoreOp>) -> StoreResult<()>;

    /// Persisted nodes of `kind`, restricted to `node_type` unless it is `"*"`.
    async fn fetch_all(&self, kind: NodeKind, node_type: &str) -> StoreResult<Vec<NodeRecord>>;

    /// Flush and release resources.
    async fn shutdown(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ============================================================================
// Backend Configuration
// ============================================================================

/// Which store a graph opened from configuration uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-memory (no persistence)
    #[default]
    Memory,

    /// JSON snapshot file
    JsonFile {
        path: PathBuf,
        #[serde(default)]
        pretty: bool,
    },
}

impl BackendConfig {
    pub fn open(&self) -> StoreResult<AnyStore> {
        match self {
            BackendConfig::Memory => Ok(AnyStore::Memory(MemoryStore::new())),
            BackendConfig::JsonFile { path, pretty } => Ok(AnyStore::JsonFile(JsonFileStore::open(path, *pretty)?)),
        }
    }
}

/// A store picked at runtime.
#[derive(Debug, Clone)]
pub enum AnyStore {
    Memory(MemoryStore),
    JsonFile(JsonFileStore),
}

pub enum AnyTxn {
    Memory(MemoryTxn),
    JsonFile(JsonTxn),
}

#[async_trait]
impl PersistentStore for AnyStore {
    type Txn = AnyTxn;

    async fn begin_transaction(&self) -> StoreResult<AnyTxn> {
        match self {
            AnyStore::Memory(store) => Ok(AnyTxn::Memory(store.begin_transaction().await?)),
            AnyStore::JsonFile(store) => Ok(AnyTxn::JsonFile(store.begin_transaction().await?)),
        }
    }

    async fn apply(&self, txn: AnyTxn, ops: Vec<StoreOp>) -> StoreResult<()> {
        match (self, txn) {
            (AnyStore::Memory(store), AnyTxn::Memory(txn)) => store.apply(txn, ops).await,
            (AnyStore::JsonFile(store), AnyTxn::JsonFile(txn)) => store.apply(txn, ops).await,
            _ => Err(StoreError::Rejected("transaction belongs to a different store".into())),
        }
    }

    async fn fetch_all(&self, kind: NodeKind, node_type: &str) -> StoreResult<Vec<NodeRecord>> {
        match self {
            AnyStore::Memory(store) => store.fetch_all(kind, node_type).await,
            AnyStore::JsonFile(store) => store.fetch_all(kind, node_type).await,
        }
    }

    async fn shutdown(&self) -> StoreResult<()> {
        match self {
            AnyStore::Memory(store) => store.shutdown().await,
            AnyStore::JsonFile(store) => store.shutdown().await,
        }
    }
}
