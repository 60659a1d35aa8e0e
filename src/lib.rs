//! # nodegraph: Embedded Typed Object Graph
//!
//! Typed nodes (entities, plus the relationship and bond kinds that link
//! two nodes) carrying properties, tags and group memberships, with
//! indexed predicate queries and fine-grained change notifications.
//!
//! ## Design Principles
//!
//! 1. **Snapshots, not locks**: readers get an `Arc<NodeStore>`; every commit
//!    replays onto a copy and swaps it in whole
//! 2. **One writer per graph**: commits are FIFO through a single task and
//!    land in a `PersistentStore` before anyone sees them
//! 3. **Clean DTOs**: `Node`, `Value`, `ChangeEvent` cross every boundary
//! 4. **Ids, not references**: links are `NodeId`s, resolved through the store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nodegraph::{Graph, NodeKind, Predicate};
//!
//! # async fn example() -> nodegraph::Result<()> {
//! let graph = Graph::open_memory("social").await?;
//!
//! graph.watch(Predicate::tagged(["vip"]), |_graph, event| {
//!     println!("{:?} on node {}", event.change, event.node_id());
//! });
//!
//! let mut batch = graph.batch();
//! let ada = batch.create_entity("User")?;
//! batch.set_property(ada, "name", "Ada")?;
//! batch.add_tags(ada, ["vip"])?;
//! let bob = batch.create_entity("User")?;
//! batch.create_link(NodeKind::Relationship, "Follows", Some(bob), Some(ada))?;
//! graph.commit(batch).await?;
//!
//! let vips = graph.search().filter(Predicate::of_type(["User"]) & Predicate::tagged(["vip"])).sync();
//! assert_eq!(vips.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Stores
//!
//! | Store | Config | Description |
//! |-------|--------|-------------|
//! | `MemoryStore` | `{"kind": "memory"}` | In-process, for tests and embedding |
//! | `JsonFileStore` | `{"kind": "json_file", "path": ...}` | Whole-graph JSON snapshot |

// ============================================================================
// Modules
// ============================================================================

pub mod commit;
pub mod config;
pub mod index;
pub mod model;
pub mod query;
pub mod registry;
pub mod storage;
pub mod store;
pub mod tx;
pub mod watch;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, info};

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{LinkSlot, Membership, Node, NodeId, NodeKind, PropertyMap, Value};

// ============================================================================
// Re-exports: Index and queries
// ============================================================================

pub use index::{AttributeIndex, IdSet, Namespace, WILDCARD};
pub use query::{Combinator, Filter, Predicate, Search};
pub use store::NodeStore;

// ============================================================================
// Re-exports: Batches, commits, watches
// ============================================================================

pub use commit::{CommitHandle, CommitReceipt, CommitState};
pub use tx::{Batch, MembershipOp, Mutation, TxId};
pub use watch::{Change, ChangeEvent, ChangeSource, SubscriptionId, WatchDelegate};

// ============================================================================
// Re-exports: Storage and configuration
// ============================================================================

pub use config::GraphConfig;
pub use registry::GraphRegistry;
pub use storage::{
    AnyStore, BackendConfig, JsonFileStore, MemoryStore, NodeRecord, PersistentStore, StoreError, StoreOp,
};

use commit::{CommitCoordinator, CommitStatus, OpenHandles};
use watch::WatchRegistry;

// ============================================================================
// Top-level Graph handle
// ============================================================================

/// The primary entry point. A `Graph` is a cheap, cloneable handle over one
/// named graph: its committed snapshot, its commit writer, its watchers and
/// its store.
pub struct Graph<B: PersistentStore> {
    inner: Arc<GraphInner<B>>,
    handles: Arc<OpenHandles>,
}

pub(crate) struct GraphInner<B: PersistentStore> {
    name: String,
    store: B,
    snapshot: RwLock<Arc<NodeStore>>,
    /// Next node id. Shared with every batch so ids stay unique across
    /// concurrent batches.
    ids: Arc<AtomicU64>,
    next_tx: AtomicU64,
    coordinator: Arc<CommitCoordinator>,
    watchers: WatchRegistry<B>,
    runtime: Handle,
}

impl<B: PersistentStore> Clone for Graph<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), handles: Arc::clone(&self.handles) }
    }
}

impl<B: PersistentStore> std::fmt::Debug for Graph<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.inner.name)
            .field("nodes", &self.len())
            .field("state", &self.state())
            .finish()
    }
}

impl<B: PersistentStore> Graph<B> {
    /// Open a graph over `store`, loading whatever it already holds.
    pub async fn open(name: impl Into<String>, store: B) -> Result<Self> {
        Self::open_with(GraphConfig::new(name), store).await
    }

    /// Open with explicit configuration. `config.backend` is ignored here;
    /// the caller already chose the store.
    pub async fn open_with(config: GraphConfig, store: B) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|err| Error::Config(format!("graph '{}' needs a tokio runtime: {err}", config.name)))?;

        let snapshot = if config.hydrate {
            let mut records = Vec::new();
            for kind in NodeKind::ALL {
                records.extend(store.fetch_all(kind, WILDCARD).await?);
            }
            NodeStore::hydrate(records)
        } else {
            NodeStore::new()
        };
        let next_id = snapshot.max_id().map_or(1, |id| id.0 + 1);
        info!(graph = %config.name, nodes = snapshot.len(), next_id, "opened graph");

        let (coordinator, requests) = CommitCoordinator::new();
        let coordinator = Arc::new(coordinator);
        let handles = Arc::new(OpenHandles::new(Arc::clone(&coordinator)));
        let inner = Arc::new(GraphInner {
            name: config.name,
            store,
            snapshot: RwLock::new(Arc::new(snapshot)),
            ids: Arc::new(AtomicU64::new(next_id)),
            next_tx: AtomicU64::new(1),
            coordinator,
            watchers: WatchRegistry::new(),
            runtime,
        });
        let writer = inner.runtime.spawn(commit::run(requests, Arc::clone(&inner), Arc::downgrade(&handles)));
        inner.coordinator.attach_writer(writer);

        Ok(Self { inner, handles })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Access the underlying store (for advanced use).
    pub fn backend(&self) -> &B {
        &self.inner.store
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    // ========================================================================
    // Reads (committed state)
    // ========================================================================

    /// The current committed snapshot. Stays valid and unchanged however
    /// many commits land after it was taken.
    pub fn snapshot(&self) -> Arc<NodeStore> {
        self.inner.snapshot.read().clone()
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.inner.snapshot.read().get(id).cloned()
    }

    pub fn get(&self, id: NodeId, key: &str) -> Option<Value> {
        self.inner.snapshot.read().get(id).and_then(|n| n.get(key).cloned())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.snapshot.read().contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Link nodes whose `slot` points at `id`, in creation order.
    pub fn relationships_of(&self, id: NodeId, slot: LinkSlot) -> Vec<Node> {
        let snapshot = self.snapshot();
        snapshot
            .referrers(id, slot)
            .into_iter()
            .filter_map(|r| snapshot.get(r).cloned())
            .collect()
    }

    /// Node types currently in use, sorted.
    pub fn types(&self) -> Vec<String> {
        self.inner.snapshot.read().index().keys(Namespace::Type)
    }

    pub fn tags(&self) -> Vec<String> {
        self.inner.snapshot.read().index().keys(Namespace::Tag)
    }

    pub fn groups(&self) -> Vec<String> {
        self.inner.snapshot.read().index().keys(Namespace::Group)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn search(&self) -> Search<'_, B> {
        Search::new(self)
    }

    /// Shorthand for `search().filter(predicate).sync()`.
    pub fn query(&self, predicate: Predicate) -> Vec<Node> {
        self.search().filter(predicate).sync()
    }

    // ========================================================================
    // Batches and commits
    // ========================================================================

    /// Open a working batch over the current snapshot.
    pub fn batch(&self) -> Batch {
        let tx = TxId(self.inner.next_tx.fetch_add(1, Ordering::Relaxed));
        let guard = CommitStatus::open_batch(self.inner.coordinator.status());
        Batch::new(tx, self.snapshot(), Arc::clone(&self.inner.ids), guard)
    }

    /// Queue `batch` for commit. Submission order is call order.
    pub fn commit(&self, batch: Batch) -> CommitHandle {
        let tx = batch.tx();
        let (completion, rx) = CommitCoordinator::handle();
        self.inner.coordinator.enqueue(batch, completion);
        CommitCoordinator::handle_for(tx, rx)
    }

    /// Like [`commit`](Self::commit), reporting the outcome to `callback` on
    /// the writer task instead of through a handle.
    pub fn commit_with<F>(&self, batch: Batch, callback: F)
    where
        F: FnOnce(Result<CommitReceipt>) + Send + 'static,
    {
        self.inner.coordinator.enqueue(batch, CommitCoordinator::callback(callback));
    }

    /// Commit a batch that mirrors changes made elsewhere. Its events carry
    /// [`ChangeSource::External`].
    pub fn apply_external(&self, mut batch: Batch) -> CommitHandle {
        batch.source = ChangeSource::External;
        self.commit(batch)
    }

    pub fn state(&self) -> CommitState {
        self.inner.coordinator.status().state()
    }

    /// Sequence number of the newest committed batch.
    pub fn sequence(&self) -> u64 {
        self.inner.coordinator.status().sequence()
    }

    // ========================================================================
    // Watches
    // ========================================================================

    /// Call `callback` for every committed change whose node matches
    /// `predicate`. Callbacks run on the commit writer, in event order.
    ///
    /// Events within one commit are grouped by phase, not by the order the
    /// batch issued them: all tag adds come before all tag removes, and so
    /// on. A batch that removes a tag and then re-adds it therefore yields
    /// `TagAdded` followed by `TagRemoved`, although the tag is present
    /// afterwards. Read the current state from the event's graph instead of
    /// folding events into a local copy.
    ///
    /// A panicking callback is logged and skipped; the commit and the
    /// remaining deliveries are unaffected.
    pub fn watch<F>(&self, predicate: Predicate, callback: F) -> SubscriptionId
    where
        F: Fn(&Graph<B>, &ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.watchers.subscribe(predicate, Arc::new(callback))
    }

    pub fn watch_delegate<D>(&self, predicate: Predicate, delegate: D) -> SubscriptionId
    where
        D: WatchDelegate<B>,
    {
        let delegate = Arc::new(delegate);
        self.watch(predicate, move |graph, event| watch::delegate::forward(&*delegate, graph, event))
    }

    pub fn unwatch(&self, id: SubscriptionId) -> bool {
        self.inner.watchers.unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.watchers.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop accepting commits, drain the queue, drop every subscription and
    /// shut the store down. Commits issued afterwards fail with
    /// [`Error::Closed`]. Must not be awaited from a watch callback.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.coordinator.is_closed() {
            return Ok(());
        }
        if let Some(writer) = self.inner.coordinator.close() {
            if let Err(err) = writer.await {
                debug!(graph = %self.inner.name, error = %err, "commit writer ended abnormally");
            }
        }
        self.inner.watchers.clear();
        self.inner.store.shutdown().await?;
        info!(graph = %self.inner.name, sequence = self.sequence(), "graph shut down");
        Ok(())
    }
}

/// In-memory graph for testing and embedding.
impl Graph<MemoryStore> {
    pub async fn open_memory(name: impl Into<String>) -> Result<Self> {
        Self::open(name, MemoryStore::new()).await
    }
}

/// Graph whose store is chosen by configuration.
impl Graph<AnyStore> {
    pub async fn open_with_config(config: GraphConfig) -> Result<Self> {
        config.validate()?;
        let store = config.backend.open()?;
        Self::open_with(config, store).await
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store failure: {0}")]
    StoreFailure(#[from] StoreError),

    #[error("Graph is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
