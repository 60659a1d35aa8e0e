//! In-memory store.
//!
//! The reference implementation of `PersistentStore`. Records live in an
//! ordered map behind a lock; `apply` works on a copy and swaps it in, so a
//! failing op list leaves the stored records untouched.
//!
//! `MemoryStore` is a cheap handle: clones share the same records, which is
//! how tests inspect what a graph persisted or reopen a graph over the same
//! data.
//!
//! ## Limitations
//!
//! - **No persistence**: everything is gone when the last handle drops.
//! - **Whole-map copy per apply**: fine for tests and embedding, not for
//!   large graphs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{NodeRecord, PersistentStore, StoreError, StoreOp, StoreResult, apply_ops};
use crate::model::{NodeId, NodeKind};

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: RwLock<BTreeMap<NodeId, NodeRecord>>,
    /// Reason the next `apply` fails with, if armed.
    fail_next: Mutex<Option<String>>,
    next_txn: AtomicU64,
    applied: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = NodeRecord>) -> Self {
        let store = Self::new();
        store.inner.records.write().extend(records.into_iter().map(|r| (r.id, r)));
        store
    }

    /// Make the next `apply` fail with `StoreError::Rejected(reason)`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.inner.fail_next.lock() = Some(reason.into());
    }

    /// Copy of the stored records, in id order.
    pub fn records(&self) -> Vec<NodeRecord> {
        self.inner.records.read().values().cloned().collect()
    }

    pub fn record(&self, id: NodeId) -> Option<NodeRecord> {
        self.inner.records.read().get(&id).cloned()
    }

    /// Number of successful `apply` calls.
    pub fn applied_batches(&self) -> u64 {
        self.inner.applied.load(Ordering::Acquire)
    }
}

// ============================================================================
// MemoryTxn
// ============================================================================

/// Marker transaction; the memory store has nothing to stage.
#[derive(Debug)]
pub struct MemoryTxn {
    id: u64,
}

impl MemoryTxn {
    pub fn id(&self) -> u64 {
        self.id
    }
}

// ============================================================================
// PersistentStore impl
// ============================================================================

#[async_trait]
impl PersistentStore for MemoryStore {
    type Txn = MemoryTxn;

    async fn begin_transaction(&self) -> StoreResult<MemoryTxn> {
        let id = self.inner.next_txn.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MemoryTxn { id })
    }

    async fn apply(&self, _txn: MemoryTxn, ops: Vec<StoreOp>) -> StoreResult<()> {
        if let Some(reason) = self.inner.fail_next.lock().take() {
            return Err(StoreError::Rejected(reason));
        }
        let mut records = self.inner.records.write();
        let mut staged = records.clone();
        apply_ops(&mut staged, ops)?;
        *records = staged;
        self.inner.applied.fetch_add(1, Ordering::Release);
        Ok(())
    }

    async fn fetch_all(&self, kind: NodeKind, node_type: &str) -> StoreResult<Vec<NodeRecord>> {
        Ok(self
            .inner
            .records
            .read()
            .values()
            .filter(|r| r.matches(kind, node_type))
            .cloned()
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
