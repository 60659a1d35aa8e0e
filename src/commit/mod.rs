//! # Commit Coordinator
//!
//! Every graph owns one writer task. [`Graph::commit`](crate::Graph::commit)
//! pushes the batch onto an unbounded FIFO channel and returns at once; the
//! writer drains the channel one batch at a time:
//!
//! ```text
//! Buffering ──▶ Committing ──▶ (store ok) ──▶ snapshot swap ──▶ Notifying ──▶ Idle
//!                    │
//!                    └──────▶ (store error) ──▶ batch discarded ─────────────▶ Idle
//! ```
//!
//! Batches are never merged or reordered. A callback that commits from
//! inside a watch notification simply queues behind the current batch.

mod writer;

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::model::NodeId;
use crate::tx::{Batch, Mutation, TxId};
use crate::watch::ChangeSource;
use crate::{Error, Result};

pub(crate) use writer::run;

/// Observable phase of a graph's commit pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitState {
    /// No open batches, nothing queued, nothing in flight.
    Idle,
    /// Batches are open or queued, but no commit is in flight.
    Buffering,
    /// The writer is applying a batch to the store.
    Committing,
    /// The writer is delivering a committed batch's events.
    Notifying,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ActivePhase {
    #[default]
    Idle,
    Committing,
    Notifying,
}

/// Shared counters behind [`CommitState`].
#[derive(Debug, Default)]
pub(crate) struct CommitStatus {
    phase: Mutex<ActivePhase>,
    open_batches: AtomicUsize,
    queued: AtomicUsize,
    sequence: AtomicU64,
}

impl CommitStatus {
    pub(crate) fn state(&self) -> CommitState {
        match *self.phase.lock() {
            ActivePhase::Committing => CommitState::Committing,
            ActivePhase::Notifying => CommitState::Notifying,
            ActivePhase::Idle => {
                if self.open_batches.load(Ordering::Acquire) > 0 || self.queued.load(Ordering::Acquire) > 0 {
                    CommitState::Buffering
                } else {
                    CommitState::Idle
                }
            }
        }
    }

    pub(crate) fn open_batch(status: &Arc<Self>) -> BufferGuard {
        status.open_batches.fetch_add(1, Ordering::AcqRel);
        BufferGuard(Arc::clone(status))
    }

    /// Sequence number of the newest committed batch (0 before the first).
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: ActivePhase) {
        *self.phase.lock() = phase;
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Counts one open batch for as long as it lives.
#[derive(Debug)]
pub(crate) struct BufferGuard(Arc<CommitStatus>);

impl BufferGuard {
    fn belongs_to(&self, status: &Arc<CommitStatus>) -> bool {
        Arc::ptr_eq(&self.0, status)
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        self.0.open_batches.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Completion
// ============================================================================

/// What a successful commit did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub tx: TxId,
    /// Sequence number stamped on this batch's events. For a batch with no
    /// logical change, the sequence of the newest commit before it.
    pub sequence: u64,
    /// Number of change events produced.
    pub events: usize,
    /// Nodes created by the batch that survived it, in creation order.
    pub created: Vec<NodeId>,
    /// Mutations dropped because their target vanished under a newer snapshot.
    pub skipped: usize,
}

type CommitCallback = Box<dyn FnOnce(Result<CommitReceipt>) + Send + 'static>;

pub(crate) enum Completion {
    Handle(oneshot::Sender<Result<CommitReceipt>>),
    Callback(CommitCallback),
}

impl Completion {
    fn complete(self, result: Result<CommitReceipt>) {
        match self {
            // The caller may have dropped the handle; the commit stands.
            Completion::Handle(tx) => {
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
                    warn!("commit completion callback panicked");
                }
            }
        }
    }
}

/// Pending result of [`Graph::commit`](crate::Graph::commit).
///
/// Await it from async code, or call [`wait_blocking`](Self::wait_blocking)
/// from a plain thread. Dropping it does not cancel the commit.
#[must_use = "dropping a CommitHandle discards the commit result"]
#[derive(Debug)]
pub struct CommitHandle {
    tx: TxId,
    rx: oneshot::Receiver<Result<CommitReceipt>>,
}

impl CommitHandle {
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Block the current thread until the commit completes.
    ///
    /// Must not be called from inside an async context or a watch callback:
    /// the writer that would complete it is the one being blocked.
    pub fn wait_blocking(self) -> Result<CommitReceipt> {
        self.rx.blocking_recv().unwrap_or(Err(Error::Closed))
    }
}

impl Future for CommitHandle {
    type Output = Result<CommitReceipt>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| received.unwrap_or(Err(Error::Closed)))
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub(crate) struct CommitRequest {
    tx: TxId,
    source: ChangeSource,
    ops: Vec<Mutation>,
    completion: Completion,
}

pub(crate) struct CommitCoordinator {
    status: Arc<CommitStatus>,
    sender: Mutex<Option<mpsc::UnboundedSender<CommitRequest>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl CommitCoordinator {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<CommitRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            status: Arc::new(CommitStatus::default()),
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(None),
        };
        (coordinator, receiver)
    }

    pub(crate) fn status(&self) -> &Arc<CommitStatus> {
        &self.status
    }

    pub(crate) fn attach_writer(&self, handle: JoinHandle<()>) {
        *self.writer.lock() = Some(handle);
    }

    pub(crate) fn handle() -> (Completion, oneshot::Receiver<Result<CommitReceipt>>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Handle(tx), rx)
    }

    pub(crate) fn handle_for(tx: TxId, rx: oneshot::Receiver<Result<CommitReceipt>>) -> CommitHandle {
        CommitHandle { tx, rx }
    }

    pub(crate) fn callback(callback: impl FnOnce(Result<CommitReceipt>) + Send + 'static) -> Completion {
        Completion::Callback(Box::new(callback))
    }

    /// Queue `batch` behind every batch submitted before it.
    pub(crate) fn enqueue(&self, batch: Batch, completion: Completion) {
        if !batch.guard().belongs_to(&self.status) {
            completion.complete(Err(Error::InvalidOperation(format!(
                "{} was opened on a different graph",
                batch.tx()
            ))));
            return;
        }
        let tx = batch.tx();
        let source = batch.source();

        // Count the commit as queued before the batch stops counting as
        // open, so the state never dips to Idle in between.
        self.status.queued.fetch_add(1, Ordering::AcqRel);
        let ops = batch.into_mutations();

        let request = CommitRequest { tx, source, ops, completion };
        let sender = self.sender.lock();
        let rejected = match sender.as_ref() {
            Some(sender) => sender.send(request).err().map(|err| err.0),
            None => Some(request),
        };
        drop(sender);
        if let Some(request) = rejected {
            self.status.queued.fetch_sub(1, Ordering::AcqRel);
            request.completion.complete(Err(Error::Closed));
        }
    }

    /// Stop accepting commits. Already queued batches still drain; the
    /// returned handle finishes when the writer has.
    pub(crate) fn close(&self) -> Option<JoinHandle<()>> {
        self.sender.lock().take();
        self.writer.lock().take()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Shared by every user-facing clone of a graph. Dropping the last one
/// closes the queue; the writer drains what was already submitted and then
/// exits, releasing the graph.
pub(crate) struct OpenHandles(Arc<CommitCoordinator>);

impl OpenHandles {
    pub(crate) fn new(coordinator: Arc<CommitCoordinator>) -> Self {
        Self(coordinator)
    }
}

impl Drop for OpenHandles {
    fn drop(&mut self) {
        // Detaches the writer; it still finishes the queue.
        let _ = self.0.close();
    }
}
