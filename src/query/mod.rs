//! # Query Engine
//!
//! Predicate evaluation over a committed snapshot's [`AttributeIndex`](crate::index::AttributeIndex).
//!
//! ```rust,no_run
//! use nodegraph::{Graph, Predicate};
//!
//! # async fn example() -> nodegraph::Result<()> {
//! let graph = Graph::open_memory("people").await?;
//! let vips = graph
//!     .search()
//!     .filter(Predicate::of_type(["User"]))
//!     .filter(Predicate::tagged(["vip", "staff"]))
//!     .limit(10)
//!     .sync();
//! # Ok(())
//! # }
//! ```
//!
//! Results always come back in node creation order. Queries never fail:
//! empty name lists, unknown keys and a search with no predicate all
//! resolve to the empty result.

pub mod predicate;

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::model::{Node, NodeId};
use crate::storage::PersistentStore;
use crate::store::NodeStore;
use crate::Graph;

pub use predicate::{Combinator, Filter, Predicate};

/// Builder for one query. Obtained from [`Graph::search`].
#[must_use = "a search does nothing until a terminal method is called"]
pub struct Search<'g, B: PersistentStore> {
    graph: &'g Graph<B>,
    predicate: Option<Predicate>,
    limit: Option<usize>,
}

impl<'g, B: PersistentStore> Search<'g, B> {
    pub(crate) fn new(graph: &'g Graph<B>) -> Self {
        Self { graph, predicate: None, limit: None }
    }

    /// AND `p` onto the accumulated predicate.
    pub fn filter(mut self, p: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(acc) => acc & p,
            None => p,
        });
        self
    }

    /// OR `p` onto the accumulated predicate.
    pub fn or(mut self, p: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(acc) => acc | p,
            None => p,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    /// Matching nodes from the current snapshot.
    pub fn sync(self) -> Vec<Node> {
        let snapshot = self.graph.snapshot();
        resolve(&snapshot, self.predicate.as_ref(), self.limit)
    }

    pub fn ids(self) -> Vec<NodeId> {
        let snapshot = self.graph.snapshot();
        matching_ids(&snapshot, self.predicate.as_ref(), self.limit)
    }

    pub fn count(self) -> usize {
        self.ids().len()
    }

    pub fn first(self) -> Option<Node> {
        self.limit(1).sync().into_iter().next()
    }

    /// Run the query off the calling thread and hand the result to
    /// `callback`, exactly once. The snapshot is captured now, so commits
    /// landing before the task runs are not visible to it.
    pub fn async_with<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Vec<Node>) + Send + 'static,
    {
        let snapshot = self.graph.snapshot();
        let predicate = self.predicate;
        let limit = self.limit;
        self.graph
            .runtime()
            .spawn_blocking(move || callback(resolve(&snapshot, predicate.as_ref(), limit)))
    }
}

fn matching_ids(snapshot: &NodeStore, predicate: Option<&Predicate>, limit: Option<usize>) -> Vec<NodeId> {
    let Some(predicate) = predicate else {
        return Vec::new();
    };
    let ids = predicate.evaluate(snapshot.index());
    ids.into_iter().take(limit.unwrap_or(usize::MAX)).collect()
}

fn resolve(snapshot: &Arc<NodeStore>, predicate: Option<&Predicate>, limit: Option<usize>) -> Vec<Node> {
    matching_ids(snapshot, predicate, limit)
        .into_iter()
        .filter_map(|id| snapshot.get(id).cloned())
        .collect()
}
