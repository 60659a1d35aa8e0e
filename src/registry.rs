//! Named graph registry.
//!
//! An explicit, owned map from graph name to open [`Graph`]. Applications
//! that need one graph per name create a registry once and pass it around;
//! there is no process-global instance.

use std::future::Future;

use hashbrown::HashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::storage::PersistentStore;
use crate::{Graph, Result};

pub struct GraphRegistry<B: PersistentStore> {
    graphs: Mutex<HashMap<String, Graph<B>>>,
}

impl<B: PersistentStore> Default for GraphRegistry<B> {
    fn default() -> Self {
        Self { graphs: Mutex::new(HashMap::new()) }
    }
}

impl<B: PersistentStore> GraphRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The graph registered under `name`, opening it with `open` if absent.
    /// Concurrent callers for the same name get the same graph; `open` runs
    /// at most once per name while it stays registered.
    pub async fn get_or_open<F, Fut>(&self, name: &str, open: F) -> Result<Graph<B>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Graph<B>>>,
    {
        let mut graphs = self.graphs.lock().await;
        if let Some(graph) = graphs.get(name) {
            return Ok(graph.clone());
        }
        let graph = open(name.to_string()).await?;
        graphs.insert(name.to_string(), graph.clone());
        info!(graph = name, open = graphs.len(), "registered graph");
        Ok(graph)
    }

    pub async fn get(&self, name: &str) -> Option<Graph<B>> {
        self.graphs.lock().await.get(name).cloned()
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.graphs.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Unregister `name` and shut its graph down. Returns whether it was
    /// registered.
    pub async fn close(&self, name: &str) -> Result<bool> {
        let graph = self.graphs.lock().await.remove(name);
        match graph {
            Some(graph) => {
                graph.shutdown().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Shut down and unregister every graph. The first error is returned
    /// after all graphs were attempted.
    pub async fn shutdown(&self) -> Result<()> {
        let graphs: Vec<Graph<B>> = self.graphs.lock().await.drain().map(|(_, g)| g).collect();
        let mut first_err = None;
        for graph in graphs {
            if let Err(err) = graph.shutdown().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
