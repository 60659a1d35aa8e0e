//! JSON snapshot store.
//!
//! Keeps the whole graph in memory and rewrites one JSON file per applied
//! batch. The file is written next to its destination and renamed over it,
//! so a crash mid-write leaves the previous snapshot in place. File I/O runs
//! on tokio's blocking pool; applies are serialized so the file always
//! matches the in-memory records.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{NodeRecord, PersistentStore, StoreError, StoreOp, StoreResult, apply_ops};
use crate::model::{NodeId, NodeKind};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<NodeRecord>,
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    inner: Arc<JsonInner>,
}

#[derive(Debug)]
struct JsonInner {
    path: PathBuf,
    pretty: bool,
    records: Mutex<BTreeMap<NodeId, NodeRecord>>,
    /// Held across a whole apply, including the file write.
    writing: tokio::sync::Mutex<()>,
}

/// Marker transaction.
#[derive(Debug)]
pub struct JsonTxn(());

impl JsonFileStore {
    /// Open the snapshot at `path`. A missing file is an empty graph; the
    /// file is created on the first applied batch.
    pub fn open(path: impl AsRef<Path>, pretty: bool) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                if snapshot.version != FORMAT_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "{} has format version {}, expected {FORMAT_VERSION}",
                        path.display(),
                        snapshot.version
                    )));
                }
                snapshot.records.into_iter().map(|r| (r.id, r)).collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        info!(path = %path.display(), nodes = records.len(), "opened json store");
        Ok(Self {
            inner: Arc::new(JsonInner {
                path,
                pretty,
                records: Mutex::new(records),
                writing: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn write_snapshot(&self, records: &BTreeMap<NodeId, NodeRecord>) -> StoreResult<()> {
        let snapshot = Snapshot { version: FORMAT_VERSION, records: records.values().cloned().collect() };
        let bytes = if self.inner.pretty {
            serde_json::to_vec_pretty(&snapshot)?
        } else {
            serde_json::to_vec(&snapshot)?
        };

        let mut tmp = self.inner.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.inner.path)?;
        debug!(path = %self.inner.path.display(), bytes = bytes.len(), "wrote json snapshot");
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for JsonFileStore {
    type Txn = JsonTxn;

    async fn begin_transaction(&self) -> StoreResult<JsonTxn> {
        Ok(JsonTxn(()))
    }

    async fn apply(&self, _txn: JsonTxn, ops: Vec<StoreOp>) -> StoreResult<()> {
        let _writing = self.inner.writing.lock().await;
        let mut staged = self.inner.records.lock().clone();
        apply_ops(&mut staged, ops)?;

        let store = self.clone();
        let staged = tokio::task::spawn_blocking(move || store.write_snapshot(&staged).map(|()| staged))
            .await
            .map_err(std::io::Error::from)??;
        *self.inner.records.lock() = staged;
        Ok(())
    }

    async fn fetch_all(&self, kind: NodeKind, node_type: &str) -> StoreResult<Vec<NodeRecord>> {
        Ok(self
            .inner
            .records
            .lock()
            .values()
            .filter(|r| r.matches(kind, node_type))
            .cloned()
            .collect())
    }

    async fn shutdown(&self) -> StoreResult<()> {
        info!(path = %self.inner.path.display(), "closing json store");
        Ok(())
    }
}
