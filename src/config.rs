//! Graph configuration.
//!
//! ```json
//! {
//!   "name": "social",
//!   "backend": { "kind": "json_file", "path": "/var/lib/social.json", "pretty": true },
//!   "hydrate": true
//! }
//! ```
//!
//! `backend` defaults to the in-memory store and `hydrate` to `true`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::BackendConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub name: String,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Load the store's existing records when the graph opens.
    #[serde(default = "default_hydrate")]
    pub hydrate: bool,
}

fn default_hydrate() -> bool {
    true
}

impl GraphConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), backend: BackendConfig::default(), hydrate: true }
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_hydrate(mut self, hydrate: bool) -> Self {
        self.hydrate = hydrate;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: GraphConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("graph name must not be empty".into()));
        }
        Ok(())
    }
}
