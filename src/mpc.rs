//! Message partition channel registry.

use crate::config::As4Config;
use crate::error::As4Error;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Identifier of the ebMS3 default channel.
pub const DEFAULT_MPC_ID: &str = "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/defaultMPC";

/// A message partition channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mpc {
    pub id: String,
    #[serde(default)]
    pub is_default: bool,
}

impl Mpc {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_default: false,
        }
    }

    /// The ebMS3 default channel.
    pub fn default_mpc() -> Self {
        Self {
            id: DEFAULT_MPC_ID.to_string(),
            is_default: true,
        }
    }
}

struct Channels {
    by_id: BTreeMap<String, Mpc>,
    default_id: String,
}

/// Registry of known channels; exactly one is the default.
pub struct MpcRegistry {
    inner: RwLock<Channels>,
}

impl MpcRegistry {
    /// Build a registry. Fails unless exactly one channel is marked default.
    pub fn new(mpcs: impl IntoIterator<Item = Mpc>) -> Result<Self, As4Error> {
        let mut by_id = BTreeMap::new();
        let mut default_id: Option<String> = None;

        for mpc in mpcs {
            if mpc.id.trim().is_empty() {
                return Err(As4Error::Config("MPC id must not be blank".to_string()));
            }
            if mpc.is_default {
                if let Some(ref existing) = default_id {
                    return Err(As4Error::Config(format!(
                        "more than one default MPC: '{}' and '{}'",
                        existing, mpc.id
                    )));
                }
                default_id = Some(mpc.id.clone());
            }
            by_id.insert(mpc.id.clone(), mpc);
        }

        let default_id =
            default_id.ok_or_else(|| As4Error::Config("no default MPC configured".to_string()))?;

        info!(channels = by_id.len(), default_mpc = %default_id, "MPC registry initialized");

        Ok(Self {
            inner: RwLock::new(Channels { by_id, default_id }),
        })
    }

    /// Registry holding only the ebMS3 default channel.
    pub fn with_default() -> Self {
        let default = Mpc::default_mpc();
        let mut by_id = BTreeMap::new();
        by_id.insert(default.id.clone(), default);
        Self {
            inner: RwLock::new(Channels {
                by_id,
                default_id: DEFAULT_MPC_ID.to_string(),
            }),
        }
    }

    pub fn from_config(config: &As4Config) -> Result<Self, As4Error> {
        Self::new(config.mpcs.iter().cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    pub fn default_mpc(&self) -> Mpc {
        let channels = self.inner.read();
        channels
            .by_id
            .get(&channels.default_id)
            .cloned()
            .unwrap_or_else(|| Mpc {
                id: channels.default_id.clone(),
                is_default: true,
            })
    }

    /// Resolve a channel id. A missing or blank id resolves to the default.
    pub fn resolve(&self, id: Option<&str>) -> Option<Mpc> {
        match id.map(str::trim).filter(|id| !id.is_empty()) {
            None => Some(self.default_mpc()),
            Some(id) => {
                let found = self.inner.read().by_id.get(id).cloned();
                debug!(mpc = %id, found = found.is_some(), "MPC lookup");
                found
            }
        }
    }

    /// Add a non-default channel. Returns false if the id already exists.
    pub fn add(&self, id: impl Into<String>) -> Result<bool, As4Error> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(As4Error::Config("MPC id must not be blank".to_string()));
        }
        let mut channels = self.inner.write();
        if channels.by_id.contains_key(&id) {
            return Ok(false);
        }
        info!(mpc = %id, "MPC registered");
        channels.by_id.insert(id.clone(), Mpc::new(id));
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MpcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.inner.read();
        f.debug_struct("MpcRegistry")
            .field("channels", &channels.by_id.keys().collect::<Vec<_>>())
            .field("default", &channels.default_id)
            .finish()
    }
}
