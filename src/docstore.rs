//! Document backend for the fleet repository
//!
//! Every entity is stored as a whole JSON document keyed by id. The full set
//! is flushed to disk after each mutation by writing a sibling temp file and
//! renaming it over the original.

use crate::models::{Configuration, Server, ServerStatus};
use crate::repository::FleetRepository;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Documents {
    #[serde(default)]
    servers: BTreeMap<String, Server>,
    #[serde(default)]
    configurations: BTreeMap<String, Configuration>,
}

pub struct DocumentStore {
    docs: RwLock<Documents>,
    /// None for in-memory stores
    path: Option<PathBuf>,
}

impl DocumentStore {
    /// Open a document file, creating an empty one if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let docs = if path.exists() {
            let raw = std::fs::read(&path)
                .with_context(|| format!("Failed to read document store {}", path.display()))?;
            if raw.iter().all(u8::is_ascii_whitespace) {
                Documents::default()
            } else {
                serde_json::from_slice(&raw)
                    .with_context(|| format!("Corrupt document store {}", path.display()))?
            }
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Documents::default()
        };

        let store = Self {
            docs: RwLock::new(docs),
            path: Some(path),
        };
        store.flush(&store.docs.read())?;

        if let Some(path) = &store.path {
            info!("Document store opened at {}", path.display());
        }
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self {
            docs: RwLock::new(Documents::default()),
            path: None,
        }
    }

    fn flush(&self, docs: &Documents) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let tmp = path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(docs)?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        debug!(
            servers = docs.servers.len(),
            configurations = docs.configurations.len(),
            "Document store flushed"
        );
        Ok(())
    }

    /// Apply a mutation and persist it; the in-memory change is rolled back if
    /// the flush fails
    fn mutate<T>(&self, f: impl FnOnce(&mut Documents) -> Result<T>) -> Result<T> {
        let mut docs = self.docs.write();
        let snapshot = serde_json::to_value(&*docs)?;
        let result = f(&mut docs)?;
        if let Err(e) = self.flush(&docs) {
            *docs = serde_json::from_value(snapshot)?;
            return Err(e);
        }
        Ok(result)
    }
}

impl FleetRepository for DocumentStore {
    fn create_server(&self, server: &Server) -> Result<()> {
        self.mutate(|docs| {
            if docs.servers.contains_key(&server.id) {
                anyhow::bail!("server {} already exists", server.id);
            }
            docs.servers.insert(server.id.clone(), server.clone());
            Ok(())
        })
    }

    fn find_server(&self, id: &str) -> Result<Option<Server>> {
        Ok(self.docs.read().servers.get(id).cloned())
    }

    fn list_servers(&self) -> Result<Vec<Server>> {
        let mut servers: Vec<Server> = self.docs.read().servers.values().cloned().collect();
        servers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(servers)
    }

    fn update_server(&self, server: &Server) -> Result<bool> {
        self.mutate(|docs| match docs.servers.get_mut(&server.id) {
            Some(existing) => {
                *existing = server.clone();
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn update_server_liveness(
        &self,
        id: &str,
        status: ServerStatus,
        last_pinged: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.docs.read().servers.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|docs| match docs.servers.get_mut(id) {
            Some(existing) => {
                existing.status = status;
                existing.last_pinged = Some(last_pinged);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn delete_server(&self, id: &str) -> Result<bool> {
        if !self.docs.read().servers.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|docs| Ok(docs.servers.remove(id).is_some()))
    }

    fn create_configuration(&self, config: &Configuration) -> Result<()> {
        self.mutate(|docs| {
            if docs.configurations.contains_key(&config.id) {
                anyhow::bail!("configuration {} already exists", config.id);
            }
            docs.configurations.insert(config.id.clone(), config.clone());
            Ok(())
        })
    }

    fn find_configuration(&self, id: &str) -> Result<Option<Configuration>> {
        Ok(self.docs.read().configurations.get(id).cloned())
    }

    fn list_configurations(&self) -> Result<Vec<Configuration>> {
        let mut configs: Vec<Configuration> =
            self.docs.read().configurations.values().cloned().collect();
        configs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(configs)
    }

    fn update_configuration(&self, config: &Configuration) -> Result<bool> {
        self.mutate(|docs| match docs.configurations.get_mut(&config.id) {
            Some(existing) => {
                // Keep entries a stale writer does not know about
                let mut updated = config.clone();
                if existing.history.len() > updated.history.len() {
                    updated.history = existing.history.clone();
                }
                *existing = updated;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn delete_configuration(&self, id: &str) -> Result<bool> {
        if !self.docs.read().configurations.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|docs| Ok(docs.configurations.remove(id).is_some()))
    }
}
