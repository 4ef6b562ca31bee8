//! Persistence contract consumed by the health monitor and deployment orchestrator
//!
//! Two backends implement [`FleetRepository`]: a relational one on SQLite
//! ([`crate::db::Database`]) and a document one that keeps JSON documents in a
//! single file ([`crate::docstore::DocumentStore`]). Which one is used is decided
//! once, from configuration, by [`open_repository`].

use crate::config::{StoreBackend, StoreConfig};
use crate::db::Database;
use crate::docstore::DocumentStore;
use crate::models::{ConfigStatus, Configuration, Server, ServerStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// CRUD over the two fleet entities. Each call is atomic for the single
/// entity it touches; nothing here spans entities.
pub trait FleetRepository: Send + Sync {
    fn create_server(&self, server: &Server) -> Result<()>;
    fn find_server(&self, id: &str) -> Result<Option<Server>>;
    fn list_servers(&self) -> Result<Vec<Server>>;
    /// Returns false when the server does not exist
    fn update_server(&self, server: &Server) -> Result<bool>;
    /// Set only `status` and `last_pinged`, leaving every other field as stored.
    /// Returns false when the server does not exist.
    fn update_server_liveness(
        &self,
        id: &str,
        status: ServerStatus,
        last_pinged: DateTime<Utc>,
    ) -> Result<bool>;
    fn delete_server(&self, id: &str) -> Result<bool>;

    fn create_configuration(&self, config: &Configuration) -> Result<()>;
    fn find_configuration(&self, id: &str) -> Result<Option<Configuration>>;
    fn list_configurations(&self) -> Result<Vec<Configuration>>;
    /// Returns false when the configuration does not exist
    fn update_configuration(&self, config: &Configuration) -> Result<bool>;
    fn delete_configuration(&self, id: &str) -> Result<bool>;

    /// Live configurations whose server set contains `server_id`
    fn find_live_configurations_for_server(&self, server_id: &str) -> Result<Vec<Configuration>> {
        Ok(self
            .list_configurations()?
            .into_iter()
            .filter(|c| c.status == ConfigStatus::Live && c.targets_server(server_id))
            .collect())
    }
}

/// Open the repository selected by `config.backend`
pub fn open_repository(config: &StoreConfig) -> Result<Arc<dyn FleetRepository>> {
    let repo: Arc<dyn FleetRepository> = match (config.backend, config.is_in_memory()) {
        (StoreBackend::Sqlite, true) => Arc::new(Database::open_in_memory()?),
        (StoreBackend::Sqlite, false) => Arc::new(Database::open(&config.path)?),
        (StoreBackend::Document, true) => Arc::new(DocumentStore::in_memory()),
        (StoreBackend::Document, false) => Arc::new(DocumentStore::open(&config.path)?),
    };

    info!(backend = ?config.backend, path = %config.path, "Fleet repository opened");
    Ok(repo)
}
