//! Fleet entities shared by the repository, health monitor and deployment code

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Default admin API path exposed by a proxy instance
pub const DEFAULT_ADMIN_PATH: &str = "/config/";

/// Liveness of a proxy instance as last observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(ServerStatus::Online),
            "offline" => Ok(ServerStatus::Offline),
            "unknown" => Ok(ServerStatus::Unknown),
            other => Err(format!("unknown server status: {}", other)),
        }
    }
}

/// Lifecycle of a stored configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    #[default]
    Draft,
    Live,
    Archived,
}

impl ConfigStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigStatus::Draft => "draft",
            ConfigStatus::Live => "live",
            ConfigStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ConfigStatus::Draft),
            "live" => Ok(ConfigStatus::Live),
            "archived" => Ok(ConfigStatus::Archived),
            other => Err(format!("unknown configuration status: {}", other)),
        }
    }
}

/// Where a proxy's admin API can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_admin_path")]
    pub admin_path: String,
}

fn default_admin_path() -> String {
    DEFAULT_ADMIN_PATH.to_string()
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            admin_path: default_admin_path(),
        }
    }

    pub fn with_admin_path(mut self, path: impl Into<String>) -> Self {
        self.admin_path = path.into();
        self
    }

    /// Admin path with a guaranteed leading slash
    pub fn normalized_admin_path(&self) -> String {
        let trimmed = self.admin_path.trim();
        if trimmed.is_empty() {
            "/".to_string()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        }
    }

    /// Path prefix the admin API is mounted under, e.g. "" for "/config/"
    /// and "/caddy" for "/caddy/config/"
    pub fn admin_prefix(&self) -> String {
        let path = self.normalized_admin_path();
        let path = path.trim_end_matches('/');
        let path = path.strip_suffix("/config").unwrap_or(path);
        path.trim_end_matches('/').to_string()
    }
}

/// A registered proxy instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub address: ServerAddress,
    #[serde(default)]
    pub status: ServerStatus,
    pub last_pinged: Option<DateTime<Utc>>,
    pub active_config_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Server {
    pub fn new(name: impl Into<String>, address: ServerAddress) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            address,
            status: ServerStatus::Unknown,
            last_pinged: None,
            active_config_id: None,
            created_at: Utc::now(),
        }
    }
}

/// What happened to a configuration at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Created,
    Deployed,
    Failed,
    Superseded,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Created => "created",
            HistoryAction::Deployed => "deployed",
            HistoryAction::Failed => "failed",
            HistoryAction::Superseded => "superseded",
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(HistoryAction::Created),
            "deployed" => Ok(HistoryAction::Deployed),
            "failed" => Ok(HistoryAction::Failed),
            "superseded" => Ok(HistoryAction::Superseded),
            other => Err(format!("unknown history action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    pub server_id: Option<String>,
    pub note: Option<String>,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction) -> Self {
        Self {
            action,
            timestamp: Utc::now(),
            server_id: None,
            note: None,
        }
    }

    pub fn for_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// A stored declarative proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: String,
    pub name: String,
    /// Servers this configuration is meant for
    #[serde(default)]
    pub servers: BTreeSet<String>,
    pub content: serde_json::Value,
    #[serde(default)]
    pub status: ConfigStatus,
    /// Append-only
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Configuration {
    /// A fresh draft with a single "created" history entry
    pub fn new(name: impl Into<String>, content: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            servers: BTreeSet::new(),
            content,
            status: ConfigStatus::Draft,
            history: vec![HistoryEntry::new(HistoryAction::Created)],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.updated_at = entry.timestamp;
        self.history.push(entry);
    }

    pub fn targets_server(&self, server_id: &str) -> bool {
        self.servers.contains(server_id)
    }
}
