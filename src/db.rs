//! SQLite backend for the fleet repository
//!
//! Servers and configurations live in relational tables; a configuration's
//! target set and history are kept in child tables so history stays
//! append-only at the row level.

use crate::models::{
    ConfigStatus, Configuration, HistoryAction, HistoryEntry, Server, ServerAddress, ServerStatus,
};
use crate::repository::FleetRepository;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets the health monitor and deployments write without blocking readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: servers and configurations
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                admin_path TEXT NOT NULL DEFAULT '/config/',
                status TEXT NOT NULL DEFAULT 'unknown',
                last_pinged TEXT,
                active_config_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS configurations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS configuration_servers (
                configuration_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                PRIMARY KEY (configuration_id, server_id),
                FOREIGN KEY (configuration_id) REFERENCES configurations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_configuration_servers_server ON configuration_servers(server_id);
            CREATE INDEX IF NOT EXISTS idx_configurations_status ON configurations(status);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: configuration history log
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: configuration history");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS configuration_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                configuration_id TEXT NOT NULL,
                action TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                server_id TEXT,
                note TEXT,
                FOREIGN KEY (configuration_id) REFERENCES configurations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_configuration_history_config ON configuration_history(configuration_id, id);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }
}

// ==================== Row Mapping ====================

const SERVER_COLUMNS: &str =
    "id, name, host, port, admin_path, status, last_pinged, active_config_id, created_at";

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(idx: usize, value: &str) -> rusqlite::Result<T> {
    value
        .parse()
        .map_err(|e: String| conversion_error(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Server> {
    let status: String = row.get(5)?;
    let last_pinged: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;

    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        address: ServerAddress {
            host: row.get(2)?,
            port: row.get(3)?,
            admin_path: row.get(4)?,
        },
        status: parse_enum::<ServerStatus>(5, &status)?,
        last_pinged: last_pinged.map(|ts| parse_timestamp(6, &ts)).transpose()?,
        active_config_id: row.get(7)?,
        created_at: parse_timestamp(8, &created_at)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let action: String = row.get(0)?;
    let timestamp: String = row.get(1)?;

    Ok(HistoryEntry {
        action: parse_enum::<HistoryAction>(0, &action)?,
        timestamp: parse_timestamp(1, &timestamp)?,
        server_id: row.get(2)?,
        note: row.get(3)?,
    })
}

fn load_configuration(conn: &Connection, id: &str) -> Result<Option<Configuration>> {
    let base = conn
        .query_row(
            "SELECT id, name, content, status, created_at, updated_at
             FROM configurations WHERE id = ?1",
            params![id],
            |row| {
                let content: String = row.get(2)?;
                let status: String = row.get(3)?;
                let created_at: String = row.get(4)?;
                let updated_at: String = row.get(5)?;
                Ok(Configuration {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    servers: BTreeSet::new(),
                    content: serde_json::from_str(&content).map_err(|e| conversion_error(2, e))?,
                    status: parse_enum::<ConfigStatus>(3, &status)?,
                    history: Vec::new(),
                    created_at: parse_timestamp(4, &created_at)?,
                    updated_at: parse_timestamp(5, &updated_at)?,
                })
            },
        )
        .optional()
        .context("Failed to get configuration")?;

    let Some(mut config) = base else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT server_id FROM configuration_servers WHERE configuration_id = ?1",
    )?;
    config.servers = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT action, timestamp, server_id, note FROM configuration_history
         WHERE configuration_id = ?1 ORDER BY id ASC",
    )?;
    config.history = stmt
        .query_map(params![id], history_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(config))
}

fn insert_history(conn: &Connection, config_id: &str, entries: &[HistoryEntry]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO configuration_history (configuration_id, action, timestamp, server_id, note)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for entry in entries {
        stmt.execute(params![
            config_id,
            entry.action.as_str(),
            entry.timestamp.to_rfc3339(),
            entry.server_id,
            entry.note,
        ])?;
    }
    Ok(())
}

fn replace_servers(conn: &Connection, config_id: &str, servers: &BTreeSet<String>) -> Result<()> {
    conn.execute(
        "DELETE FROM configuration_servers WHERE configuration_id = ?1",
        params![config_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO configuration_servers (configuration_id, server_id) VALUES (?1, ?2)",
    )?;
    for server_id in servers {
        stmt.execute(params![config_id, server_id])?;
    }
    Ok(())
}

impl FleetRepository for Database {
    // ==================== Server Operations ====================

    fn create_server(&self, server: &Server) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO servers (id, name, host, port, admin_path, status, last_pinged, active_config_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                server.id,
                server.name,
                server.address.host,
                server.address.port,
                server.address.admin_path,
                server.status.as_str(),
                server.last_pinged.map(|ts| ts.to_rfc3339()),
                server.active_config_id,
                server.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to create server")?;
        Ok(())
    }

    fn find_server(&self, id: &str) -> Result<Option<Server>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM servers WHERE id = ?1", SERVER_COLUMNS),
            params![id],
            server_from_row,
        )
        .optional()
        .context("Failed to get server")
    }

    fn list_servers(&self) -> Result<Vec<Server>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM servers ORDER BY created_at ASC, name ASC",
            SERVER_COLUMNS
        ))?;

        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(servers)
    }

    fn update_server(&self, server: &Server) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE servers SET name = ?1, host = ?2, port = ?3, admin_path = ?4, status = ?5,
                        last_pinged = ?6, active_config_id = ?7
                 WHERE id = ?8",
                params![
                    server.name,
                    server.address.host,
                    server.address.port,
                    server.address.admin_path,
                    server.status.as_str(),
                    server.last_pinged.map(|ts| ts.to_rfc3339()),
                    server.active_config_id,
                    server.id,
                ],
            )
            .context("Failed to update server")?;
        Ok(rows > 0)
    }

    fn update_server_liveness(
        &self,
        id: &str,
        status: ServerStatus,
        last_pinged: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE servers SET status = ?1, last_pinged = ?2 WHERE id = ?3",
                params![status.as_str(), last_pinged.to_rfc3339(), id],
            )
            .context("Failed to update server liveness")?;
        Ok(rows > 0)
    }

    fn delete_server(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Configuration Operations ====================

    fn create_configuration(&self, config: &Configuration) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO configurations (id, name, content, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                config.id,
                config.name,
                serde_json::to_string(&config.content)?,
                config.status.as_str(),
                config.created_at.to_rfc3339(),
                config.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to create configuration")?;
        replace_servers(&tx, &config.id, &config.servers)?;
        insert_history(&tx, &config.id, &config.history)?;

        tx.commit()?;
        Ok(())
    }

    fn find_configuration(&self, id: &str) -> Result<Option<Configuration>> {
        let conn = self.conn.lock();
        load_configuration(&conn, id)
    }

    fn list_configurations(&self) -> Result<Vec<Configuration>> {
        let conn = self.conn.lock();
        let ids = {
            let mut stmt = conn.prepare("SELECT id FROM configurations ORDER BY created_at ASC")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut configs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(config) = load_configuration(&conn, &id)? {
                configs.push(config);
            }
        }
        Ok(configs)
    }

    fn update_configuration(&self, config: &Configuration) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows = tx
            .execute(
                "UPDATE configurations SET name = ?1, content = ?2, status = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    config.name,
                    serde_json::to_string(&config.content)?,
                    config.status.as_str(),
                    config.updated_at.to_rfc3339(),
                    config.id,
                ],
            )
            .context("Failed to update configuration")?;
        if rows == 0 {
            return Ok(false);
        }

        replace_servers(&tx, &config.id, &config.servers)?;

        // History is append-only: only entries past the stored length are written
        let stored: i64 = tx.query_row(
            "SELECT COUNT(*) FROM configuration_history WHERE configuration_id = ?1",
            params![config.id],
            |row| row.get(0),
        )?;
        let stored = usize::try_from(stored).unwrap_or(0);
        if config.history.len() > stored {
            insert_history(&tx, &config.id, &config.history[stored..])?;
        }

        tx.commit()?;
        Ok(true)
    }

    fn delete_configuration(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM configurations WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn find_live_configurations_for_server(&self, server_id: &str) -> Result<Vec<Configuration>> {
        let conn = self.conn.lock();
        let ids = {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM configurations c
                 JOIN configuration_servers cs ON cs.configuration_id = c.id
                 WHERE cs.server_id = ?1 AND c.status = 'live'
                 ORDER BY c.created_at ASC",
            )?;
            let ids = stmt
                .query_map(params![server_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut configs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(config) = load_configuration(&conn, &id)? {
                configs.push(config);
            }
        }
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("fleet.db");

        let server = Server::new("edge", ServerAddress::new("127.0.0.1", 2019));
        {
            let db = Database::open(&path).unwrap();
            db.create_server(&server).unwrap();
        }

        // Reopening must not re-run migrations or lose rows
        let db = Database::open(&path).unwrap();
        let found = db.find_server(&server.id).unwrap().unwrap();
        assert_eq!(found.address.port, 2019);
    }

    #[test]
    fn test_history_is_append_only() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Configuration::new("site", serde_json::json!({}));
        db.create_configuration(&config).unwrap();

        config.record(HistoryEntry::new(HistoryAction::Deployed).for_server("s1"));
        db.update_configuration(&config).unwrap();

        // A stale copy with fewer entries must not truncate the log
        let stale = db.find_configuration(&config.id).unwrap().unwrap();
        config.record(HistoryEntry::new(HistoryAction::Superseded).with_note("replaced"));
        db.update_configuration(&config).unwrap();
        db.update_configuration(&stale).unwrap();

        let found = db.find_configuration(&config.id).unwrap().unwrap();
        let actions: Vec<_> = found.history.iter().map(|h| h.action).collect();
        assert_eq!(
            actions,
            vec![HistoryAction::Created, HistoryAction::Deployed, HistoryAction::Superseded]
        );
        assert_eq!(found.history[2].note.as_deref(), Some("replaced"));
    }

    #[test]
    fn test_delete_configuration_cascades() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Configuration::new("site", serde_json::json!({})).with_servers(["s1"]);
        config.status = ConfigStatus::Live;
        db.create_configuration(&config).unwrap();
        assert_eq!(db.find_live_configurations_for_server("s1").unwrap().len(), 1);

        assert!(db.delete_configuration(&config.id).unwrap());

        let conn = db.conn.lock();
        let leftover: i64 = conn
            .query_row("SELECT COUNT(*) FROM configuration_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_servers_set_is_replaced_on_update() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Configuration::new("site", serde_json::json!({})).with_servers(["a", "b"]);
        db.create_configuration(&config).unwrap();

        config.servers = ["c".to_string()].into_iter().collect();
        db.update_configuration(&config).unwrap();

        let found = db.find_configuration(&config.id).unwrap().unwrap();
        assert_eq!(found.servers.into_iter().collect::<Vec<_>>(), vec!["c".to_string()]);
    }
}
