//! SQLite database for Sitelink state persistence
//!
//! Tables:
//! - vpn_clients: one row per non-purged enrollment
//! - settings: scoped key/value store for server key material and CA text

use crate::types::{ClientKeys, ClientState, Protocol, VpnClient};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const CLIENT_COLUMNS: &str = "id, name, description, protocol, tunnel_address, routed_subnet, \
     public_key, private_key, preshared_key, enabled, state, generated_bundle, \
     generated_script, last_generated_at, created_at, updated_at";

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Enrolled remote sites. Purged clients are deleted outright,
            -- which is what releases their tunnel address.
            CREATE TABLE IF NOT EXISTS vpn_clients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                protocol TEXT NOT NULL,
                tunnel_address TEXT NOT NULL UNIQUE,
                routed_subnet TEXT,
                public_key TEXT UNIQUE,
                private_key TEXT,
                preshared_key TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                state TEXT NOT NULL,
                generated_bundle TEXT,
                generated_script TEXT,
                last_generated_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_vpn_clients_protocol ON vpn_clients(protocol);
            CREATE INDEX IF NOT EXISTS idx_vpn_clients_state ON vpn_clients(state);

            -- Scoped key-value settings
            CREATE TABLE IF NOT EXISTS settings (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (scope, key)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Clients
    // ========================================================================

    /// Insert a client record.
    ///
    /// A clash on name, tunnel address or public key surfaces as `AlreadyExists`.
    pub fn insert_client(&self, client: &VpnClient) -> Result<()> {
        let conn = self.conn.lock();

        let result = conn.execute(
            &format!(
                "INSERT INTO vpn_clients ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                CLIENT_COLUMNS
            ),
            params![
                client.id,
                client.name,
                client.description,
                client.protocol.as_str(),
                client.tunnel_address.to_string(),
                client.routed_subnet.map(|s| s.to_string()),
                client.keys.public_key,
                client.keys.private_key,
                client.keys.preshared_key,
                client.enabled,
                client.state.as_str(),
                client.generated_bundle,
                client.generated_script,
                client.last_generated_at,
                client.created_at,
                client.updated_at,
            ],
        );

        match result {
            Ok(_) => {
                debug!("Inserted client {} ({})", client.name, client.id);
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, msg)) if e.code == ErrorCode::ConstraintViolation => {
                let msg = msg.unwrap_or_default();
                let id = if msg.contains("tunnel_address") {
                    client.tunnel_address.to_string()
                } else if msg.contains("public_key") {
                    client.keys.public_key.clone().unwrap_or_default()
                } else {
                    client.name.clone()
                };
                Err(Error::already_exists("client", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace every mutable column of an existing client.
    pub fn update_client(&self, client: &VpnClient) -> Result<()> {
        let conn = self.conn.lock();

        let rows = conn.execute(
            "UPDATE vpn_clients SET description = ?1, routed_subnet = ?2, public_key = ?3, \
             private_key = ?4, preshared_key = ?5, enabled = ?6, state = ?7, \
             generated_bundle = ?8, generated_script = ?9, last_generated_at = ?10, \
             updated_at = ?11 WHERE id = ?12",
            params![
                client.description,
                client.routed_subnet.map(|s| s.to_string()),
                client.keys.public_key,
                client.keys.private_key,
                client.keys.preshared_key,
                client.enabled,
                client.state.as_str(),
                client.generated_bundle,
                client.generated_script,
                client.last_generated_at,
                client.updated_at,
                client.id,
            ],
        )?;

        if rows == 0 {
            return Err(Error::not_found("client", client.id.clone()));
        }

        debug!("Updated client {} ({})", client.name, client.id);
        Ok(())
    }

    /// Get a client by ID
    pub fn get_client(&self, id: &str) -> Result<Option<VpnClient>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM vpn_clients WHERE id = ?1", CLIENT_COLUMNS),
                params![id],
                RawClient::from_row,
            )
            .optional()?;

        row.map(RawClient::parse).transpose()
    }

    /// Get a client by name
    pub fn get_client_by_name(&self, name: &str) -> Result<Option<VpnClient>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM vpn_clients WHERE name = ?1", CLIENT_COLUMNS),
                params![name],
                RawClient::from_row,
            )
            .optional()?;

        row.map(RawClient::parse).transpose()
    }

    /// List clients, optionally for one protocol, ordered by tunnel address.
    pub fn list_clients(&self, protocol: Option<Protocol>) -> Result<Vec<VpnClient>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM vpn_clients WHERE (?1 IS NULL OR protocol = ?1)",
            CLIENT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![protocol.map(|p| p.as_str())], RawClient::from_row)?;

        let mut clients = Vec::new();
        for row in rows {
            clients.push(row?.parse()?);
        }
        clients.sort_by(|a, b| {
            u32::from(a.tunnel_address)
                .cmp(&u32::from(b.tunnel_address))
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(clients)
    }

    /// Delete a client row. Returns whether a row was removed.
    pub fn delete_client(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM vpn_clients WHERE id = ?1", params![id])?;

        if rows > 0 {
            debug!("Deleted client {}", id);
        }

        Ok(rows > 0)
    }

    /// Check if a client name is taken
    pub fn client_name_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vpn_clients WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Get a setting value
    pub fn settings_get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE scope = ?1 AND key = ?2",
                params![scope, key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    /// Set a setting value, replacing any previous one
    pub fn settings_set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT OR REPLACE INTO settings (scope, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![scope, key, value, now],
        )?;

        Ok(())
    }

    /// Store `value` only if the key is unset; returns whichever value is stored afterwards.
    pub fn settings_set_if_absent(&self, scope: &str, key: &str, value: &str) -> Result<String> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT OR IGNORE INTO settings (scope, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![scope, key, value, now],
        )?;

        let stored: String = conn.query_row(
            "SELECT value FROM settings WHERE scope = ?1 AND key = ?2",
            params![scope, key],
            |row| row.get(0),
        )?;

        Ok(stored)
    }

    /// Delete a setting
    pub fn settings_delete(&self, scope: &str, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM settings WHERE scope = ?1 AND key = ?2",
            params![scope, key],
        )?;
        Ok(())
    }
}

/// Raw database row before parsing
struct RawClient {
    id: String,
    name: String,
    description: Option<String>,
    protocol: String,
    tunnel_address: String,
    routed_subnet: Option<String>,
    public_key: Option<String>,
    private_key: Option<String>,
    preshared_key: Option<String>,
    enabled: bool,
    state: String,
    generated_bundle: Option<String>,
    generated_script: Option<String>,
    last_generated_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl RawClient {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            protocol: row.get(3)?,
            tunnel_address: row.get(4)?,
            routed_subnet: row.get(5)?,
            public_key: row.get(6)?,
            private_key: row.get(7)?,
            preshared_key: row.get(8)?,
            enabled: row.get(9)?,
            state: row.get(10)?,
            generated_bundle: row.get(11)?,
            generated_script: row.get(12)?,
            last_generated_at: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn parse(self) -> Result<VpnClient> {
        let tunnel_address: Ipv4Addr = self.tunnel_address.parse().map_err(|_| {
            Error::Internal(format!(
                "client {} has malformed tunnel address {}",
                self.id, self.tunnel_address
            ))
        })?;
        let routed_subnet = self
            .routed_subnet
            .map(|s| {
                s.parse().map_err(|_| {
                    Error::Internal(format!("client {} has malformed routed subnet {}", self.id, s))
                })
            })
            .transpose()?;

        Ok(VpnClient {
            id: self.id,
            name: self.name,
            description: self.description,
            protocol: self.protocol.parse()?,
            tunnel_address,
            routed_subnet,
            keys: ClientKeys {
                public_key: self.public_key,
                private_key: self.private_key,
                preshared_key: self.preshared_key,
            },
            enabled: self.enabled,
            state: self.state.parse::<ClientState>()?,
            generated_bundle: self.generated_bundle,
            generated_script: self.generated_script,
            last_generated_at: self.last_generated_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
