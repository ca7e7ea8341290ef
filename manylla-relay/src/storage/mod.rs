//! SQLite storage backend for the relay.

pub mod models;

use crate::error::RelayError;
use models::{ShareLookup, StoredBlob, StoredInvite, StoredShare};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, anyhow::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, anyhow::Error> {
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_data (
                sync_id TEXT PRIMARY KEY,
                device_id TEXT,
                encrypted_blob TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS invites (
                invite_code TEXT PRIMARY KEY,
                sync_id TEXT NOT NULL,
                device_id TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shares (
                access_code TEXT PRIMARY KEY,
                encrypted_data TEXT NOT NULL,
                recipient_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                max_views INTEGER,
                view_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_invites_expires
                ON invites(expires_at);
            CREATE INDEX IF NOT EXISTS idx_shares_expires
                ON shares(expires_at);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    /// Replace the blob of `sync_id`, returning the new version number.
    pub fn put_blob(
        &self,
        sync_id: &str,
        device_id: Option<&str>,
        encrypted_blob: &str,
        timestamp: i64,
        now: i64,
    ) -> Result<i64, RelayError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_data (sync_id, device_id, encrypted_blob, timestamp, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(sync_id) DO UPDATE SET
                device_id = excluded.device_id,
                encrypted_blob = excluded.encrypted_blob,
                timestamp = excluded.timestamp,
                version = sync_data.version + 1,
                updated_at = excluded.updated_at",
            params![sync_id, device_id, encrypted_blob, timestamp, now],
        )?;

        let version = conn.query_row(
            "SELECT version FROM sync_data WHERE sync_id = ?1",
            [sync_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub fn get_blob(&self, sync_id: &str) -> Result<Option<StoredBlob>, RelayError> {
        let conn = self.conn()?;
        let blob = conn
            .query_row(
                "SELECT sync_id, device_id, encrypted_blob, timestamp, version
                 FROM sync_data WHERE sync_id = ?1",
                [sync_id],
                |row| {
                    Ok(StoredBlob {
                        sync_id: row.get(0)?,
                        device_id: row.get(1)?,
                        encrypted_blob: row.get(2)?,
                        timestamp: row.get(3)?,
                        version: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(blob)
    }

    /// Register an invite. Returns `false` if the code is taken by a live
    /// invite.
    pub fn put_invite(&self, invite: &StoredInvite, now: i64) -> Result<bool, RelayError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM invites WHERE invite_code = ?1 AND expires_at <= ?2",
            params![invite.invite_code, now],
        )?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO invites (invite_code, sync_id, device_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                invite.invite_code,
                invite.sync_id,
                invite.device_id,
                invite.created_at,
                invite.expires_at
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Look up a live invite.
    pub fn get_invite(&self, code: &str, now: i64) -> Result<Option<StoredInvite>, RelayError> {
        let conn = self.conn()?;
        let invite = conn
            .query_row(
                "SELECT invite_code, sync_id, device_id, created_at, expires_at
                 FROM invites WHERE invite_code = ?1 AND expires_at > ?2",
                params![code, now],
                |row| {
                    Ok(StoredInvite {
                        invite_code: row.get(0)?,
                        sync_id: row.get(1)?,
                        device_id: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(invite)
    }

    /// Store a share. Returns `false` if the access code is already in use.
    pub fn put_share(&self, share: &StoredShare, now: i64) -> Result<bool, RelayError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM shares WHERE access_code = ?1 AND expires_at <= ?2",
            params![share.access_code, now],
        )?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO shares
                (access_code, encrypted_data, recipient_type, created_at, expires_at, max_views, view_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                share.access_code,
                share.encrypted_data,
                share.recipient_type,
                share.created_at,
                share.expires_at,
                share.max_views
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Fetch a share and count the view.
    pub fn open_share(&self, code: &str, now: i64) -> Result<ShareLookup, RelayError> {
        let conn = self.conn()?;
        let share = conn
            .query_row(
                "SELECT access_code, encrypted_data, recipient_type, created_at, expires_at,
                        max_views, view_count
                 FROM shares WHERE access_code = ?1",
                [code],
                |row| {
                    Ok(StoredShare {
                        access_code: row.get(0)?,
                        encrypted_data: row.get(1)?,
                        recipient_type: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                        max_views: row.get(5)?,
                        view_count: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(mut share) = share else {
            return Ok(ShareLookup::Missing);
        };
        let exhausted = share.max_views.is_some_and(|max| share.view_count >= max);
        if share.expires_at <= now || exhausted {
            return Ok(ShareLookup::Expired);
        }

        conn.execute(
            "UPDATE shares SET view_count = view_count + 1 WHERE access_code = ?1",
            [code],
        )?;
        share.view_count += 1;
        Ok(ShareLookup::Found(share))
    }

    /// Delete expired invites and shares, returning how many rows went.
    pub fn purge_expired(&self, now: i64) -> Result<usize, RelayError> {
        let conn = self.conn()?;
        let invites = conn.execute("DELETE FROM invites WHERE expires_at <= ?1", [now])?;
        let shares = conn.execute(
            "DELETE FROM shares
             WHERE expires_at <= ?1 OR (max_views IS NOT NULL AND view_count >= max_views)",
            [now],
        )?;
        Ok(invites + shares)
    }
}
