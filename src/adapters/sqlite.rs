//! SQLite database driver.
//!
//! A single connection sits behind an async mutex; an open transaction owns
//! the lock until it commits, rolls back or is dropped. SQLite has no
//! session-local timeouts, so `set_local` maps the lock timeout onto the
//! connection's busy timeout for the life of the transaction and accepts
//! the idle timeout without effect.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::{Database, Transaction};
use crate::core::transaction::{
    IsolationLevel, LocalSetting, ResolvedTxOptions, DEFAULT_LOCK_TIMEOUT,
};

/// Busy timeout restored after every transaction
pub const DEFAULT_BUSY_TIMEOUT: Duration = DEFAULT_LOCK_TIMEOUT;

/// SQLite database backed by one connection
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign keys")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn begin_statement(isolation: IsolationLevel) -> &'static str {
    match isolation {
        // Take the write lock up front so no other writer can interleave
        IsolationLevel::RepeatableRead | IsolationLevel::Serializable => "BEGIN IMMEDIATE",
        IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => "BEGIN DEFERRED",
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    type Tx = SqliteTransaction;

    async fn begin(&self, options: &ResolvedTxOptions) -> Result<SqliteTransaction> {
        let guard = Arc::clone(&self.conn).lock_owned().await;

        // From here on, Drop puts the connection back in order on failure
        let tx = SqliteTransaction {
            conn: Some(guard),
            read_only: options.read_only,
        };

        let conn = tx.connection()?;
        if options.read_only {
            conn.pragma_update(None, "query_only", true)
                .context("Failed to make transaction read-only")?;
        }
        conn.execute_batch(begin_statement(options.isolation))
            .context("Failed to begin SQLite transaction")?;

        Ok(tx)
    }
}

/// An open SQLite transaction
pub struct SqliteTransaction {
    /// `None` once committed or rolled back
    conn: Option<OwnedMutexGuard<Connection>>,
    read_only: bool,
}

impl SqliteTransaction {
    /// The underlying connection, for queries inside the transaction
    pub fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_deref()
            .context("SQLite transaction already finished")
    }

    /// Run COMMIT or ROLLBACK on a blocking thread.
    ///
    /// The connection lock moves with the statement, so a caller that stops
    /// waiting (e.g. a rollback ceiling elapsing) leaves it to finish and
    /// release the connection in the background.
    async fn finish(&mut self, statement: &'static str) -> Result<()> {
        let conn = self
            .conn
            .take()
            .context("SQLite transaction already finished")?;
        let read_only = self.read_only;

        tokio::task::spawn_blocking(move || {
            let result = conn.execute_batch(statement);
            if !conn.is_autocommit() {
                // A failed COMMIT can leave the transaction open
                let _ = conn.execute_batch("ROLLBACK");
            }
            restore(&conn, read_only);

            result.with_context(|| format!("SQLite {} failed", statement))
        })
        .await
        .context("SQLite worker thread failed")?
    }
}

/// Undo per-transaction connection settings
fn restore(conn: &Connection, read_only: bool) {
    if read_only {
        if let Err(e) = conn.pragma_update(None, "query_only", false) {
            warn!(error = %e, "Failed to clear query_only");
        }
    }
    if let Err(e) = conn.busy_timeout(DEFAULT_BUSY_TIMEOUT) {
        warn!(error = %e, "Failed to restore busy timeout");
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn exec(&mut self, sql: &str) -> Result<()> {
        self.connection()?
            .execute_batch(sql)
            .with_context(|| format!("Failed to execute: {}", sql))
    }

    async fn set_local(&mut self, setting: LocalSetting) -> Result<()> {
        match setting {
            LocalSetting::LockTimeout(timeout) => self
                .connection()?
                .busy_timeout(timeout)
                .context("Failed to set busy timeout"),
            LocalSetting::IdleInTxSessionTimeout(timeout) => {
                debug!(?timeout, "SQLite has no idle transaction timeout, ignoring");
                Ok(())
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                warn!("SQLite transaction dropped while open, rolling back");
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %e, "Failed to roll back dropped transaction");
                }
            }
            restore(&conn, self.read_only);
        }
    }
}
