//! Adapter interfaces for external systems.
//!
//! Adapters provide narrow interfaces to the database driver and to the
//! pipeline runner that produces run results.

pub mod command;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::core::transaction::{LocalSetting, ResolvedTxOptions};
use crate::domain::{PipelineSpec, Run, TaskRunResults, Vars};

// Re-export the concrete adapters
pub use command::CommandRunExecutor;
pub use sqlite::{SqliteDatabase, SqliteTransaction};

/// A database that can open transactions
#[async_trait]
pub trait Database: Send + Sync {
    type Tx: Transaction;

    /// Begin a transaction with the given isolation and read-only mode
    async fn begin(&self, options: &ResolvedTxOptions) -> Result<Self::Tx>;
}

/// An open database transaction
#[async_trait]
pub trait Transaction: Send {
    /// Execute a statement that returns no rows
    async fn exec(&mut self, sql: &str) -> Result<()>;

    /// Apply a setting for the rest of this transaction only
    async fn set_local(&mut self, setting: LocalSetting) -> Result<()> {
        self.exec(&setting.to_sql()).await
    }

    async fn commit(&mut self) -> Result<()>;

    /// Roll back the transaction.
    ///
    /// Callers may bound this with a timeout, which only takes effect at an
    /// await point. Drivers with blocking calls should run them off the async
    /// thread (as `SqliteTransaction` does with `spawn_blocking`).
    async fn rollback(&mut self) -> Result<()>;
}

/// Executes pipeline runs
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Execute `spec` with `vars`, returning the run record and task results.
    ///
    /// Implementations should stop work and return by `deadline`.
    async fn execute_run(
        &self,
        deadline: Instant,
        spec: &PipelineSpec,
        vars: Vars,
    ) -> Result<(Run, TaskRunResults)>;
}
