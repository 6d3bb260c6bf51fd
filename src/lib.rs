//! quorum - Transactional job runs and observations
//!
//! Runs a job's pipeline to produce a numeric observation, caches the
//! latest answer, and persists every finished run through a background
//! worker so that observing never waits on the database.
//!
//! # Architecture
//!
//! - Units of database work run through [`Transactor::transact`], which
//!   commits on success, rolls back on error, and rolls back before
//!   resuming a panic
//! - [`ObservationSource`] executes a pipeline under a deadline and hands
//!   the run to a [`RunResultSaver`] without blocking
//!
//! # Modules
//!
//! - `adapters`: Database driver and pipeline executor (SQLite, subprocesses)
//! - `core`: Transactions, observations, run persistence
//! - `domain`: Data structures (Run, JobSpec, Vars, results)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Make three observations, one per second
//! quorum observe job.yaml --rounds 3
//!
//! # List persisted runs
//! quorum runs --limit 20
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{
    Answer, CachedAnswer, DataSource, ObservationError, ObservationSource, RunResultSaver,
    RunStore, Transactor, TxError, TxOptions,
};
pub use domain::{JobDefinition, Run, RunState};
