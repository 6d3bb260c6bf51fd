//! Core transactional and observation logic.
//!
//! This module contains:
//! - Transactor: runs units of work inside database transactions
//! - ObservationSource: produces observations from pipeline runs
//! - RunResultSaver: persists finished runs in the background
//! - RunStore: SQL persistence of runs

pub mod fault;
pub mod observation;
pub mod run_saver;
pub mod run_store;
pub mod transaction;

// Re-export commonly used types
pub use fault::{FaultReporter, LogFaultReporter};
pub use observation::{
    Answer, CachedAnswer, DataSource, Observation, ObservationError, ObservationSource,
};
pub use run_saver::{RunResultSaver, SaverHandle, SaverStats};
pub use run_store::{RunStore, RunSummary};
pub use transaction::{
    IsolationLevel, LocalSetting, ResolvedTxOptions, Transactor, TxError, TxOptions,
};
