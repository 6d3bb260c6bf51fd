//! Transactional execution with per-transaction timeouts.
//!
//! Pooled connections are shared across unrelated transactions, so lock and
//! idle timeouts cannot be fixed once per connection. Each transaction sets
//! its own bounds with `SET LOCAL` when they differ from the defaults.
//!
//! `Transactor::transact` guarantees that exactly one of commit or rollback
//! is attempted per call. A panic inside the work is reported, rolled back
//! under a fixed ceiling and then resumed.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::adapters::{Database, Transaction};

use super::fault::{panic_message, FaultReporter, LogFaultReporter, FAULT_FLUSH_DEADLINE};

/// Max time we will wait for any kind of database lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// Max time a transaction may stay open and idle
pub const DEFAULT_IDLE_IN_TX_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Read committed is the Postgres default; stated explicitly here
pub const DEFAULT_ISOLATION: IsolationLevel = IsolationLevel::ReadCommitted;

/// Max time a rollback may take after a panic in the work
pub const ROLLBACK_CEILING: Duration = Duration::from_secs(10);

/// Standard SQL isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Caller-supplied transaction options.
///
/// Unset fields, and timeouts set to zero, fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOptions {
    #[serde(default)]
    pub isolation: Option<IsolationLevel>,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub lock_timeout: Option<Duration>,

    #[serde(default)]
    pub idle_in_tx_session_timeout: Option<Duration>,
}

impl TxOptions {
    /// Options for a read-only transaction with default timeouts
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_idle_in_tx_session_timeout(mut self, timeout: Duration) -> Self {
        self.idle_in_tx_session_timeout = Some(timeout);
        self
    }

    /// Merge with the defaults
    pub fn resolve(&self) -> ResolvedTxOptions {
        ResolvedTxOptions {
            isolation: self.isolation.unwrap_or(DEFAULT_ISOLATION),
            read_only: self.read_only,
            lock_timeout: non_zero(self.lock_timeout).unwrap_or(DEFAULT_LOCK_TIMEOUT),
            idle_in_tx_session_timeout: non_zero(self.idle_in_tx_session_timeout)
                .unwrap_or(DEFAULT_IDLE_IN_TX_SESSION_TIMEOUT),
        }
    }
}

fn non_zero(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

/// Effective options for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub lock_timeout: Duration,
    pub idle_in_tx_session_timeout: Duration,
}

impl Default for ResolvedTxOptions {
    fn default() -> Self {
        TxOptions::default().resolve()
    }
}

impl ResolvedTxOptions {
    /// Transaction-local settings to issue, in order. Empty for defaults.
    pub fn local_settings(&self) -> Vec<LocalSetting> {
        let mut settings = Vec::new();
        if self.lock_timeout != DEFAULT_LOCK_TIMEOUT {
            settings.push(LocalSetting::LockTimeout(self.lock_timeout));
        }
        if self.idle_in_tx_session_timeout != DEFAULT_IDLE_IN_TX_SESSION_TIMEOUT {
            settings.push(LocalSetting::IdleInTxSessionTimeout(
                self.idle_in_tx_session_timeout,
            ));
        }
        settings
    }
}

/// A setting scoped to the current transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSetting {
    LockTimeout(Duration),
    IdleInTxSessionTimeout(Duration),
}

impl LocalSetting {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LockTimeout(_) => "lock_timeout",
            Self::IdleInTxSessionTimeout(_) => "idle_in_transaction_session_timeout",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::LockTimeout(d) | Self::IdleInTxSessionTimeout(d) => *d,
        }
    }

    /// Postgres form, e.g. `SET LOCAL lock_timeout = 5000`
    pub fn to_sql(&self) -> String {
        format!("SET LOCAL {} = {}", self.name(), self.duration().as_millis())
    }
}

/// Errors returned by `Transactor::transact`
#[derive(Debug, Error)]
pub enum TxError {
    #[error("failed to begin transaction: {0:#}")]
    Begin(anyhow::Error),

    #[error("error setting transaction local {setting}: {cause:#}")]
    SetLocal {
        setting: &'static str,
        cause: anyhow::Error,
    },

    /// The work itself failed; the transaction was rolled back
    #[error(transparent)]
    Work(anyhow::Error),

    /// Rolling back after `error` failed as well
    #[error("{error:#}; rollback also failed: {rollback:#}")]
    RollbackFailed {
        error: anyhow::Error,
        rollback: anyhow::Error,
    },

    #[error("failed to commit transaction: {0:#}")]
    Commit(anyhow::Error),
}

/// Runs units of work inside database transactions
pub struct Transactor<D: Database> {
    db: Arc<D>,
    fault_reporter: Arc<dyn FaultReporter>,
    rollback_ceiling: Duration,
}

impl<D: Database> Clone for Transactor<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            fault_reporter: Arc::clone(&self.fault_reporter),
            rollback_ceiling: self.rollback_ceiling,
        }
    }
}

impl<D: Database> Transactor<D> {
    /// Create a transactor that logs faults
    pub fn new(db: Arc<D>) -> Self {
        Self {
            db,
            fault_reporter: Arc::new(LogFaultReporter),
            rollback_ceiling: ROLLBACK_CEILING,
        }
    }

    pub fn with_fault_reporter(mut self, reporter: Arc<dyn FaultReporter>) -> Self {
        self.fault_reporter = reporter;
        self
    }

    pub fn with_rollback_ceiling(mut self, ceiling: Duration) -> Self {
        self.rollback_ceiling = ceiling;
        self
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    /// Run `work` in a transaction.
    ///
    /// Commits if `work` succeeds and rolls back otherwise. The work future
    /// must own whatever it captures.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `work` once the rollback has finished. If
    /// the rollback does not finish within the rollback ceiling, panics with
    /// a message saying so instead.
    #[instrument(skip_all, fields(read_only = options.read_only))]
    pub async fn transact<T, F>(&self, options: &TxOptions, work: F) -> Result<T, TxError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut D::Tx) -> BoxFuture<'t, anyhow::Result<T>> + Send,
    {
        let resolved = options.resolve();

        let mut tx = self.db.begin(&resolved).await.map_err(TxError::Begin)?;

        let outcome = AssertUnwindSafe(async {
            for setting in resolved.local_settings() {
                tx.set_local(setting)
                    .await
                    .map_err(|cause| TxError::SetLocal {
                        setting: setting.name(),
                        cause,
                    })?;
            }
            let value = work(&mut tx).await.map_err(TxError::Work)?;
            Ok::<T, TxError>(value)
        })
        .catch_unwind()
        .await;

        match outcome {
            Err(payload) => self.rollback_after_panic(tx, payload).await,
            Ok(Err(err)) => {
                debug!(error = %err, "Error in transaction, rolling back");
                match tx.rollback().await {
                    Ok(()) => Err(err),
                    Err(rollback) => Err(TxError::RollbackFailed {
                        error: err.into(),
                        rollback,
                    }),
                }
            }
            Ok(Ok(value)) => {
                tx.commit().await.map_err(TxError::Commit)?;
                Ok(value)
            }
        }
    }

    /// Report the panic, roll back within the ceiling, then resume unwinding
    async fn rollback_after_panic<T>(&self, mut tx: D::Tx, payload: Box<dyn Any + Send>) -> T {
        let message = panic_message(payload.as_ref());

        self.fault_reporter.capture(&message);
        self.fault_reporter.flush(FAULT_FLUSH_DEADLINE);

        error!(panic = %message, "Panic in transaction, rolling back");

        // The caller's future may be on its way out; the ceiling is our own
        match tokio::time::timeout(self.rollback_ceiling, tx.rollback()).await {
            Ok(result) => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to rollback on panic");
                }
                std::panic::resume_unwind(payload)
            }
            Err(_) => panic!(
                "panic in transaction; aborting rollback that took longer than {:?}: {}",
                self.rollback_ceiling, message
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Default, Clone)]
    struct FakeBehavior {
        fail_begin: bool,
        fail_exec: bool,
        fail_commit: bool,
        fail_rollback: bool,
        rollback_delay: Option<Duration>,
    }

    #[derive(Default)]
    struct FakeDb {
        log: Log,
        behavior: FakeBehavior,
    }

    struct FakeTx {
        log: Log,
        behavior: FakeBehavior,
    }

    #[async_trait]
    impl Database for FakeDb {
        type Tx = FakeTx;

        async fn begin(&self, options: &ResolvedTxOptions) -> anyhow::Result<FakeTx> {
            if self.behavior.fail_begin {
                anyhow::bail!("connection refused");
            }
            self.log
                .lock()
                .push(format!("begin {} read_only={}", options.isolation, options.read_only));
            Ok(FakeTx {
                log: Arc::clone(&self.log),
                behavior: self.behavior.clone(),
            })
        }
    }

    #[async_trait]
    impl Transaction for FakeTx {
        async fn exec(&mut self, sql: &str) -> anyhow::Result<()> {
            if self.behavior.fail_exec {
                anyhow::bail!("syntax error");
            }
            self.log.lock().push(sql.to_string());
            Ok(())
        }

        async fn commit(&mut self) -> anyhow::Result<()> {
            self.log.lock().push("commit".to_string());
            if self.behavior.fail_commit {
                anyhow::bail!("serialization failure");
            }
            Ok(())
        }

        async fn rollback(&mut self) -> anyhow::Result<()> {
            self.log.lock().push("rollback".to_string());
            if let Some(delay) = self.behavior.rollback_delay {
                tokio::time::sleep(delay).await;
            }
            if self.behavior.fail_rollback {
                anyhow::bail!("connection reset");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingReporter {
        captured: AtomicUsize,
        flushed: AtomicUsize,
    }

    impl FaultReporter for CountingReporter {
        fn capture(&self, _message: &str) {
            self.captured.fetch_add(1, Ordering::SeqCst);
        }

        fn flush(&self, _deadline: Duration) -> bool {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn transactor(behavior: FakeBehavior) -> (Transactor<FakeDb>, Log) {
        let log = Log::default();
        let db = FakeDb {
            log: Arc::clone(&log),
            behavior,
        };
        (Transactor::new(Arc::new(db)), log)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    fn explode() -> anyhow::Result<u32> {
        panic!("kaboom")
    }

    #[test]
    fn test_resolve_defaults() {
        let resolved = TxOptions::default().resolve();

        assert_eq!(resolved.isolation, IsolationLevel::ReadCommitted);
        assert!(!resolved.read_only);
        assert_eq!(resolved.lock_timeout, Duration::from_secs(15));
        assert_eq!(resolved.idle_in_tx_session_timeout, Duration::from_secs(3600));
        assert!(resolved.local_settings().is_empty());
    }

    #[test]
    fn test_zero_timeouts_mean_default() {
        let options = TxOptions::default()
            .with_lock_timeout(Duration::ZERO)
            .with_idle_in_tx_session_timeout(Duration::ZERO);

        assert_eq!(options.resolve(), ResolvedTxOptions::default());
    }

    #[test]
    fn test_read_only_helper() {
        let resolved = TxOptions::read_only().resolve();

        assert!(resolved.read_only);
        assert_eq!(resolved.isolation, DEFAULT_ISOLATION);
        assert_eq!(resolved.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }

    #[test]
    fn test_local_setting_sql() {
        assert_eq!(
            LocalSetting::LockTimeout(Duration::from_secs(5)).to_sql(),
            "SET LOCAL lock_timeout = 5000"
        );
        assert_eq!(
            LocalSetting::IdleInTxSessionTimeout(Duration::from_millis(1500)).to_sql(),
            "SET LOCAL idle_in_transaction_session_timeout = 1500"
        );
    }

    #[tokio::test]
    async fn test_success_commits() {
        let (transactor, log) = transactor(FakeBehavior::default());

        let value = transactor
            .transact(&TxOptions::default(), |tx| {
                Box::pin(async move {
                    tx.exec("INSERT INTO t VALUES (1)").await?;
                    Ok(41 + 1)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(
            entries(&log),
            vec![
                "begin READ COMMITTED read_only=false",
                "INSERT INTO t VALUES (1)",
                "commit"
            ]
        );
    }

    #[tokio::test]
    async fn test_error_rolls_back() {
        let (transactor, log) = transactor(FakeBehavior::default());

        let result: Result<(), TxError> = transactor
            .transact(&TxOptions::default(), |_tx| {
                Box::pin(async move { Err(anyhow::anyhow!("work failed")) })
            })
            .await;

        match result {
            Err(TxError::Work(e)) => assert_eq!(e.to_string(), "work failed"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            entries(&log),
            vec!["begin READ COMMITTED read_only=false", "rollback"]
        );
    }

    #[tokio::test]
    async fn test_rollback_failure_is_combined() {
        let (transactor, log) = transactor(FakeBehavior {
            fail_rollback: true,
            ..Default::default()
        });

        let err = transactor
            .transact(&TxOptions::default(), |_tx| {
                Box::pin(async move { Err::<(), _>(anyhow::anyhow!("work failed")) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::RollbackFailed { .. }));
        let message = err.to_string();
        assert!(message.contains("work failed"));
        assert!(message.contains("connection reset"));
        assert_eq!(entries(&log).iter().filter(|e| *e == "rollback").count(), 1);
        assert!(!entries(&log).contains(&"commit".to_string()));
    }

    #[tokio::test]
    async fn test_commit_failure_returned() {
        let (transactor, log) = transactor(FakeBehavior {
            fail_commit: true,
            ..Default::default()
        });

        let err = transactor
            .transact(&TxOptions::default(), |_tx| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::Commit(_)));
        assert!(err.to_string().contains("serialization failure"));
        assert!(!entries(&log).contains(&"rollback".to_string()));
    }

    #[tokio::test]
    async fn test_begin_failure() {
        let (transactor, log) = transactor(FakeBehavior {
            fail_begin: true,
            ..Default::default()
        });

        let err = transactor
            .transact(&TxOptions::default(), |_tx| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::Begin(_)));
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn test_default_options_issue_no_directives() {
        let (transactor, log) = transactor(FakeBehavior::default());

        transactor
            .transact(&TxOptions::default(), |_tx| Box::pin(async move { Ok(()) }))
            .await
            .unwrap();

        assert!(!entries(&log).iter().any(|e| e.starts_with("SET LOCAL")));
    }

    #[tokio::test]
    async fn test_custom_timeouts_issue_directives() {
        let (transactor, log) = transactor(FakeBehavior::default());
        let options = TxOptions::default()
            .with_isolation(IsolationLevel::Serializable)
            .with_lock_timeout(Duration::from_secs(5))
            .with_idle_in_tx_session_timeout(Duration::from_secs(60));

        transactor
            .transact(&options, |_tx| Box::pin(async move { Ok(()) }))
            .await
            .unwrap();

        assert_eq!(
            entries(&log),
            vec![
                "begin SERIALIZABLE read_only=false",
                "SET LOCAL lock_timeout = 5000",
                "SET LOCAL idle_in_transaction_session_timeout = 60000",
                "commit"
            ]
        );
    }

    #[tokio::test]
    async fn test_directive_failure_rolls_back() {
        let (transactor, log) = transactor(FakeBehavior {
            fail_exec: true,
            ..Default::default()
        });
        let options = TxOptions::default().with_lock_timeout(Duration::from_secs(1));

        let err = transactor
            .transact(&options, |_tx| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();

        match err {
            TxError::SetLocal { setting, .. } => assert_eq!(setting, "lock_timeout"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(
            entries(&log),
            vec!["begin READ COMMITTED read_only=false", "rollback"]
        );
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_resumed() {
        let (transactor, log) = transactor(FakeBehavior::default());
        let reporter = Arc::new(CountingReporter::default());
        let transactor = transactor.with_fault_reporter(reporter.clone());

        let outcome = AssertUnwindSafe(
            transactor.transact(&TxOptions::default(), |_tx| Box::pin(async move { explode() })),
        )
        .catch_unwind()
        .await;

        let payload = outcome.unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        assert_eq!(reporter.captured.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.flushed.load(Ordering::SeqCst), 1);
        assert_eq!(
            entries(&log),
            vec!["begin READ COMMITTED read_only=false", "rollback"]
        );
    }

    #[tokio::test]
    async fn test_panic_resumed_even_if_rollback_fails() {
        let (transactor, _log) = transactor(FakeBehavior {
            fail_rollback: true,
            ..Default::default()
        });

        let outcome = AssertUnwindSafe(
            transactor.transact(&TxOptions::default(), |_tx| Box::pin(async move { explode() })),
        )
        .catch_unwind()
        .await;

        let payload = outcome.unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
    }

    #[tokio::test]
    async fn test_stuck_rollback_after_panic_hits_ceiling() {
        let (transactor, log) = transactor(FakeBehavior {
            rollback_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let transactor = transactor.with_rollback_ceiling(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let outcome = AssertUnwindSafe(
            transactor.transact(&TxOptions::default(), |_tx| Box::pin(async move { explode() })),
        )
        .catch_unwind()
        .await;

        let message = panic_message(outcome.unwrap_err().as_ref());
        assert!(message.contains("aborting rollback that took longer than 50ms"));
        assert!(message.contains("kaboom"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(entries(&log).contains(&"rollback".to_string()));
    }
}
