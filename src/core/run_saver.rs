//! Background persistence of finished runs.
//!
//! Observations hand runs off through a bounded channel and never wait on
//! the database. The saver drains that channel and writes each run in its
//! own transaction.

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::run_store::RunStore;
use super::transaction::{Transactor, TxOptions};
use crate::adapters::SqliteDatabase;
use crate::domain::Run;

/// Counts reported when the saver shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaverStats {
    pub saved: u64,
    pub failed: u64,
}

/// Writes runs received from observation sources to the run store
pub struct RunResultSaver {
    transactor: Transactor<SqliteDatabase>,
    options: TxOptions,
}

impl RunResultSaver {
    pub fn new(transactor: Transactor<SqliteDatabase>) -> Self {
        Self {
            transactor,
            options: TxOptions::default(),
        }
    }

    /// Transaction options used for every insert
    pub fn with_options(mut self, options: TxOptions) -> Self {
        self.options = options;
        self
    }

    /// Spawn the saver task reading from `run_results`
    pub fn start(&self, run_results: mpsc::Receiver<Run>) -> SaverHandle {
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let transactor = self.transactor.clone();
        let options = self.options.clone();

        let task = tokio::spawn(run_saver(transactor, options, run_results, stop_rx));

        SaverHandle { stop_tx, task }
    }
}

/// Handle to control the saver
pub struct SaverHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<SaverStats>,
}

impl SaverHandle {
    /// Stop accepting runs, save everything already queued, then exit
    pub async fn close(self) -> Result<SaverStats> {
        let _ = self.stop_tx.send(()).await;
        let stats = self.task.await?;
        Ok(stats)
    }
}

async fn run_saver(
    transactor: Transactor<SqliteDatabase>,
    options: TxOptions,
    mut run_results: mpsc::Receiver<Run>,
    mut stop_rx: mpsc::Receiver<()>,
) -> SaverStats {
    let mut stats = SaverStats::default();

    debug!("Run result saver started");

    loop {
        tokio::select! {
            received = run_results.recv() => match received {
                Some(run) => save(&transactor, &options, run, &mut stats).await,
                None => {
                    debug!("All run senders dropped");
                    break;
                }
            },
            _ = stop_rx.recv() => {
                run_results.close();
                while let Some(run) = run_results.recv().await {
                    save(&transactor, &options, run, &mut stats).await;
                }
                break;
            }
        }
    }

    info!(saved = stats.saved, failed = stats.failed, "Run result saver stopped");
    stats
}

async fn save(
    transactor: &Transactor<SqliteDatabase>,
    options: &TxOptions,
    run: Run,
    stats: &mut SaverStats,
) {
    let run_id = run.id;
    let job_id = run.job_id;

    let result = transactor
        .transact(options, move |tx| {
            Box::pin(async move { RunStore::insert_finished_run(tx, &run) })
        })
        .await;

    match result {
        Ok(()) => {
            debug!(%run_id, job_id, "Saved run");
            stats.saved += 1;
        }
        Err(e) => {
            error!(%run_id, job_id, error = %e, "Failed to save run");
            stats.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PipelineSpec, TaskResult, TaskRunResult, TaskRunResults};
    use serde_json::json;
    use std::sync::Arc;

    async fn transactor() -> Transactor<SqliteDatabase> {
        let db = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let transactor = Transactor::new(db);
        transactor
            .transact(&TxOptions::default(), |tx| {
                Box::pin(async move { RunStore::migrate(tx) })
            })
            .await
            .unwrap();
        transactor
    }

    fn finished_run(value: &str) -> Run {
        let spec = PipelineSpec {
            id: 1,
            job_id: 7,
            tasks: Vec::new(),
        };
        let mut run = Run::new(&spec, json!({}));
        run.finish(&TaskRunResults(vec![TaskRunResult::new(
            "answer",
            TaskResult::value(json!(value)),
            true,
        )]));
        run
    }

    async fn count(transactor: &Transactor<SqliteDatabase>) -> i64 {
        transactor
            .transact(&TxOptions::read_only(), |tx| {
                Box::pin(async move { RunStore::count_runs(tx) })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_close_drains_queue() {
        let transactor = transactor().await;
        let (tx, rx) = mpsc::channel(10);

        let handle = RunResultSaver::new(transactor.clone()).start(rx);
        for i in 0..5 {
            tx.try_send(finished_run(&i.to_string())).unwrap();
        }

        let stats = handle.close().await.unwrap();
        assert_eq!(stats, SaverStats { saved: 5, failed: 0 });
        assert_eq!(count(&transactor).await, 5);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_failed_save_does_not_stop_worker() {
        let transactor = transactor().await;
        let (tx, rx) = mpsc::channel(10);

        let handle = RunResultSaver::new(transactor.clone()).start(rx);

        let spec = PipelineSpec {
            id: 1,
            job_id: 7,
            tasks: Vec::new(),
        };
        // Unfinished runs are rejected by the store
        tx.send(Run::new(&spec, json!({}))).await.unwrap();
        tx.send(finished_run("1")).await.unwrap();

        let stats = handle.close().await.unwrap();
        assert_eq!(stats, SaverStats { saved: 1, failed: 1 });
        assert_eq!(count(&transactor).await, 1);
    }

    #[tokio::test]
    async fn test_stops_when_senders_dropped() {
        let transactor = transactor().await;
        let (tx, rx) = mpsc::channel(10);

        let handle = RunResultSaver::new(transactor.clone()).start(rx);
        tx.send(finished_run("1")).await.unwrap();
        drop(tx);

        let stats = handle.close().await.unwrap();
        assert_eq!(stats.saved, 1);
    }
}
