//! Observation source for offchain reporting.
//!
//! Each observation executes one pipeline run under the caller's deadline,
//! hands the run record to the saver without blocking, reduces the run to a
//! single value and converts it into an integer observation. The last
//! successful observation is cached and passed to the next run as bridge
//! metadata.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};

use crate::adapters::RunExecutor;
use crate::domain::{
    marshal_bridge_metadata, to_decimal, to_observation, ConversionError, JobSpec, PipelineSpec,
    ResultError, Run, Vars,
};

/// The value reported to the reporting protocol for one round
pub type Observation = BigInt;

/// Errors producing an observation
#[derive(Debug, Error)]
pub enum ObservationError {
    #[error("error executing run for spec ID {spec_id}: {cause:#}")]
    Run { spec_id: i32, cause: anyhow::Error },

    #[error("run for spec ID {spec_id} did not finish before the observation deadline")]
    DeadlineExceeded { spec_id: i32 },

    #[error("unable to enqueue run save for job ID {job_id}, buffer full")]
    BufferFull { job_id: i32 },

    #[error("unable to enqueue run save for job ID {job_id}, run saver has stopped")]
    SaverClosed { job_id: i32 },

    #[error("error getting singular result for job ID {job_id}: {source}")]
    SingularResult {
        job_id: i32,
        #[source]
        source: ResultError,
    },

    /// The pipeline itself produced an error value
    #[error("{0}")]
    Task(String),

    #[error("cannot convert observation to decimal: {0}")]
    Conversion(#[from] ConversionError),
}

/// Something that produces observations for the reporting protocol
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Produce one observation.
    ///
    /// `deadline` is the protocol's observation timeout plus its grace
    /// period; a usable value should still be returned after the nominal
    /// timeout as long as the deadline has not passed.
    async fn observe(&self, deadline: Instant) -> Result<Observation, ObservationError>;
}

/// Last successful observation and when it was made
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub value: BigInt,
    pub updated_at: DateTime<Utc>,
}

/// Latest answer, shared by concurrent observations.
///
/// Value and timestamp live in one slot so they are always replaced together.
#[derive(Debug, Default)]
pub struct CachedAnswer {
    current: RwLock<Option<Answer>>,
}

impl CachedAnswer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Answer> {
        self.current.read().clone()
    }

    /// Replace the answer, stamping it with the current time
    pub fn update(&self, value: BigInt) -> Answer {
        let answer = Answer {
            value,
            updated_at: Utc::now(),
        };
        *self.current.write() = Some(answer.clone());
        answer
    }
}

/// Produces observations by running a job's pipeline
pub struct ObservationSource {
    executor: Arc<dyn RunExecutor>,
    job: JobSpec,
    spec: PipelineSpec,
    run_results: mpsc::Sender<Run>,
    current: CachedAnswer,
}

impl ObservationSource {
    pub fn new(
        executor: Arc<dyn RunExecutor>,
        job: JobSpec,
        spec: PipelineSpec,
        run_results: mpsc::Sender<Run>,
    ) -> Self {
        Self {
            executor,
            job,
            spec,
            run_results,
            current: CachedAnswer::new(),
        }
    }

    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    /// The last successful observation, if any
    pub fn cached_answer(&self) -> Option<Answer> {
        self.current.current()
    }

    /// Bridge metadata for the next run; `None` if it cannot be encoded
    fn bridge_metadata(&self) -> Option<serde_json::Value> {
        let (latest_answer, updated_at) = match self.current.current() {
            Some(answer) => (Some(answer.value), Some(answer.updated_at.timestamp())),
            None => (None, None),
        };

        match marshal_bridge_metadata(latest_answer, updated_at) {
            Ok(md) => Some(md),
            Err(e) => {
                warn!(error = %e, "unable to attach metadata for run");
                None
            }
        }
    }
}

#[async_trait]
impl DataSource for ObservationSource {
    #[instrument(skip(self), fields(job_id = self.spec.job_id, spec_id = self.spec.id))]
    async fn observe(&self, deadline: Instant) -> Result<Observation, ObservationError> {
        let spec_id = self.spec.id;
        let job_id = self.spec.job_id;

        let vars = Vars::for_job(&self.job, self.bridge_metadata());

        let (run, results) = match timeout_at(
            deadline,
            self.executor.execute_run(deadline, &self.spec, vars),
        )
        .await
        {
            Ok(Ok(executed)) => executed,
            Ok(Err(cause)) => return Err(ObservationError::Run { spec_id, cause }),
            Err(_) => return Err(ObservationError::DeadlineExceeded { spec_id }),
        };
        let final_result = results.final_result();

        // Never wait on the saver
        match self.run_results.try_send(run) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(ObservationError::BufferFull { job_id }),
            Err(TrySendError::Closed(_)) => return Err(ObservationError::SaverClosed { job_id }),
        }

        let result = final_result
            .singular_result()
            .map_err(|source| ObservationError::SingularResult { job_id, source })?;

        if let Some(error) = result.error {
            return Err(ObservationError::Task(error));
        }

        let value = result.value.unwrap_or(serde_json::Value::Null);
        let decimal = to_decimal(&value)?;
        let observation = to_observation(&decimal)?;

        self.current.update(observation.clone());
        debug!(%observation, "Observation made");

        Ok(observation)
    }
}
