//! Run records.
//!
//! A Run represents a single execution of a pipeline. Once a run is handed
//! to the persistence queue it belongs to the saver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::PipelineSpec;
use super::results::{TaskRunResult, TaskRunResults};

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Pipeline spec that was executed
    pub pipeline_spec_id: i32,

    /// Job that owns the pipeline spec
    pub job_id: i32,

    /// Current state of the run
    pub state: RunState,

    /// Variables the run was started with
    pub inputs: serde_json::Value,

    /// Terminal task values (set once finished)
    pub outputs: Option<serde_json::Value>,

    /// Terminal task errors, parallel to `outputs`
    pub errors: Vec<Option<String>>,

    /// When the run started
    pub created_at: DateTime<Utc>,

    /// When the run finished (if applicable)
    pub finished_at: Option<DateTime<Utc>>,

    /// Per-task results in execution order
    pub task_runs: Vec<TaskRunResult>,
}

impl Run {
    /// Create a new running run for a pipeline spec
    pub fn new(spec: &PipelineSpec, inputs: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_spec_id: spec.id,
            job_id: spec.job_id,
            state: RunState::Running,
            inputs,
            outputs: None,
            errors: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
            task_runs: Vec::new(),
        }
    }

    /// Record the task results and move the run to its final state
    pub fn finish(&mut self, results: &TaskRunResults) {
        let final_result = results.final_result();

        self.state = if final_result.has_errors() {
            RunState::Errored
        } else {
            RunState::Completed
        };
        self.outputs = Some(final_result.outputs());
        self.errors = final_result.errors;
        self.task_runs = results.0.clone();
        self.finished_at = Some(Utc::now());
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if the run has finished (successfully or not)
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Check if any terminal task errored
    pub fn has_errors(&self) -> bool {
        self.errors.iter().any(Option::is_some)
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Currently executing
    #[default]
    Running,

    /// Every terminal task produced a value
    Completed,

    /// At least one terminal task produced an error
    Errored,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }
}
