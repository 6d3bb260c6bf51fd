//! Task results and their reduction.
//!
//! A run produces one result per task. Only terminal tasks (tasks whose
//! output no other task consumes) contribute to the final result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Outcome of a single task: a value or an error, never both
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn value(value: serde_json::Value) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of one task within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub id: Uuid,

    /// Task name (unique within the pipeline)
    pub task_name: String,

    pub result: TaskResult,

    /// Whether this task's output is part of the final result
    pub is_terminal: bool,

    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskRunResult {
    pub fn new(task_name: impl Into<String>, result: TaskResult, is_terminal: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_name: task_name.into(),
            result,
            is_terminal,
            created_at: now,
            finished_at: now,
        }
    }

    pub fn with_started_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// All task results of a run, in execution order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRunResults(pub Vec<TaskRunResult>);

impl TaskRunResults {
    /// Collect the outcomes of the terminal tasks
    pub fn final_result(&self) -> FinalResult {
        let mut final_result = FinalResult::default();

        for trr in self.0.iter().filter(|trr| trr.is_terminal) {
            final_result.values.push(trr.result.value.clone());
            final_result.errors.push(trr.result.error.clone());
        }

        final_result
    }

    pub fn get(&self, task_name: &str) -> Option<&TaskRunResult> {
        self.0.iter().find(|trr| trr.task_name == task_name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Terminal outcomes of a run. `values` and `errors` are parallel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalResult {
    pub values: Vec<Option<serde_json::Value>>,
    pub errors: Vec<Option<String>>,
}

impl FinalResult {
    pub fn has_errors(&self) -> bool {
        self.errors.iter().any(Option::is_some)
    }

    /// Values as a JSON array (`null` for errored entries)
    pub fn outputs(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.values
                .iter()
                .map(|v| v.clone().unwrap_or(serde_json::Value::Null))
                .collect(),
        )
    }

    /// Reduce to exactly one outcome
    pub fn singular_result(&self) -> Result<TaskResult, ResultError> {
        if self.values.len() != 1 {
            return Err(ResultError::NotSingular {
                count: self.values.len(),
            });
        }

        Ok(TaskResult {
            value: self.values[0].clone(),
            error: self.errors.first().cloned().flatten(),
        })
    }
}

/// Errors reducing a result set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResultError {
    #[error("cannot return a singular result for a final result with {count} values")]
    NotSingular { count: usize },
}
