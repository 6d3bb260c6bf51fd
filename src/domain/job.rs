//! Job and pipeline definitions.
//!
//! Jobs are defined in YAML. A job carries its identity (used to label
//! runs and errors) and one pipeline spec made of ordered tasks.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Timeout for a task without an explicit `timeout_seconds`
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// A job file: identity plus the pipeline it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job: JobSpec,
    pub pipeline: PipelineSpec,
}

impl JobDefinition {
    /// Load a job definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a job definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: Self =
            serde_yaml::from_str(content).context("Failed to parse job YAML")?;

        if definition.pipeline.job_id != definition.job.id {
            anyhow::bail!(
                "Pipeline spec {} belongs to job {}, not job {}",
                definition.pipeline.id,
                definition.pipeline.job_id,
                definition.job.id
            );
        }
        definition.pipeline.validate()?;

        Ok(definition)
    }
}

/// Static job identity passed into every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Database identifier
    pub id: i32,

    /// Globally unique identifier shared with external systems
    pub external_job_id: Uuid,

    #[serde(default)]
    pub name: Option<String>,
}

impl JobSpec {
    /// Job name, or an empty string if unnamed
    pub fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }
}

/// The computation executed by a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub id: i32,

    pub job_id: i32,

    /// Tasks in execution order
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl PipelineSpec {
    /// Validate task names and references
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            anyhow::bail!("Pipeline spec {} must have at least one task", self.id);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if task.name.is_empty() {
                anyhow::bail!("Task {} has an empty name", i);
            }

            // Inputs must come from an earlier task
            if let Some(ref input) = task.input_from {
                if !seen.contains(input.as_str()) {
                    anyhow::bail!(
                        "Task '{}' reads from '{}', which is not an earlier task",
                        task.name,
                        input
                    );
                }
            }

            if !seen.insert(task.name.as_str()) {
                anyhow::bail!("Duplicate task name '{}'", task.name);
            }
        }

        Ok(())
    }

    /// Whether no other task consumes this task's output
    pub fn is_terminal(&self, task_name: &str) -> bool {
        !self
            .tasks
            .iter()
            .any(|t| t.input_from.as_deref() == Some(task_name))
    }
}

/// A single pipeline task, executed as a subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name (unique within the pipeline)
    pub name: String,

    /// Program to run
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Task whose output is piped to stdin; run variables are used if unset
    #[serde(default)]
    pub input_from: Option<String>,

    /// Override timeout for this task
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl TaskSpec {
    /// Get the effective timeout for this task
    pub fn timeout(&self) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TASK_TIMEOUT)
    }
}
