//! Run executor whose tasks are subprocesses.
//!
//! Each task's program receives its input on stdin: the output of its
//! `input_from` task, or the run variables as JSON. Its trimmed stdout is
//! the task value. JSON objects and arrays are parsed; numbers are kept as
//! their literal text so no precision is lost before decimal conversion.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, warn};

use super::RunExecutor;
use crate::domain::{PipelineSpec, Run, TaskResult, TaskRunResult, TaskRunResults, TaskSpec, Vars};

/// Executes pipeline tasks as local processes
#[derive(Debug, Default, Clone)]
pub struct CommandRunExecutor {
    /// Extra environment for every task
    env: Vec<(String, String)>,
}

impl CommandRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable for every task process
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run one task process and collect its output
    async fn execute_subprocess(
        &self,
        task: &TaskSpec,
        input: &str,
        task_timeout: Duration,
    ) -> Result<Value> {
        let mut child = Command::new(&task.command)
            .args(&task.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' for task '{}'", task.command, task.name))?;

        // Feed stdin while draining stdout so neither side fills its pipe
        let stdin = child.stdin.take();
        let write_input = async move {
            if let Some(mut stdin) = stdin {
                // Programs that ignore stdin may exit before we finish writing
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
                // Dropping stdin signals EOF
            }
            Ok::<(), std::io::Error>(())
        };

        let (written, output) = timeout(task_timeout, async move {
            tokio::join!(write_input, child.wait_with_output())
        })
        .await
        .with_context(|| format!("Task '{}' timed out after {:?}", task.name, task_timeout))?;

        written.with_context(|| format!("Failed to write stdin for task '{}'", task.name))?;
        let output =
            output.with_context(|| format!("Failed to wait for task '{}'", task.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Task '{}' failed with exit code {}: {}",
                task.name,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout)
            .with_context(|| format!("Task '{}' output is not valid UTF-8", task.name))?;

        Ok(parse_output(stdout.trim()))
    }
}

/// Structured JSON is parsed; everything else, numbers included, stays text
fn parse_output(stdout: &str) -> Value {
    match serde_json::from_str::<Value>(stdout) {
        Ok(value @ (Value::Object(_) | Value::Array(_) | Value::Bool(_) | Value::Null)) => value,
        Ok(Value::String(s)) => Value::String(s),
        _ => Value::String(stdout.to_string()),
    }
}

/// Render a task value as stdin for a downstream task
fn to_stdin(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl RunExecutor for CommandRunExecutor {
    fn name(&self) -> &str {
        "command"
    }

    #[instrument(skip(self, spec, vars), fields(spec_id = spec.id, job_id = spec.job_id))]
    async fn execute_run(
        &self,
        deadline: Instant,
        spec: &PipelineSpec,
        vars: Vars,
    ) -> Result<(Run, TaskRunResults)> {
        spec.validate()?;

        let inputs = vars.to_json();
        let vars_stdin = serde_json::to_string(&inputs).context("Failed to serialize run vars")?;
        let mut run = Run::new(spec, inputs);

        let mut results: Vec<TaskRunResult> = Vec::with_capacity(spec.tasks.len());
        let mut by_name: HashMap<&str, TaskResult> = HashMap::new();

        for task in &spec.tasks {
            let started_at = Utc::now();

            let input = match task.input_from.as_deref() {
                None => Ok(vars_stdin.clone()),
                Some(upstream) => match by_name.get(upstream) {
                    Some(TaskResult {
                        value: Some(value),
                        error: None,
                    }) => Ok(to_stdin(value)),
                    _ => Err(format!("upstream task '{}' errored", upstream)),
                },
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = match input {
                Err(e) => TaskResult::error(e),
                Ok(_) if remaining.is_zero() => {
                    TaskResult::error(format!("deadline reached before task '{}' started", task.name))
                }
                Ok(input) => {
                    let task_timeout = task.timeout().min(remaining);
                    match self.execute_subprocess(task, &input, task_timeout).await {
                        Ok(value) => TaskResult::value(value),
                        Err(e) => {
                            warn!(task = %task.name, error = %e, "Task failed");
                            TaskResult::error(format!("{:#}", e))
                        }
                    }
                }
            };

            debug!(task = %task.name, errored = result.is_error(), "Task finished");

            by_name.insert(task.name.as_str(), result.clone());
            results.push(
                TaskRunResult::new(task.name.clone(), result, spec.is_terminal(&task.name))
                    .with_started_at(started_at),
            );
        }

        let results = TaskRunResults(results);
        run.finish(&results);

        Ok((run, results))
    }
}
