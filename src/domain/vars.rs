//! Run input variables.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::job::JobSpec;

/// Variables a run starts with, addressable by dotted path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vars(Map<String, Value>);

impl Vars {
    pub fn new(values: Map<String, Value>) -> Self {
        Self(values)
    }

    /// Job identity under `jobSpec` and bridge metadata under `jobRun.meta`
    pub fn for_job(job: &JobSpec, meta: Option<Value>) -> Self {
        let value = json!({
            "jobSpec": {
                "databaseID": job.id,
                "externalJobID": job.external_job_id,
                "name": job.name_or_default(),
            },
            "jobRun": {
                "meta": meta,
            },
        });

        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    /// Look up a value by dotted path, e.g. `jobRun.meta.latestAnswer`
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }
}
