//! Normalized workflow documents.
//!
//! Only the keys the scheduler needs are typed; everything else in a job
//! (steps, env, services, ...) stays an opaque `serde_yaml::Value` that is
//! forwarded to the runner untouched.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::errors::GraphError;

use super::trigger::Triggers;

/// A workflow file after YAML decoding.
#[derive(Debug, Clone)]
pub struct WorkflowDoc {
    pub name: Option<String>,
    pub triggers: Triggers,
    pub concurrency: Option<Concurrency>,
    /// `jobs.<id>` entries in declaration order.
    pub jobs: Vec<JobDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concurrency {
    pub group: String,
    pub cancel_in_progress: bool,
}

#[derive(Debug, Clone)]
pub struct JobDef {
    pub id: String,
    pub name: Option<String>,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub if_expr: Option<String>,
    pub matrix: Option<Value>,
    /// The full `jobs.<id>` mapping as written.
    pub raw: Value,
}

impl JobDef {
    /// Jobs whose condition checks upstream status keep running after a
    /// failed dependency; everything else is skipped.
    pub fn runs_regardless(&self) -> bool {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"\b(always|failure|cancelled)\s*\(\s*\)").expect("static regex")
        });
        self.if_expr.as_deref().is_some_and(|e| re.is_match(e))
    }
}

#[derive(Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "on")]
    on: Option<Value>,
    #[serde(default)]
    concurrency: Option<Value>,
    #[serde(default)]
    jobs: Mapping,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawJob {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    needs: Option<Value>,
    #[serde(default)]
    runs_on: Option<Value>,
    #[serde(default, rename = "if")]
    if_expr: Option<Value>,
    #[serde(default)]
    strategy: Option<RawStrategy>,
}

#[derive(Deserialize)]
struct RawStrategy {
    #[serde(default)]
    matrix: Option<Value>,
}

impl WorkflowDoc {
    pub fn parse(content: &str) -> Result<Self, GraphError> {
        let raw: RawWorkflow =
            serde_yaml::from_str(content).map_err(|e| GraphError::Parse(e.to_string()))?;

        let triggers = match &raw.on {
            Some(on) => Triggers::from_value(on)?,
            None => Triggers::default(),
        };
        let concurrency = raw.concurrency.as_ref().map(parse_concurrency).transpose()?;

        let mut jobs = Vec::with_capacity(raw.jobs.len());
        for (key, value) in &raw.jobs {
            let id = key
                .as_str()
                .ok_or_else(|| GraphError::Parse(format!("job key {:?} is not a string", key)))?
                .to_string();
            let job: RawJob = serde_yaml::from_value(value.clone())
                .map_err(|e| GraphError::Parse(format!("job '{}': {}", id, e)))?;
            jobs.push(JobDef {
                name: job.name,
                needs: string_list(job.needs.as_ref(), &id, "needs")?,
                runs_on: string_list(job.runs_on.as_ref(), &id, "runs-on")?,
                if_expr: job.if_expr.as_ref().map(scalar_string),
                matrix: job.strategy.and_then(|s| s.matrix),
                raw: value.clone(),
                id,
            });
        }

        Ok(Self {
            name: raw.name,
            triggers,
            concurrency,
            jobs,
        })
    }
}

fn parse_concurrency(value: &Value) -> Result<Concurrency, GraphError> {
    match value {
        Value::String(group) => Ok(Concurrency {
            group: group.clone(),
            cancel_in_progress: false,
        }),
        Value::Mapping(map) => {
            let group = map
                .get("group")
                .map(scalar_string)
                .ok_or_else(|| GraphError::Parse("concurrency.group is required".to_string()))?;
            let cancel_in_progress = map
                .get("cancel-in-progress")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(Concurrency {
                group,
                cancel_in_progress,
            })
        }
        other => Err(GraphError::Parse(format!(
            "unsupported concurrency value: {:?}",
            other
        ))),
    }
}

/// Accept `key: a` or `key: [a, b]`.
fn string_list(value: Option<&Value>, job: &str, key: &str) -> Result<Vec<String>, GraphError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => Ok(items.iter().map(scalar_string).collect()),
        Some(Value::Mapping(map)) if key == "runs-on" => {
            // `runs-on: { labels: [...] }`
            string_list(map.get("labels"), job, key)
        }
        Some(v @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => {
            Ok(vec![scalar_string(v)])
        }
        Some(other) => Err(GraphError::Parse(format!(
            "job '{}': unsupported {} value {:?}",
            job, key, other
        ))),
    }
}

/// Render a YAML scalar the way it was written; non-scalars become JSON.
pub(crate) fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
