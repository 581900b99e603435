//! Step parameter resolution: stdio remap, task defaults, template pass.
//!
//! Sources (`stdio` keys):
//! - `job.<path>` / `step.<path>` / `params.<path>` read the job document, the
//!   step being built, and the job params
//! - anything else reads the previous completed step's `stdout`
//!   (the job params when no step has completed yet)
//!
//! Destinations (`stdio` values):
//! - `job.params.<path>` is written into the job document
//! - `step.params.<path>` is written into the final params, after templating
//! - `params.<path>` or a bare path goes into the working params

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::ResolveError;
use super::path::{get_path, set_path};
use super::template::{TemplateScope, render_value};
use crate::domain::{Job, Step, StepState, blend};

/// Everything known about a step at claim time.
#[derive(Debug, Clone, Copy)]
pub struct StepInputs<'a> {
    pub job: &'a Job,
    pub step: &'a Step,
    pub stdio: &'a BTreeMap<String, String>,
    /// Static params of the (blended) task definition.
    pub defaults: &'a Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    pub params: Map<String, Value>,
    /// `(path under job.params, value)` pairs to write into the job.
    pub job_params: Vec<(String, Value)>,
}

impl ResolvedParams {
    pub fn apply_to_job(&self, job: &mut Job) -> Result<(), ResolveError> {
        if self.job_params.is_empty() {
            return Ok(());
        }
        let mut params = Value::Object(std::mem::take(&mut job.params));
        let written = self
            .job_params
            .iter()
            .try_for_each(|(path, value)| set_path(&mut params, path, value.clone()));
        if let Value::Object(map) = params {
            job.params = map;
        }
        written
    }
}

/// Output the stdio remap reads bare keys from.
pub fn previous_output(job: &Job) -> Value {
    let last_complete = job
        .run_steps()
        .iter()
        .rev()
        .find(|s| s.state == StepState::Complete);
    match last_complete {
        Some(step) => step
            .stdout
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new())),
        None => Value::Object(job.params.clone()),
    }
}

pub fn resolve(inputs: &StepInputs<'_>) -> Result<ResolvedParams, ResolveError> {
    let mut job_doc = serde_json::to_value(inputs.job)?;
    let step_doc = serde_json::to_value(inputs.step)?;
    let job_params = Value::Object(inputs.job.params.clone());
    let previous = previous_output(inputs.job);

    let mut working = Value::Object(Map::new());
    let mut job_writes = Vec::new();
    let mut step_writes = Vec::new();

    for (source, destination) in inputs.stdio {
        let value = match source.split_once('.') {
            Some(("job", path)) => get_path(&job_doc, path),
            Some(("step", path)) => get_path(&step_doc, path),
            Some(("params", path)) => get_path(&job_params, path),
            _ => get_path(&previous, source),
        };
        let Some(value) = value.cloned() else {
            continue;
        };
        if let Some(path) = destination.strip_prefix("job.params.") {
            job_writes.push((path.to_string(), value));
        } else if let Some(path) = destination.strip_prefix("step.params.") {
            step_writes.push((path.to_string(), value));
        } else {
            let path = destination.strip_prefix("params.").unwrap_or(destination);
            set_path(&mut working, path, value)?;
        }
    }

    blend(&mut working, &Value::Object(inputs.defaults.clone()));

    // templates see the job as it will be saved
    for (path, value) in &job_writes {
        set_path(&mut job_doc, &format!("params.{path}"), value.clone())?;
    }

    let scope = TemplateScope {
        job: &job_doc,
        step: &step_doc,
        params: &working,
    };
    let mut rendered = render_value(&working, &scope)?;
    for (path, value) in step_writes {
        set_path(&mut rendered, &path, value)?;
    }

    match rendered {
        Value::Object(params) => Ok(ResolvedParams {
            params,
            job_params: job_writes,
        }),
        _ => Err(ResolveError::NotAnObject),
    }
}
