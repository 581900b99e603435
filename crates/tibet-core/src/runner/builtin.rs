//! Built-in runners: `shell`, `echo`, `delay`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{RunContext, RunnerError, TaskRunner};
use crate::params::{TemplateScope, render_deferred};

/// Returns its params as stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoRunner;

#[async_trait]
impl TaskRunner for EchoRunner {
    async fn run(&self, ctx: RunContext) -> Result<Option<Value>, RunnerError> {
        Ok(Some(Value::Object(ctx.params)))
    }
}

/// Sleeps, then behaves like [`EchoRunner`].
#[derive(Debug, Clone, Copy)]
pub struct DelayRunner {
    pub default_ms: u64,
}

#[async_trait]
impl TaskRunner for DelayRunner {
    async fn run(&self, ctx: RunContext) -> Result<Option<Value>, RunnerError> {
        let ms = match ctx.params.get("ms") {
            None => self.default_ms,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| RunnerError::InvalidParams(format!("ms must be a non-negative integer, got {v}")))?,
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Some(Value::Object(ctx.params)))
    }
}

/// Options of a `shell` plugin file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellOptions {
    /// Used when the step params carry no `command`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Runs `<shell> -c <command>`.
///
/// The command comes from the `command` param (or the plugin option) after the
/// deferred template pass. A JSON object on stdout becomes the step output;
/// anything else is wrapped as `{"stdout": "<text>"}`. String values of an
/// `env` param object are exported to the process.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    options: ShellOptions,
}

impl ShellRunner {
    pub fn new(options: ShellOptions) -> Self {
        Self { options }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(ShellOptions {
            command: None,
            shell: default_shell(),
        })
    }
}

#[async_trait]
impl TaskRunner for ShellRunner {
    async fn run(&self, ctx: RunContext) -> Result<Option<Value>, RunnerError> {
        let job = serde_json::to_value(&ctx.job).map_err(|e| RunnerError::Failed(e.to_string()))?;
        let step = serde_json::to_value(&ctx.step).map_err(|e| RunnerError::Failed(e.to_string()))?;
        let params = Value::Object(ctx.params.clone());
        let rendered = render_deferred(
            &params,
            &TemplateScope {
                job: &job,
                step: &step,
                params: &params,
            },
        )
        .map_err(|e| RunnerError::InvalidParams(e.to_string()))?;

        let command = rendered
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.options.command.clone())
            .ok_or_else(|| RunnerError::InvalidParams("no command given".into()))?;

        let mut cmd = Command::new(&self.options.shell);
        cmd.arg("-c")
            .arg(&command)
            .env("TIBET_JOB", &ctx.job.id)
            .env("TIBET_STEP", ctx.step.index.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(Value::Object(env)) = rendered.get("env") {
            for (key, value) in env {
                if let Some(value) = value.as_str() {
                    cmd.env(key, value);
                }
            }
        }

        info!(job = %ctx.job.id, step = ctx.step.index, %command, "starting shell step");
        let output = cmd.output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            debug!(job = %ctx.job.id, step = ctx.step.index, "stderr: {stderr}");
        }
        if !output.status.success() {
            return Err(RunnerError::ExitStatus {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Some(parse_stdout(stdout)))
    }
}

fn parse_stdout(stdout: String) -> Value {
    match serde_json::from_str::<Value>(&stdout) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => json!({ "stdout": stdout }),
    }
}

/// Options of a `delay` plugin file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DelayOptions {
    #[serde(default)]
    pub ms: u64,
}

pub(crate) fn echo_factory(_options: &Map<String, Value>) -> Result<Arc<dyn TaskRunner>, String> {
    Ok(Arc::new(EchoRunner))
}

pub(crate) fn delay_factory(options: &Map<String, Value>) -> Result<Arc<dyn TaskRunner>, String> {
    let options: DelayOptions =
        serde_json::from_value(Value::Object(options.clone())).map_err(|e| e.to_string())?;
    Ok(Arc::new(DelayRunner {
        default_ms: options.ms,
    }))
}

pub(crate) fn shell_factory(options: &Map<String, Value>) -> Result<Arc<dyn TaskRunner>, String> {
    let options: ShellOptions =
        serde_json::from_value(Value::Object(options.clone())).map_err(|e| e.to_string())?;
    Ok(Arc::new(ShellRunner::new(options)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, Step};

    fn ctx(params: Value) -> RunContext {
        let job: Job = serde_json::from_value(json!({"_id": "job-7", "flow": "f", "owner": "o"})).unwrap();
        let step: Step = serde_json::from_value(json!({
            "index": 1, "name": "sh", "plugin": "shell", "owner": "DEFAULT",
            "pid": "worker-a", "state": "$$ready"
        }))
        .unwrap();
        let Value::Object(params) = params else { unreachable!() };
        RunContext { job, step, params }
    }

    #[tokio::test]
    async fn echo_returns_params() {
        let out = EchoRunner.run(ctx(json!({"a": 1}))).await.unwrap();
        assert_eq!(out, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn shell_json_stdout_becomes_output() {
        let out = ShellRunner::default()
            .run(ctx(json!({"command": "printf '{\"id\": \"%s\", \"n\": 2}' \"$TIBET_JOB\""})))
            .await
            .unwrap();
        assert_eq!(out, Some(json!({"id": "job-7", "n": 2})));
    }

    #[tokio::test]
    async fn shell_plain_stdout_is_wrapped_and_deferred_templates_render() {
        let out = ShellRunner::default()
            .run(ctx(json!({"command": "echo {{ params.word }}-$GREETING", "word": "hi", "env": {"GREETING": "there"}})))
            .await
            .unwrap();
        assert_eq!(out, Some(json!({"stdout": "hi-there"})));
    }

    #[tokio::test]
    async fn shell_non_zero_exit_fails() {
        let err = ShellRunner::default()
            .run(ctx(json!({"command": "echo nope >&2; exit 3"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::ExitStatus { code: Some(3), ref stderr } if stderr == "nope"
        ));
    }

    #[tokio::test]
    async fn shell_without_command_is_invalid() {
        let err = ShellRunner::default().run(ctx(json!({}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn delay_rejects_bad_ms() {
        let runner = DelayRunner { default_ms: 0 };
        assert!(runner.run(ctx(json!({"ms": "soon"}))).await.is_err());
        assert_eq!(runner.run(ctx(json!({"ms": 1}))).await.unwrap(), Some(json!({"ms": 1})));
    }
}
