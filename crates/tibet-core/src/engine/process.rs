//! Running the steps this worker claimed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{ConfigurationError, Engine, EngineError, InflightKey, Transition};
use crate::domain::{Job, Step, StepState};
use crate::runner::{RunContext, TaskRunner};

/// How a runner invocation ended.
#[derive(Debug, Clone)]
enum StepOutcome {
    Complete(Option<Value>),
    Error(String),
    Timeout(u64),
}

impl StepOutcome {
    fn apply(self, step: &mut Step, now: DateTime<Utc>) {
        match self {
            Self::Complete(stdout) => {
                step.state = StepState::Complete;
                step.stdout = stdout;
                step.end = Some(now);
            }
            Self::Error(reason) => {
                step.state = StepState::Error;
                step.reason = Some(reason);
                step.end = Some(now);
            }
            // end はつけない: 時間切れは sweep と同じ扱い
            Self::Timeout(limit) => {
                step.state = StepState::Timeout;
                step.reason = Some(format!("timed out after {limit}ms"));
            }
        }
    }
}

impl Engine {
    /// Hands the in-flight step owned by this worker to its runner. The run
    /// itself happens on a spawned task; the result is written back by
    /// `record_outcome`.
    pub(crate) async fn process_owned_tasks(
        self: &Arc<Self>,
        job: &mut Job,
    ) -> Result<Transition, EngineError> {
        let Some(step) = job.owned_active_step(&self.pid).cloned() else {
            return Ok(Transition::Unchanged);
        };
        let key: InflightKey = (job.id.clone(), step.index);
        if !self.claim_inflight(&key) {
            debug!(job = %job.id, step = step.index, "step already running");
            return Ok(Transition::Unchanged);
        }

        let Some(runner) = self.registry.resolve(&step.plugin) else {
            self.release_inflight(&key);
            let err = EngineError::from(ConfigurationError::MissingPlugin(step.plugin.clone()));
            warn!(job = %job.id, step = step.index, kind = %err.kind(), error = %err, "cannot run step");
            let now = self.now();
            if let Some(claimed) = job.steps.get_mut(step.index) {
                claimed.state = StepState::Error;
                claimed.retry = 0;
                claimed.end = Some(now);
                claimed.reason = Some(err.to_string());
                claimed.fatal = true;
            }
            self.save(job).await?;
            return Ok(Transition::Saved);
        };

        let engine = Arc::clone(self);
        let job_id = job.id.clone();
        tokio::spawn(async move {
            engine.execute(job_id, step.index, runner).await;
            engine.release_inflight(&key);
        });
        Ok(Transition::Spawned)
    }

    async fn execute(&self, job_id: String, index: usize, runner: Arc<dyn TaskRunner>) {
        // 古い change イベント由来の二重起動を避けるため最新版で確認する
        let fresh = match self.load(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                error!(job = %job_id, step = index, error = %err, "cannot re-read job before running");
                return;
            }
        };
        let Some(step) = fresh
            .steps
            .get(index)
            .filter(|s| s.is_active() && s.pid == self.pid)
            .cloned()
        else {
            debug!(job = %job_id, step = index, "step no longer ours, not running");
            return;
        };

        let limit = step.timeout.unwrap_or(self.default_timeout_ms());
        info!(job = %job_id, step = index, task = %step.name, plugin = %step.plugin, "running step");
        let ctx = RunContext {
            params: step.params.clone(),
            job: fresh,
            step,
        };
        let outcome = match tokio::time::timeout(Duration::from_millis(limit), runner.run(ctx)).await
        {
            Ok(Ok(stdout)) => StepOutcome::Complete(stdout),
            Ok(Err(err)) => {
                let err = EngineError::from(err);
                warn!(job = %job_id, step = index, kind = %err.kind(), error = %err, "step failed");
                StepOutcome::Error(err.to_string())
            }
            Err(_) => {
                warn!(job = %job_id, step = index, limit_ms = limit, "step timed out");
                StepOutcome::Timeout(limit)
            }
        };

        if let Err(err) = self.record_outcome(&job_id, index, outcome).await {
            error!(job = %job_id, step = index, error = %err, "cannot record step outcome");
        }
    }

    /// Writes the outcome into the latest revision, but only while the step is
    /// still in flight and owned by this worker. Anything else means the step
    /// was timed out (or the job moved on) and the result is dropped.
    async fn record_outcome(
        &self,
        job_id: &str,
        index: usize,
        outcome: StepOutcome,
    ) -> Result<(), EngineError> {
        for attempt in 0..=self.options.max_conflict_retries {
            let Some(mut job) = self.load(job_id).await? else {
                warn!(job = %job_id, step = index, "job disappeared while its step was running");
                return Ok(());
            };
            let now = self.now();
            let Some(step) = job.steps.get_mut(index) else {
                return Ok(());
            };
            if !step.is_active() || step.pid != self.pid {
                debug!(job = %job_id, step = index, state = %step.state, "dropping late completion");
                return Ok(());
            }
            outcome.clone().apply(step, now);
            let state = step.state;

            match self.save(&mut job).await {
                Ok(()) => {
                    info!(job = %job_id, step = index, state = %state, "step finished");
                    return Ok(());
                }
                Err(err) if err.is_conflict() => {
                    debug!(job = %job_id, step = index, attempt, "conflict recording outcome");
                }
                Err(err) => return Err(err),
            }
        }
        warn!(job = %job_id, step = index, "gave up recording outcome after repeated conflicts");
        Ok(())
    }
}
