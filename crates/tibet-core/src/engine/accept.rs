//! Transitions that append a step or move the job state.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{ConfigurationError, Decision, Engine, EngineError, Transition, decide};
use crate::domain::{
    Guard, Job, JobState, Step, StepRole, StepState, TaskDef, TaskRef, blend,
};
use crate::params::{StepInputs, resolve};
use crate::ports::GuardScope;

const DEFAULT_GUARD_STATE: &str = "$$skipped";

impl Engine {
    /// Submitted job: copy the flow's structure and defaults into it.
    pub(crate) async fn initialize(&self, job: &mut Job) -> Result<Transition, EngineError> {
        match self.catalog.flow(&job.flow, &job.owner).await? {
            None => self.fail_job(
                job,
                ConfigurationError::FlowNotFound {
                    flow: job.flow.clone(),
                    owner: job.owner.clone(),
                },
            ),
            Some(flow) if !flow.is_enabled() => self.fail_job(
                job,
                ConfigurationError::FlowDisabled {
                    flow: job.flow.clone(),
                    owner: job.owner.clone(),
                },
            ),
            Some(flow) => {
                let mut params = Value::Object(std::mem::take(&mut job.params));
                blend(&mut params, &Value::Object(flow.params));
                if let Value::Object(map) = params {
                    job.params = map;
                }
                job.tasks = Some(flow.tasks);
                job.error = flow.error;
                job.retry = flow.retry;
                job.timeout = flow.timeout;
                job.steps.clear();
                job.run_start = 0;
                job.start = Some(self.now());
                job.end = None;
                job.exit = None;
                job.reason = None;
                job.state = JobState::Ready;
                info!(job = %job.id, flow = %job.flow, owner = %job.owner, "job initialized");
            }
        }
        self.save(job).await?;
        Ok(Transition::Saved)
    }

    /// Job is on a task boundary: act on what `decide` says.
    pub(crate) async fn accept_next_task(&self, job: &mut Job) -> Result<Transition, EngineError> {
        match decide(job) {
            Decision::Wait => Ok(Transition::Unchanged),
            Decision::Accept(task_ref) => self.accept_task(job, &task_ref, StepRole::Task).await,
            Decision::RetryStep(index) => self.retry_step(job, index).await,
            Decision::CleanupTask(index) => self.cleanup_task(job, index).await,
            Decision::EscalateJob(index) => self.escalate_step_failure(job, index).await,
            Decision::Finish => self.cleanup_job(job).await,
        }
    }

    /// Job in `$$timeout` / `$$error`: start a fresh run while the job retry
    /// budget lasts, otherwise clean up. A run that failed on configuration
    /// is never retried.
    pub(crate) async fn escalate_job(&self, job: &mut Job) -> Result<Transition, EngineError> {
        if job.run_is_fatal() {
            info!(job = %job.id, "configuration failure, not retrying job");
            return self.cleanup_job(job).await;
        }
        match job.retry {
            Some(remaining) if remaining > 0 => {
                job.retry = Some(remaining - 1);
                job.run_start = job.steps.len();
                job.state = JobState::Ready;
                job.reason = None;
                info!(job = %job.id, remaining = remaining - 1, "retrying job");
                self.save(job).await?;
                Ok(Transition::Saved)
            }
            _ => self.cleanup_job(job).await,
        }
    }

    /// Run the job-level error handler once for a failed run, then finish.
    async fn cleanup_job(&self, job: &mut Job) -> Result<Transition, EngineError> {
        let exit = job.classify_exit();
        let handled = job.run_steps().iter().any(|s| s.role == StepRole::Cleanup);
        if !exit.is_success() && !handled {
            if let Some(handler) = job.error.clone() {
                info!(job = %job.id, handler = %handler.task, "running job error handler");
                return self.accept_task(job, &handler, StepRole::Cleanup).await;
            }
        }
        job.finish(exit, self.now());
        info!(job = %job.id, state = %job.state, exit = ?exit, "job finished");
        self.save(job).await?;
        Ok(Transition::Saved)
    }

    async fn accept_task(
        &self,
        job: &mut Job,
        task_ref: &TaskRef,
        role: StepRole,
    ) -> Result<Transition, EngineError> {
        let Some(def) = self.catalog.task(&task_ref.task, &job.owner).await? else {
            self.fail_job(
                job,
                ConfigurationError::TaskNotFound {
                    task: task_ref.task.clone(),
                    owner: job.owner.clone(),
                },
            );
            self.save(job).await?;
            return Ok(Transition::Saved);
        };
        self.accept_definition(job, task_ref, &def, role).await
    }

    async fn accept_definition(
        &self,
        job: &mut Job,
        task_ref: &TaskRef,
        def: &TaskDef,
        role: StepRole,
    ) -> Result<Transition, EngineError> {
        let def = blend_task(task_ref, def)?;
        let step = self.claim_step(job, &def, role)?;
        info!(
            job = %job.id,
            step = step.index,
            task = %step.name,
            plugin = %step.plugin,
            state = %step.state,
            role = ?step.role,
            "step accepted"
        );
        job.push_step(step);
        self.save(job).await?;
        Ok(Transition::Saved)
    }

    /// Builds the next step for `def`: resolved params, guards applied.
    /// Resolution and guard failures end up in the step state, not in `Err`.
    fn claim_step(
        &self,
        job: &mut Job,
        def: &TaskDef,
        role: StepRole,
    ) -> Result<Step, EngineError> {
        let now = self.now();
        let mut step = Step {
            index: job.next_index(),
            name: def.name.clone(),
            plugin: def.plugin_name().to_string(),
            owner: def.owner.clone(),
            pid: self.pid.clone(),
            state: StepState::Ready,
            role,
            start: Some(now),
            end: None,
            params: Map::new(),
            retry: def.retry.unwrap_or(0),
            timeout: Some(def.timeout.or(job.timeout).unwrap_or(self.default_timeout_ms())),
            error: def.error.clone(),
            retry_of: None,
            stdout: None,
            reason: None,
            fatal: false,
            extra: Map::new(),
        };

        let inputs = StepInputs {
            job: &*job,
            step: &step,
            stdio: &def.stdio,
            defaults: &def.params,
        };
        let resolved = resolve(&inputs);
        let resolved = match resolved {
            Ok(resolved) => resolved.apply_to_job(job).map(|()| resolved),
            Err(err) => Err(err),
        };
        match resolved {
            Ok(resolved) => step.params = resolved.params,
            Err(err) => {
                let err = EngineError::from(err);
                warn!(job = %job.id, task = %step.name, kind = %err.kind(), error = %err, "cannot resolve step params");
                step.state = StepState::Error;
                step.retry = 0;
                step.end = Some(now);
                step.reason = Some(err.to_string());
                return Ok(step);
            }
        }

        self.apply_guards(job, &def.guards, &mut step, now)?;
        Ok(step)
    }

    /// First false guard decides the step state. A guard that cannot be
    /// evaluated, or names a bad state, fails the step as a configuration error.
    fn apply_guards(
        &self,
        job: &Job,
        guards: &[Guard],
        step: &mut Step,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if guards.is_empty() {
            return Ok(());
        }
        let (job_doc, step_doc) = guard_documents(job, step)?;
        let params = Value::Object(step.params.clone());
        let scope = GuardScope {
            job: &job_doc,
            step: &step_doc,
            params: &params,
        };

        for guard in guards {
            match self.guards.evaluate(&guard.test, &scope) {
                Ok(true) => continue,
                Ok(false) => {
                    let raw = guard.state.as_deref().unwrap_or(DEFAULT_GUARD_STATE);
                    match raw.parse::<StepState>() {
                        Ok(state) if state.is_terminal() => {
                            step.state = state;
                            step.reason = Some(format!("guard `{}` is false", guard.test));
                        }
                        _ => {
                            let err = ConfigurationError::InvalidGuardState(raw.to_string());
                            warn!(job = %job.id, task = %step.name, error = %err, "bad guard state");
                            step.state = StepState::Failed;
                            step.reason = Some(err.to_string());
                            step.fatal = true;
                        }
                    }
                }
                Err(err) => {
                    let err = EngineError::from(err);
                    warn!(job = %job.id, task = %step.name, test = %guard.test, error = %err, "guard failed");
                    step.state = StepState::Failed;
                    step.reason = Some(format!("guard `{}`: {err}", guard.test));
                    step.fatal = true;
                }
            }
            step.end = Some(now);
            break;
        }
        Ok(())
    }

    async fn retry_step(&self, job: &mut Job, index: usize) -> Result<Transition, EngineError> {
        let Some(failed) = job.steps.get(index) else {
            return Ok(Transition::Unchanged);
        };
        let retry = failed.retry_attempt(job.next_index(), &self.pid, self.now());
        info!(
            job = %job.id,
            step = retry.index,
            retry_of = index,
            remaining = retry.retry,
            task = %retry.name,
            "retrying step"
        );
        job.push_step(retry);
        self.save(job).await?;
        Ok(Transition::Saved)
    }

    /// Step failed for good: run its task-level handler if it has one,
    /// otherwise escalate to the job.
    async fn cleanup_task(&self, job: &mut Job, index: usize) -> Result<Transition, EngineError> {
        let Some(failed) = job.steps.get(index).cloned() else {
            return Ok(Transition::Unchanged);
        };
        let Some(handler) = failed.error.clone().filter(|_| failed.role.is_task()) else {
            return self.escalate_step_failure(job, index).await;
        };

        let Some(def) = self.catalog.task(&handler.task, &job.owner).await? else {
            self.fail_job(
                job,
                ConfigurationError::TaskNotFound {
                    task: handler.task.clone(),
                    owner: job.owner.clone(),
                },
            );
            self.save(job).await?;
            return Ok(Transition::Saved);
        };
        if def.same_definition(&failed.name, &failed.owner) {
            self.fail_job(
                job,
                ConfigurationError::RecursiveErrorHandler {
                    task: failed.name,
                    owner: failed.owner,
                },
            );
            self.save(job).await?;
            return Ok(Transition::Saved);
        }
        info!(job = %job.id, step = index, handler = %handler.task, "running task error handler");
        self.accept_definition(job, &handler, &def, StepRole::Error).await
    }

    /// Moves the job to `$$timeout` or `$$error` after the step at `index`.
    async fn escalate_step_failure(
        &self,
        job: &mut Job,
        index: usize,
    ) -> Result<Transition, EngineError> {
        let timed_out = job
            .steps
            .get(index)
            .is_some_and(|s| s.state == StepState::Timeout);
        job.state = if timed_out {
            JobState::Timeout
        } else {
            JobState::Error
        };
        job.reason = job.steps.get(index).and_then(|s| s.reason.clone());
        info!(job = %job.id, step = index, state = %job.state, "escalating step failure to job");
        self.save(job).await?;
        Ok(Transition::Saved)
    }

    fn fail_job(&self, job: &mut Job, error: ConfigurationError) {
        let err = EngineError::from(error);
        warn!(job = %job.id, kind = %err.kind(), reason = %err, "failing job");
        job.fail(err.to_string(), self.now());
    }
}

/// `job` / `step` as guard expressions see them.
fn guard_documents(job: &Job, step: &Step) -> Result<(Value, Value), EngineError> {
    let job_doc =
        serde_json::to_value(job).map_err(|e| EngineError::codec(format!("job {}", job.id), e))?;
    let step_doc = serde_json::to_value(step)
        .map_err(|e| EngineError::codec(format!("step {} of job {}", step.name, job.id), e))?;
    Ok((job_doc, step_doc))
}

/// Overrides on the flow's task reference win over the definition.
fn blend_task(task_ref: &TaskRef, def: &TaskDef) -> Result<TaskDef, EngineError> {
    let mut target = serde_json::to_value(task_ref)
        .map_err(|e| EngineError::codec(format!("task reference {}", task_ref.task), e))?;
    let source = serde_json::to_value(def)
        .map_err(|e| EngineError::codec(format!("task {}", def.name), e))?;
    blend(&mut target, &source);
    serde_json::from_value(target).map_err(|e| EngineError::codec(format!("task {}", def.name), e))
}
