//! Job documents and their steps.
//!
//! Job は 1 ドキュメント = 1 単位の作業。`steps` は追記のみで、retry や error handler も
//! 新しい Step として積まれる（監査ログを兼ねる）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::flow::{TaskRef, TaskStructure};
use super::state::{JobState, StepState};

/// Final status code written to `job.exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ExitCode {
    Success = 0,
    Timeout = 1,
    Failure = 2,
}

impl ExitCode {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Severity of a run whose last task step ended in `state`.
    pub fn from_step_state(state: StepState) -> Self {
        match state {
            StepState::Timeout => Self::Timeout,
            StepState::Error | StepState::Failed => Self::Failure,
            _ => Self::Success,
        }
    }
}

impl From<ExitCode> for u8 {
    fn from(code: ExitCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ExitCode {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Success),
            1 => Ok(Self::Timeout),
            2 => Ok(Self::Failure),
            other => Err(format!("unknown exit code {other}")),
        }
    }
}

/// Why a step was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    /// A task of the flow sequence (including its retries).
    #[default]
    Task,
    /// Task-level error handler.
    Error,
    /// Job-level error handler run before the job is finalized.
    Cleanup,
}

impl StepRole {
    pub fn is_task(&self) -> bool {
        matches!(self, Self::Task)
    }
}

/// One attempt at executing a task within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub name: String,
    pub plugin: String,
    pub owner: String,
    pub pid: String,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "StepRole::is_task")]
    pub role: StepRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub retry: u32,
    /// Step timeout in milliseconds, fixed at claim time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Task-level error handler carried from the task definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskRef>,
    /// Index of the failed step this one retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Failed on a configuration problem (missing plugin, broken guard).
    /// Neither the step nor the job is retried.
    #[serde(default, skip_serializing_if = "is_false")]
    pub fatal: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Step {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Active, started, not ended and older than its timeout.
    pub fn is_overdue(&self, now: DateTime<Utc>, default_timeout_ms: u64) -> bool {
        if !self.is_active() || self.end.is_some() {
            return false;
        }
        let Some(start) = self.start else {
            return false;
        };
        let limit = self.timeout.unwrap_or(default_timeout_ms);
        let elapsed = now.signed_duration_since(start).num_milliseconds();
        elapsed >= 0 && elapsed as u64 >= limit
    }

    /// A fresh attempt of this step: new index, one less retry, clean outputs.
    pub fn retry_attempt(&self, index: usize, pid: &str, now: DateTime<Utc>) -> Step {
        Step {
            index,
            pid: pid.to_string(),
            state: StepState::Ready,
            start: Some(now),
            end: None,
            retry: self.retry.saturating_sub(1),
            retry_of: Some(self.index),
            stdout: None,
            reason: None,
            fatal: false,
            ..self.clone()
        }
    }
}

/// A job document (`type: "job"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub flow: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "JobState::is_submitted")]
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TaskStructure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// First step of the current job attempt.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub run_start: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Job {
    /// Steps of the current attempt (`steps[run_start..]`).
    pub fn run_steps(&self) -> &[Step] {
        let from = self.run_start.min(self.steps.len());
        &self.steps[from..]
    }

    /// The current run hit a configuration failure; retrying it cannot help.
    pub fn run_is_fatal(&self) -> bool {
        self.run_steps().iter().any(|s| s.fatal)
    }

    pub fn sequence(&self) -> &[TaskRef] {
        self.tasks.as_ref().map(TaskStructure::tasks).unwrap_or(&[])
    }

    pub fn active_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.is_active())
    }

    /// No step is in flight.
    pub fn on_task_boundary(&self) -> bool {
        self.active_step().is_none()
    }

    /// First in-flight step claimed by `pid`.
    pub fn owned_active_step(&self, pid: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.pid == pid && s.is_active())
    }

    /// Severity of the current run, from its last sequence step.
    pub fn classify_exit(&self) -> ExitCode {
        self.run_steps()
            .iter()
            .rev()
            .find(|s| s.role.is_task())
            .map(|s| ExitCode::from_step_state(s.state))
            .unwrap_or(ExitCode::Success)
    }

    /// Appends `step` and moves the job onto it.
    pub fn push_step(&mut self, step: Step) {
        self.state = JobState::active(step.name.clone(), step.index);
        self.steps.push(step);
    }

    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    pub fn finish(&mut self, exit: ExitCode, now: DateTime<Utc>) {
        self.state = if exit.is_success() {
            JobState::Complete
        } else {
            JobState::Failed
        };
        self.exit = Some(exit);
        self.end = Some(now);
    }

    /// Configuration failure: terminal, never retried.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.reason = Some(reason.into());
        self.finish(ExitCode::Failure, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn step(index: usize, state: StepState, role: StepRole) -> Step {
        Step {
            index,
            name: format!("t{index}"),
            plugin: "echo".into(),
            owner: "DEFAULT".into(),
            pid: "worker-a".into(),
            state,
            role,
            start: None,
            end: None,
            params: Map::new(),
            retry: 0,
            timeout: None,
            error: None,
            retry_of: None,
            stdout: None,
            reason: None,
            fatal: false,
            extra: Map::new(),
        }
    }

    fn job_with(steps: Vec<Step>) -> Job {
        serde_json::from_value::<Job>(json!({"_id": "j", "flow": "f", "owner": "o"}))
            .map(|mut job| {
                job.steps = steps;
                job
            })
            .unwrap()
    }

    #[rstest]
    #[case(StepState::Complete, ExitCode::Success)]
    #[case(StepState::Skipped, ExitCode::Success)]
    #[case(StepState::Timeout, ExitCode::Timeout)]
    #[case(StepState::Error, ExitCode::Failure)]
    #[case(StepState::Failed, ExitCode::Failure)]
    fn exit_follows_last_task_step(#[case] last: StepState, #[case] expected: ExitCode) {
        let job = job_with(vec![
            step(0, StepState::Complete, StepRole::Task),
            step(1, last, StepRole::Task),
            step(2, StepState::Complete, StepRole::Cleanup),
        ]);
        assert_eq!(job.classify_exit(), expected);
    }

    #[test]
    fn run_window_starts_at_run_start() {
        let mut job = job_with(vec![
            step(0, StepState::Timeout, StepRole::Task),
            step(1, StepState::Complete, StepRole::Task),
        ]);
        job.run_start = 1;
        assert_eq!(job.run_steps().len(), 1);
        assert_eq!(job.classify_exit(), ExitCode::Success);

        job.run_start = 2;
        assert!(job.run_steps().is_empty());
    }

    #[test]
    fn retry_attempt_is_a_new_step() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut failed = step(0, StepState::Error, StepRole::Task);
        failed.retry = 2;
        failed.end = Some(now);
        failed.reason = Some("boom".into());

        let retry = failed.retry_attempt(1, "worker-b", now);
        assert_eq!(retry.index, 1);
        assert_eq!(retry.retry, 1);
        assert_eq!(retry.retry_of, Some(0));
        assert_eq!(retry.state, StepState::Ready);
        assert_eq!(retry.pid, "worker-b");
        assert!(retry.end.is_none() && retry.reason.is_none());
    }

    #[test]
    fn fatal_marks_only_the_run_it_belongs_to() {
        let mut broken = step(0, StepState::Failed, StepRole::Task);
        broken.fatal = true;
        let mut job = job_with(vec![broken, step(1, StepState::Complete, StepRole::Task)]);
        assert!(job.run_is_fatal());
        assert_eq!(serde_json::to_value(&job.steps[0]).unwrap()["fatal"], json!(true));
        assert!(serde_json::to_value(&job.steps[1]).unwrap().get("fatal").is_none());

        job.run_start = 1;
        assert!(!job.run_is_fatal());
    }

    #[test]
    fn overdue_needs_start_and_no_end() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let later = start + chrono::Duration::milliseconds(150);
        let mut s = step(0, StepState::Ready, StepRole::Task);
        s.timeout = Some(100);
        assert!(!s.is_overdue(later, 1000));
        s.start = Some(start);
        assert!(s.is_overdue(later, 1000));
        s.end = Some(later);
        assert!(!s.is_overdue(later, 1000));
    }

    #[test]
    fn job_round_trips_unknown_fields_and_state() {
        let doc = json!({
            "_id": "job-1", "_rev": "3-abc", "type": "job",
            "flow": "deploy", "owner": "acme",
            "state": "build-0", "exit": 1, "submitted_by": "ci"
        });
        let job: Job = serde_json::from_value(doc).unwrap();
        assert_eq!(job.state, JobState::active("build", 0));
        assert_eq!(job.exit, Some(ExitCode::Timeout));

        let back = serde_json::to_value(&job).unwrap();
        assert_eq!(back["type"], "job");
        assert_eq!(back["submitted_by"], "ci");
        assert_eq!(back["state"], "build-0");
    }
}
