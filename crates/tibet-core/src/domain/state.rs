//! Job / Step の状態。
//!
//! ドキュメント上の表現は文字列（`$$ready`, `$$complete`, ...）。
//! Job の active 状態だけは `<task>-<index>` という形になる。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of a job document.
///
/// Serialized as the bare string stored in `job.state`; a missing / null state
/// (or the literal `"undefined"`) is [`JobState::Submitted`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum JobState {
    /// Newly submitted; not yet initialized from its flow.
    #[default]
    Submitted,
    Ready,
    /// Step `index` (running task `task`) is the current position.
    Active { task: String, index: usize },
    Timeout,
    Error,
    Failed,
    Complete,
    Cancelled,
    Paused,
    /// Anything we do not understand. Left alone.
    Unknown(String),
}

impl JobState {
    pub fn active(task: impl Into<String>, index: usize) -> Self {
        Self::Active {
            task: task.into(),
            index,
        }
    }

    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted)
    }

    /// `$$complete` / `$$failed` are final; nothing is ever appended afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Operator holds: the engine performs no action at all.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Paused)
    }
}

impl From<Option<String>> for JobState {
    fn from(raw: Option<String>) -> Self {
        match raw.as_deref() {
            None | Some("") | Some("undefined") => Self::Submitted,
            Some("$$ready") => Self::Ready,
            Some("$$timeout") => Self::Timeout,
            Some("$$error") => Self::Error,
            Some("$$failed") => Self::Failed,
            Some("$$complete") => Self::Complete,
            Some("$$cancelled") => Self::Cancelled,
            Some("$$paused") => Self::Paused,
            Some(other) => match other.rsplit_once('-') {
                Some((task, index)) if !task.is_empty() => match index.parse::<usize>() {
                    Ok(index) => Self::active(task, index),
                    Err(_) => Self::Unknown(other.to_string()),
                },
                _ => Self::Unknown(other.to_string()),
            },
        }
    }
}

impl From<JobState> for Option<String> {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Submitted => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => f.write_str("undefined"),
            Self::Ready => f.write_str("$$ready"),
            Self::Active { task, index } => write!(f, "{task}-{index}"),
            Self::Timeout => f.write_str("$$timeout"),
            Self::Error => f.write_str("$$error"),
            Self::Failed => f.write_str("$$failed"),
            Self::Complete => f.write_str("$$complete"),
            Self::Cancelled => f.write_str("$$cancelled"),
            Self::Paused => f.write_str("$$paused"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// State of one step.
///
/// `$$ready` / `$$active` are "active"; everything else is terminal for the
/// step (a `$$timeout` / `$$error` step may still be *retried*, which appends a
/// fresh step rather than reviving this one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    #[serde(rename = "$$ready")]
    Ready,
    #[serde(rename = "$$active")]
    Active,
    #[serde(rename = "$$skipped")]
    Skipped,
    #[serde(rename = "$$complete")]
    Complete,
    #[serde(rename = "$$timeout")]
    Timeout,
    #[serde(rename = "$$error")]
    Error,
    #[serde(rename = "$$failed")]
    Failed,
}

impl StepState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Active)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Complete or skipped: the sequence may move on.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "$$ready",
            Self::Active => "$$active",
            Self::Skipped => "$$skipped",
            Self::Complete => "$$complete",
            Self::Timeout => "$$timeout",
            Self::Error => "$$error",
            Self::Failed => "$$failed",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown step state: {0}")]
pub struct UnknownStepState(pub String);

impl FromStr for StepState {
    type Err = UnknownStepState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "$$ready" => Self::Ready,
            "$$active" => Self::Active,
            "$$skipped" => Self::Skipped,
            "$$complete" => Self::Complete,
            "$$timeout" => Self::Timeout,
            "$$error" => Self::Error,
            "$$failed" => Self::Failed,
            other => return Err(UnknownStepState(other.to_string())),
        })
    }
}
