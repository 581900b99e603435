use crate::domain::ErrorKind;
use crate::params::ResolveError;
use crate::ports::{GuardError, StoreError};
use crate::runner::RunnerError;

/// Definition problems. Fatal to the job, never retried; the message becomes
/// `job.reason` (or `step.reason`).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("flow {flow}::{owner} not found")]
    FlowNotFound { flow: String, owner: String },

    #[error("flow {flow}::{owner} is disabled")]
    FlowDisabled { flow: String, owner: String },

    #[error("task {task}::{owner} not found")]
    TaskNotFound { task: String, owner: String },

    #[error("error handler of task {task}::{owner} resolves to the task itself")]
    RecursiveErrorHandler { task: String, owner: String },

    #[error("no runner registered for plugin '{0}'")]
    MissingPlugin(String),

    #[error("guard state '{0}' is not a terminal step state")]
    InvalidGuardState(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("parameter resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error("guard evaluation failed: {0}")]
    Guard(#[from] GuardError),

    #[error("runner failed: {0}")]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot convert {what}: {source}")]
    Codec {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn codec(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Codec {
            what: what.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            // an unparsable guard is a broken definition
            Self::Configuration(_) | Self::Guard(_) => ErrorKind::Configuration,
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Runner(_) => ErrorKind::Transient,
            Self::Store(e) if e.is_conflict() => ErrorKind::Conflict,
            Self::Store(_) | Self::Codec { .. } => ErrorKind::Infrastructure,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_classified() {
        let conflict = EngineError::from(StoreError::Conflict { id: "j".into() });
        assert!(conflict.is_conflict());

        let missing = EngineError::from(ConfigurationError::MissingPlugin("deploy".into()));
        assert_eq!(missing.kind(), ErrorKind::Configuration);
        assert_eq!(missing.to_string(), "no runner registered for plugin 'deploy'");

        let transport = EngineError::from(StoreError::Transport("refused".into()));
        assert_eq!(transport.kind(), ErrorKind::Infrastructure);
        assert!(transport.kind().is_retryable());

        let runner = EngineError::from(RunnerError::Failed("boom".into()));
        assert_eq!(runner.kind(), ErrorKind::Transient);
    }
}
