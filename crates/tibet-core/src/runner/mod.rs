//! Task Runner Registry.
//!
//! Runner は「1 step を実行して stdout（任意の JSON）を返す」非同期関数。
//! 失敗は `Err` で返す。タイムアウトは engine 側で `tokio::time::timeout` により
//! 外から強制されるが、runner 自身もキャンセル（future の drop）に耐えること。

pub mod builtin;
pub mod plugin;
pub mod registry;
pub mod typed;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::{Job, Step};

pub use builtin::{DelayRunner, EchoRunner, ShellRunner};
pub use plugin::{FactoryTable, RunnerFactory, load_plugins};
pub use registry::{RegistryError, RunnerRegistry};
pub use typed::{Typed, TypedRunner};

/// Input handed to a runner.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Job document as observed when the step was picked up.
    pub job: Job,
    pub step: Step,
    /// Resolved step params (`step.params`).
    pub params: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("command exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

/// A pluggable step executor.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Runs one step. The `Ok` value becomes `step.stdout`.
    async fn run(&self, ctx: RunContext) -> Result<Option<Value>, RunnerError>;
}
