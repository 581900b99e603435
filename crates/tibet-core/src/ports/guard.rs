//! GuardEvaluator port - guard の `test` 式を評価する
//!
//! 式言語そのものは差し替え可能。既定実装は `crate::guard::ExpressionEvaluator`。

use serde_json::Value;

/// Values an expression may refer to.
#[derive(Debug, Clone, Copy)]
pub struct GuardScope<'a> {
    pub job: &'a Value,
    pub step: &'a Value,
    pub params: &'a Value,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardError {
    #[error("guard syntax error at column {col}: {message}")]
    Syntax { col: usize, message: String },

    #[error("guard refers to unknown root `{0}` (expected job, step or params)")]
    UnknownRoot(String),
}

pub trait GuardEvaluator: Send + Sync {
    fn evaluate(&self, test: &str, scope: &GuardScope<'_>) -> Result<bool, GuardError>;
}
