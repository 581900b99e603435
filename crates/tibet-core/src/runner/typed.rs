//! Typed runners.
//!
//! `TypedRunner` は params を `serde` の型で受け取る runner。
//! `Typed<R>` で包むと object-safe な `TaskRunner` になり、registry に入れられる。

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{RunContext, RunnerError, TaskRunner};

#[async_trait]
pub trait TypedRunner: Send + Sync {
    type Params: DeserializeOwned + Send;

    async fn run(&self, params: Self::Params, ctx: RunContext) -> Result<Option<Value>, RunnerError>;
}

pub struct Typed<R> {
    runner: R,
}

impl<R: TypedRunner> Typed<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<R: TypedRunner> TaskRunner for Typed<R> {
    async fn run(&self, ctx: RunContext) -> Result<Option<Value>, RunnerError> {
        let params: R::Params = serde_json::from_value(Value::Object(ctx.params.clone()))
            .map_err(|e| RunnerError::InvalidParams(e.to_string()))?;
        self.runner.run(params, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, Step};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Scale {
        replicas: u32,
    }

    struct ScaleRunner;

    #[async_trait]
    impl TypedRunner for ScaleRunner {
        type Params = Scale;

        async fn run(&self, params: Scale, _ctx: RunContext) -> Result<Option<Value>, RunnerError> {
            Ok(Some(json!({"scaled_to": params.replicas})))
        }
    }

    fn ctx(params: Value) -> RunContext {
        let job: Job = serde_json::from_value(json!({"_id": "j", "flow": "f", "owner": "o"})).unwrap();
        let step: Step = serde_json::from_value(json!({
            "index": 0, "name": "scale", "plugin": "scale", "owner": "DEFAULT",
            "pid": "worker-a", "state": "$$ready"
        }))
        .unwrap();
        let Value::Object(params) = params else { unreachable!() };
        RunContext { job, step, params }
    }

    #[tokio::test]
    async fn decodes_params_before_running() {
        let runner = Typed::new(ScaleRunner);
        let out = runner.run(ctx(json!({"replicas": 3}))).await.unwrap();
        assert_eq!(out, Some(json!({"scaled_to": 3})));
    }

    #[tokio::test]
    async fn bad_params_are_rejected() {
        let runner = Typed::new(ScaleRunner);
        let err = runner.run(ctx(json!({"replicas": "many"}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidParams(_)));
    }
}
