//! EngineBuilder - Engine の組み立てと起動時検証
//!
//! - store / registry / guard 評価 / 時計 / pid を注入して `Engine` を作る
//! - `expect_plugins()` で必要な runner を宣言し、`build()` で不足を検出（Fail-fast）

use std::sync::Arc;

use crate::engine::{Engine, EngineOptions};
use crate::guard::ExpressionEvaluator;
use crate::ports::{Clock, DocumentStore, GuardEvaluator, IdGenerator, SystemClock, UlidGenerator};
use crate::runner::{RegistryError, RunnerRegistry, TaskRunner, TypedRunner};

/// ```ignore
/// let engine = EngineBuilder::new()
///     .store(store)
///     .register("fetch", Arc::new(FetchRunner))?
///     .expect_plugins(&["fetch", "shell"])
///     .build()?;
/// ```
pub struct EngineBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    registry: RunnerRegistry,
    guards: Arc<dyn GuardEvaluator>,
    clock: Arc<dyn Clock>,
    pid: Option<String>,
    options: EngineOptions,
    expected_plugins: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no document store configured")]
    MissingStore,

    #[error("Missing plugins: {0:?}. These runners were expected but not registered.")]
    MissingPlugins(Vec<String>),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            registry: RunnerRegistry::new(),
            guards: Arc::new(ExpressionEvaluator),
            clock: Arc::new(SystemClock),
            pid: None,
            options: EngineOptions::default(),
            expected_plugins: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the registry (e.g. one filled by the plugin loader).
    pub fn registry(mut self, registry: RunnerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn register(
        mut self,
        name: impl Into<String>,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(name, runner)?;
        Ok(self)
    }

    pub fn register_typed<R: TypedRunner + 'static>(
        mut self,
        name: impl Into<String>,
        runner: R,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed(name, runner)?;
        Ok(self)
    }

    pub fn guards(mut self, guards: Arc<dyn GuardEvaluator>) -> Self {
        self.guards = guards;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fixed worker identity. A `worker-<ulid>` is generated when unset.
    pub fn pid(mut self, pid: impl Into<String>) -> Self {
        self.pid = Some(pid.into());
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn expect_plugins(mut self, names: &[&str]) -> Self {
        self.expected_plugins = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// 期待集合 ⊆ 登録済み集合 をチェックしてから Engine を作る
    pub fn build(self) -> Result<Arc<Engine>, BuildError> {
        if let Some(expected) = &self.expected_plugins {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingPlugins(missing));
            }
        }
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let pid = self.pid.unwrap_or_else(|| {
            UlidGenerator::new(Arc::clone(&self.clock))
                .generate_worker_id()
                .to_string()
        });
        Ok(Arc::new(Engine::new(
            store,
            Arc::new(self.registry),
            self.guards,
            self.clock,
            pid,
            self.options,
        )))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStore;
    use crate::runner::EchoRunner;

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_build_success() {
        let engine = EngineBuilder::new()
            .store(store())
            .register("echo", Arc::new(EchoRunner))
            .unwrap()
            .expect_plugins(&["echo"])
            .pid("worker-a")
            .build()
            .unwrap();
        assert_eq!(engine.pid(), "worker-a");
        assert!(engine.registry().contains("echo"));
    }

    #[test]
    fn test_build_missing_plugins() {
        let result = EngineBuilder::new()
            .store(store())
            .register("echo", Arc::new(EchoRunner))
            .unwrap()
            .expect_plugins(&["echo", "fetch"])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingPlugins(missing)) if missing == vec!["fetch".to_string()]
        ));
    }

    #[test]
    fn test_build_without_store() {
        assert!(matches!(
            EngineBuilder::new().build(),
            Err(BuildError::MissingStore)
        ));
    }

    #[test]
    fn generated_pid_is_a_worker_id() {
        let engine = EngineBuilder::new().store(store()).build().unwrap();
        assert!(engine.pid().starts_with("worker-"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let result = EngineBuilder::new()
            .register("echo", Arc::new(EchoRunner))
            .unwrap()
            .register("echo", Arc::new(EchoRunner));
        assert!(matches!(result, Err(RegistryError::DuplicateRunner(_))));
    }
}
