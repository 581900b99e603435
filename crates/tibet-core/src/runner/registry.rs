use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::TaskRunner;
use super::typed::{Typed, TypedRunner};

/// Registry of runners (plugin name -> runner).
///
/// 起動時に組み立てて、以降は読み取りのみ（`Arc` で engine と共有）。
#[derive(Default, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("runner '{0}' is already registered")]
    DuplicateRunner(String),

    #[error("plugin '{name}' names unknown runner kind '{kind}'")]
    UnknownKind { name: String, kind: String },

    #[error("plugin '{name}' has invalid options: {message}")]
    InvalidOptions { name: String, message: String },

    #[error("cannot read plugin {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse plugin {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner under `name`. Duplicate names are rejected.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.runners.contains_key(&name) {
            return Err(RegistryError::DuplicateRunner(name));
        }
        self.runners.insert(name, runner);
        Ok(())
    }

    /// Register a typed runner; its params are decoded before each call.
    pub fn register_typed<R: TypedRunner + 'static>(
        &mut self,
        name: impl Into<String>,
        runner: R,
    ) -> Result<(), RegistryError> {
        self.register(name, Arc::new(Typed::new(runner)))
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn TaskRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
