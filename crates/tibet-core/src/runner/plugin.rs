//! Task plugin loader.
//!
//! 起動時に一度だけ plugin ディレクトリを走査する。各 `*.toml` が 1 つの runner:
//!
//! ```toml
//! # plugins/deploy.toml -> registered as "deploy"
//! kind = "shell"          # factory name; defaults to the file stem
//!
//! [options]
//! command = "make deploy ENV={{ params.env }}"
//! ```
//!
//! 隠しファイルとバックアップ（`~`, `.bak`, `.orig`, `.swp`）は無視する。

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::TaskRunner;
use super::builtin::{delay_factory, echo_factory, shell_factory};
use super::registry::{RegistryError, RunnerRegistry};

/// Builds a runner from plugin options.
pub type RunnerFactory = fn(&Map<String, Value>) -> Result<Arc<dyn TaskRunner>, String>;

/// Factories by kind.
#[derive(Clone)]
pub struct FactoryTable {
    factories: HashMap<String, RunnerFactory>,
}

impl FactoryTable {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// `shell`, `echo` and `delay`.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.register("shell", shell_factory);
        table.register("echo", echo_factory);
        table.register("delay", delay_factory);
        table
    }

    /// Adds (or replaces) the factory for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: RunnerFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn build(
        &self,
        name: &str,
        kind: &str,
        options: &Map<String, Value>,
    ) -> Result<Arc<dyn TaskRunner>, RegistryError> {
        let factory = self.factories.get(kind).ok_or_else(|| RegistryError::UnknownKind {
            name: name.to_string(),
            kind: kind.to_string(),
        })?;
        factory(options).map_err(|message| RegistryError::InvalidOptions {
            name: name.to_string(),
            message,
        })
    }

    /// Registers every kind under its own name with empty options, leaving
    /// names that are already taken alone. Returns the names added.
    pub fn register_defaults(&self, registry: &mut RunnerRegistry) -> Result<Vec<String>, RegistryError> {
        let mut kinds: Vec<&String> = self.factories.keys().collect();
        kinds.sort();
        let mut added = Vec::new();
        for kind in kinds {
            if registry.contains(kind) {
                continue;
            }
            registry.register(kind.clone(), self.build(kind, kind, &Map::new())?)?;
            added.push(kind.clone());
        }
        Ok(added)
    }
}

impl Default for FactoryTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PluginFile {
    kind: Option<String>,
    #[serde(default)]
    options: toml::Table,
}

fn is_plugin_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || [".bak", ".orig", ".swp", "~"].iter().any(|s| name.ends_with(s)) {
        return false;
    }
    path.extension().is_some_and(|ext| ext == "toml")
}

/// Loads every plugin file in `dir` into `registry`. Returns the registered names.
pub fn load_plugins(
    dir: &Path,
    factories: &FactoryTable,
    registry: &mut RunnerRegistry,
) -> Result<Vec<String>, RegistryError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| RegistryError::Io { path, source }
    };

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err(dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()
        .map_err(io_err(dir))?;
    paths.sort();

    let mut loaded = Vec::new();
    for path in paths {
        if !path.is_file() || !is_plugin_file(&path) {
            debug!(path = %path.display(), "skipping non-plugin file");
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };

        let text = std::fs::read_to_string(&path).map_err(io_err(&path))?;
        let file: PluginFile = toml::from_str(&text).map_err(|source| RegistryError::Parse {
            path: path.clone(),
            source,
        })?;
        let options = match serde_json::to_value(&file.options) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                return Err(RegistryError::InvalidOptions {
                    name,
                    message: e.to_string(),
                });
            }
        };
        let kind = file.kind.unwrap_or_else(|| name.clone());

        let runner = factories.build(&name, &kind, &options)?;
        registry.register(name.clone(), runner)?;
        info!(plugin = %name, %kind, "registered plugin");
        loaded.push(name);
    }
    Ok(loaded)
}
