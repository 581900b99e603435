//! Task definition documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::flow::TaskRef;

/// `{ test, state }`: when `test` is false the step is recorded as `state`
/// (default `$$skipped`) without running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    pub test: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// A task document (`type: "task"`), or the blend of a flow reference over one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<Guard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// source path -> destination path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stdio: BTreeMap<String, String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskDef {
    /// Registry entry that executes this task.
    pub fn plugin_name(&self) -> &str {
        self.plugin.as_deref().unwrap_or(&self.name)
    }

    pub fn same_definition(&self, name: &str, owner: &str) -> bool {
        self.name == name && self.owner == owner
    }
}
