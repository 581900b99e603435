//! Flow definition documents and task references.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Owner used as the shared fallback for flow / task lookups.
pub const DEFAULT_OWNER: &str = "DEFAULT";

/// View key for a definition: `"<name>::<owner>"`.
pub fn definition_key(name: &str, owner: &str) -> String {
    format!("{name}::{owner}")
}

/// A reference to a Task from a flow sequence or an `error` slot.
///
/// `{ "task": "<name>", ...overrides }`. A bare string is accepted as shorthand
/// for a reference without overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TaskRefRepr")]
pub struct TaskRef {
    pub task: String,
    #[serde(flatten)]
    pub overrides: Map<String, Value>,
}

impl TaskRef {
    pub fn named(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            overrides: Map::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskRefRepr {
    Name(String),
    Full {
        task: String,
        #[serde(flatten)]
        overrides: Map<String, Value>,
    },
}

impl From<TaskRefRepr> for TaskRef {
    fn from(repr: TaskRefRepr) -> Self {
        match repr {
            TaskRefRepr::Name(task) => Self::named(task),
            TaskRefRepr::Full { task, overrides } => Self { task, overrides },
        }
    }
}

/// How the tasks of a flow are arranged. Only `sequence` exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "structure", rename_all = "lowercase")]
pub enum TaskStructure {
    Sequence {
        #[serde(default)]
        sequence: Vec<TaskRef>,
    },
}

impl TaskStructure {
    pub fn sequence(tasks: impl IntoIterator<Item = TaskRef>) -> Self {
        Self::Sequence {
            sequence: tasks.into_iter().collect(),
        }
    }

    pub fn tasks(&self) -> &[TaskRef] {
        match self {
            Self::Sequence { sequence } => sequence,
        }
    }
}

/// A flow document (`type: "flow"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub owner: String,
    pub tasks: TaskStructure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Flow {
    /// Only an explicit `enabled: false` disables a flow.
    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }
}
