//! The campaign contract: stateless plan/analyze over an opaque state blob.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::status::TaskStatus;
use crate::workflow::Workflow;

/// Terminal outcome of one task, handed to `analyze`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_key: Option<String>,
    /// Artifact name -> path collected by the operator.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    /// Structured data reported by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// task_id -> result for the just-finished workflow.
pub type TaskResults = BTreeMap<String, TaskResult>;

/// A campaign is two pure functions over an opaque, serializable state.
///
/// `plan` produces the next iteration's workflow (None = campaign finished);
/// `analyze` folds the terminal results of the current workflow into a new
/// state. The engine owns persistence of the state blob; implementations
/// must not keep mutable state of their own.
pub trait Campaign: Send + Sync {
    fn plan(&self, state: Option<&Value>) -> Result<Option<Workflow>, EngineError>;

    fn analyze(&self, state: Option<Value>, results: &TaskResults) -> Result<Value, EngineError>;
}
