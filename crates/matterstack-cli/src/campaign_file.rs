//! Workspace campaigns loaded from `workflow.yaml`.
//!
//! A workspace directory declares its campaign as a static task list:
//!
//! ```yaml
//! tasks:
//!   - task_id: relax
//!     command: python relax.py
//!     operator_key: hpc.default
//!   - task_id: score
//!     command: python score.py
//!     dependencies: [relax]
//! ```
//!
//! The campaign plans that workflow once and finishes after analysis.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};

use matterstack_core::{Campaign, EngineError, Task, TaskResults, TaskStatus, Workflow};

#[derive(Deserialize)]
struct WorkflowFile {
    tasks: Vec<Task>,
}

/// Campaign backed by a workspace `workflow.yaml`.
#[derive(Debug)]
pub struct FileCampaign {
    path: PathBuf,
}

impl FileCampaign {
    pub fn for_workspace(workspaces_root: &Path, slug: &str) -> Result<Self, EngineError> {
        let path = workspaces_root.join(slug).join("workflow.yaml");
        if !path.is_file() {
            return Err(EngineError::Invalid(format!(
                "workspace {slug:?} has no workflow.yaml at {}",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    fn load_workflow(&self) -> Result<Workflow, EngineError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| EngineError::Invalid(format!("read {}: {e}", self.path.display())))?;
        let file: WorkflowFile = serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Invalid(format!("parse {}: {e}", self.path.display())))?;
        let mut workflow = Workflow::new();
        for task in file.tasks {
            workflow
                .add_task(task)
                .map_err(|e| EngineError::Invalid(format!("{}: {e}", self.path.display())))?;
        }
        Ok(workflow)
    }
}

impl Campaign for FileCampaign {
    fn plan(&self, state: Option<&Value>) -> Result<Option<Workflow>, EngineError> {
        if state.is_some() {
            return Ok(None);
        }
        Ok(Some(self.load_workflow()?))
    }

    fn analyze(&self, _state: Option<Value>, results: &TaskResults) -> Result<Value, EngineError> {
        let completed = results
            .values()
            .filter(|r| r.status == Some(TaskStatus::Completed))
            .count();
        let failed = results
            .values()
            .filter(|r| matches!(r.status, Some(TaskStatus::Failed | TaskStatus::Cancelled)))
            .count();
        Ok(json!({
            "total": results.len(),
            "completed": completed,
            "failed": failed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_and_plans_workflow_once() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("films");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(
            ws.join("workflow.yaml"),
            r#"
tasks:
  - task_id: deposit
    command: python deposit.py
  - task_id: anneal
    command: python anneal.py
    dependencies: [deposit]
"#,
        )
        .unwrap();

        let campaign = FileCampaign::for_workspace(dir.path(), "films").unwrap();
        let workflow = campaign.plan(None).unwrap().unwrap();
        assert_eq!(workflow.len(), 2);
        assert!(workflow.get("anneal").unwrap().dependencies.contains("deposit"));

        // After the first round the campaign is done.
        assert!(campaign.plan(Some(&json!({}))).unwrap().is_none());
    }

    #[test]
    fn missing_workflow_file_is_a_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileCampaign::for_workspace(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
    }
}
