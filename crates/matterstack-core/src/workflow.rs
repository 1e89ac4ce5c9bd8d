//! Task and workflow DAG types.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::generate_task_id;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("task with id {0:?} already exists")]
    DuplicateTask(String),
    #[error("dependency {dep:?} of task {task:?} not found in workflow")]
    MissingDependency { task: String, dep: String },
    #[error("workflow graph has a cycle involving task {0:?}")]
    Cycle(String),
}

/// A file input staged into the task working directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileInput {
    /// Literal content written to the destination path.
    Inline(String),
    /// Content copied from a local source path.
    LocalPath(String),
}

/// Include/exclude glob patterns for selective artifact download.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPatterns {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A declarative unit of work: a shell command with file inputs, resource
/// intent, and dependency edges.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub command: String,
    /// Destination path (relative to the workdir) -> content source.
    #[serde(default)]
    pub files: BTreeMap<String, FileInput>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Task ids that must complete before this task starts.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default = "default_time_limit")]
    pub time_limit_minutes: u32,

    /// Proceed even if a dependency failed.
    #[serde(default)]
    pub allow_dependency_failure: bool,
    /// A failure of this task does not fail the run.
    #[serde(default)]
    pub allow_failure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_patterns: Option<DownloadPatterns>,

    /// Canonical routing key (e.g. "hpc.default"); None routes via env or
    /// the run default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_key: Option<String>,
}

fn default_cores() -> u32 {
    1
}

fn default_memory_gb() -> u32 {
    1
}

fn default_time_limit() -> u32 {
    60
}

impl Task {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            task_id: generate_task_id(""),
            command: command.into(),
            files: BTreeMap::new(),
            env: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            cores: default_cores(),
            memory_gb: default_memory_gb(),
            gpus: 0,
            time_limit_minutes: default_time_limit(),
            allow_dependency_failure: false,
            allow_failure: false,
            download_patterns: None,
            operator_key: None,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_file(mut self, dest: impl Into<String>, input: FileInput) -> Self {
        self.files.insert(dest.into(), input);
        self
    }

    pub fn with_operator_key(mut self, key: impl Into<String>) -> Self {
        self.operator_key = Some(key.into());
        self
    }

    pub fn with_allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    pub fn with_allow_dependency_failure(mut self, allow: bool) -> Self {
        self.allow_dependency_failure = allow;
        self
    }
}

/// A DAG of tasks, preserving declaration order for deterministic dispatch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Workflow {
    tasks: Vec<Task>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task; its dependencies must already be present.
    pub fn add_task(&mut self, task: Task) -> Result<(), WorkflowError> {
        if self.tasks.iter().any(|t| t.task_id == task.task_id) {
            return Err(WorkflowError::DuplicateTask(task.task_id));
        }
        for dep in &task.dependencies {
            if !self.tasks.iter().any(|t| &t.task_id == dep) {
                return Err(WorkflowError::MissingDependency {
                    task: task.task_id.clone(),
                    dep: dep.clone(),
                });
            }
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Tasks in topological order, rejecting cycles.
    pub fn topo_sorted(&self) -> Result<Vec<&Task>, WorkflowError> {
        let by_id: HashMap<&str, &Task> =
            self.tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();

        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut in_progress: BTreeSet<&str> = BTreeSet::new();
        let mut sorted: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a Task>,
            visited: &mut BTreeSet<&'a str>,
            in_progress: &mut BTreeSet<&'a str>,
            sorted: &mut Vec<&'a Task>,
        ) -> Result<(), WorkflowError> {
            if in_progress.contains(id) {
                return Err(WorkflowError::Cycle(id.to_string()));
            }
            if visited.contains(id) {
                return Ok(());
            }
            in_progress.insert(id);
            if let Some(task) = by_id.get(id) {
                for dep in &task.dependencies {
                    visit(dep.as_str(), by_id, visited, in_progress, sorted)?;
                }
                sorted.push(task);
            }
            in_progress.remove(id);
            visited.insert(id);
            Ok(())
        }

        for task in &self.tasks {
            visit(
                task.task_id.as_str(),
                &by_id,
                &mut visited,
                &mut in_progress,
                &mut sorted,
            )?;
        }
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_task_rejects_duplicates_and_missing_deps() {
        let mut wf = Workflow::new();
        wf.add_task(Task::new("echo a").with_id("a")).unwrap();

        let dup = wf.add_task(Task::new("echo a2").with_id("a"));
        assert!(matches!(dup, Err(WorkflowError::DuplicateTask(_))));

        let missing = wf.add_task(Task::new("echo b").with_id("b").with_dependency("ghost"));
        assert!(matches!(
            missing,
            Err(WorkflowError::MissingDependency { .. })
        ));
    }

    #[test]
    fn topo_sort_respects_dependencies() {
        let mut wf = Workflow::new();
        wf.add_task(Task::new("echo a").with_id("a")).unwrap();
        wf.add_task(Task::new("echo b").with_id("b").with_dependency("a"))
            .unwrap();
        wf.add_task(Task::new("echo c").with_id("c").with_dependency("b"))
            .unwrap();

        let order: Vec<&str> = wf
            .topo_sorted()
            .unwrap()
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_sort_detects_cycles() {
        // Build a cycle by constructing tasks directly, bypassing add_task
        // validation (which forbids forward references).
        let mut wf = Workflow::new();
        wf.tasks.push(Task::new("echo a").with_id("a").with_dependency("b"));
        wf.tasks.push(Task::new("echo b").with_id("b").with_dependency("a"));
        assert!(matches!(wf.topo_sorted(), Err(WorkflowError::Cycle(_))));
    }

    #[test]
    fn declaration_order_is_preserved() {
        let mut wf = Workflow::new();
        for id in ["z", "m", "a"] {
            wf.add_task(Task::new("true").with_id(id)).unwrap();
        }
        let ids: Vec<&str> = wf.tasks().iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "m", "a"]);
    }

    #[test]
    fn task_serde_round_trip() {
        let task = Task::new("python run.py")
            .with_id("sim_0001")
            .with_env("MATTERSTACK_OPERATOR", "hpc.default")
            .with_file("input.json", FileInput::Inline("{}".to_string()))
            .with_allow_failure(true);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, "sim_0001");
        assert!(back.allow_failure);
        assert_eq!(
            back.files.get("input.json"),
            Some(&FileInput::Inline("{}".to_string()))
        );
    }
}
