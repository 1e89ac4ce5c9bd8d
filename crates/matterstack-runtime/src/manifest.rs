//! Attempt manifests and the file-exchange protocol.
//!
//! `manifest.json` is a lean, reference-only serialization of the task: file
//! inputs are recorded as `{path, bytes, sha256, source}` without embedding
//! contents. The exchange types cover the human/experiment protocol:
//! request `{procedure, parameters}`, response
//! `{"status": "success", "data": {...}}` or
//! `{"status": "failed", "reason": "..."}`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use matterstack_core::workflow::FileInput;
use matterstack_core::{OperatorError, Task};

pub const TASK_MANIFEST_SCHEMA_VERSION: u32 = 2;

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn file_reference(dest: &str, input: &FileInput) -> Value {
    match input {
        FileInput::Inline(content) => {
            let bytes = content.as_bytes();
            json!({
                "path": dest,
                "bytes": bytes.len(),
                "sha256": sha256_hex(bytes),
                "source": "inline",
            })
        }
        FileInput::LocalPath(source) => {
            let size = std::fs::metadata(source).map(|m| m.len()).ok();
            json!({
                "path": dest,
                "bytes": size,
                "source": "local_path",
                "source_path": source,
            })
        }
    }
}

/// Serialize a task to its persistence manifest value.
pub fn task_manifest_value(task: &Task) -> Result<Value, OperatorError> {
    let mut payload = serde_json::to_value(task)
        .map_err(|e| OperatorError::ManifestValidation(format!("encode task: {e}")))?;
    let files: Value = task
        .files
        .iter()
        .map(|(dest, input)| (dest.clone(), file_reference(dest, input)))
        .collect::<serde_json::Map<_, _>>()
        .into();
    payload["files"] = files;
    payload["schema_version"] = json!(TASK_MANIFEST_SCHEMA_VERSION);
    Ok(payload)
}

/// Write `manifest.json` for a task into the attempt workspace.
pub fn write_task_manifest(path: &Path, task: &Task) -> Result<(), OperatorError> {
    let payload = task_manifest_value(task)?;
    let raw = serde_json::to_string_pretty(&payload)
        .map_err(|e| OperatorError::ManifestValidation(format!("encode manifest: {e}")))?;
    std::fs::write(path, raw + "\n")
        .map_err(|e| OperatorError::PathSafety(format!("write {}: {e}", path.display())))
}

/// Outcome reported by the external party.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeStatus {
    Success,
    Failed,
}

/// Request written for the external party to act on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub procedure: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Response file provided by the external party.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeResponse {
    pub status: ExchangeStatus,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ExchangeResponse {
    /// Parse a response file; malformed content is a manifest-validation
    /// failure carrying the parse error.
    pub fn read(path: &Path) -> Result<Self, OperatorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OperatorError::Transient(format!("read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            OperatorError::ManifestValidation(format!(
                "invalid response at {}: {e}",
                path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matterstack_core::Task;

    #[test]
    fn manifest_replaces_file_contents_with_references() {
        let task = Task::new("python sim.py")
            .with_id("sim")
            .with_file("input.json", FileInput::Inline("{\"t\": 300}".into()));
        let manifest = task_manifest_value(&task).unwrap();
        assert_eq!(manifest["schema_version"], 2);
        let entry = &manifest["files"]["input.json"];
        assert_eq!(entry["source"], "inline");
        assert_eq!(entry["bytes"], 10);
        assert!(entry["sha256"].as_str().unwrap().len() == 64);
        assert!(entry.get("content").is_none());
    }

    #[test]
    fn response_parses_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("response.json");

        std::fs::write(&path, r#"{"status": "success", "data": {"ph": 7.2}}"#).unwrap();
        let ok = ExchangeResponse::read(&path).unwrap();
        assert_eq!(ok.status, ExchangeStatus::Success);
        assert_eq!(ok.data.unwrap()["ph"], 7.2);

        std::fs::write(&path, r#"{"status": "failed", "reason": "sample contaminated"}"#)
            .unwrap();
        let failed = ExchangeResponse::read(&path).unwrap();
        assert_eq!(failed.status, ExchangeStatus::Failed);
        assert_eq!(failed.reason.as_deref(), Some("sample contaminated"));
    }

    #[test]
    fn malformed_response_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("response.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = ExchangeResponse::read(&path).unwrap_err();
        assert!(matches!(err, OperatorError::ManifestValidation(_)));

        std::fs::write(&path, r#"{"status": "done"}"#).unwrap();
        assert!(ExchangeResponse::read(&path).is_err());
    }
}
