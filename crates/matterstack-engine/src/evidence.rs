//! Evidence bundles: an immutable, re-buildable export of everything that
//! happened in a run.
//!
//! Bundles are assembled solely from the state store and the run directory;
//! nothing is ever read back from a previously exported bundle, so rebuilds
//! are idempotent.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use matterstack_core::{EngineError, RunHandle, RunStatus, TaskStatus};
use matterstack_store::{AttemptRecord, StateStore};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptEvidence {
    pub attempt_id: String,
    pub attempt_index: u32,
    pub status: String,
    pub status_reason: Option<String>,
    pub operator_key: Option<String>,
    pub external_id: Option<String>,
    pub config_hash: Option<String>,
    pub evidence_path: Option<String>,
    pub workdir_remote: Option<String>,
    pub artifact_missing: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub operator_data: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEvidence {
    pub command: String,
    pub status: String,
    pub operator_key: Option<String>,
    pub attempts: Vec<AttemptEvidence>,
    pub current_attempt_id: Option<String>,
}

/// Wiring provenance carried in the bundle.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WiringEvidence {
    pub snapshot_path: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub run_id: String,
    pub workspace_slug: String,
    pub run_status: String,
    pub status_reason: Option<String>,
    pub is_complete: bool,
    /// Volatile: stamped at build time, excluded from equivalence checks.
    pub generated_at: DateTime<Utc>,
    pub task_counts: BTreeMap<String, usize>,
    pub tasks: BTreeMap<String, TaskEvidence>,
    pub wiring: WiringEvidence,
    pub tags: Value,
}

fn attempt_evidence(run: &RunHandle, attempt: &AttemptRecord) -> AttemptEvidence {
    let artifact_missing = attempt
        .evidence_path
        .as_ref()
        .map(|rel| !run.root_path.join(rel).exists())
        .unwrap_or(false);
    AttemptEvidence {
        attempt_id: attempt.attempt_id.clone(),
        attempt_index: attempt.attempt_index,
        status: attempt.status.as_str().to_string(),
        status_reason: attempt.status_reason.clone(),
        operator_key: attempt.operator_key.clone(),
        external_id: attempt.external_id.clone(),
        config_hash: attempt.config_hash.clone(),
        evidence_path: attempt.evidence_path.clone(),
        workdir_remote: attempt.workdir_remote.clone(),
        artifact_missing,
        created_at: attempt.created_at,
        submitted_at: attempt.submitted_at,
        ended_at: attempt.ended_at,
        operator_data: attempt.operator_data.clone(),
    }
}

fn sha256_file(path: &Path) -> Option<String> {
    use sha2::{Digest, Sha256};
    let data = std::fs::read(path).ok()?;
    Some(
        Sha256::digest(&data)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect(),
    )
}

/// Assemble a bundle from the state store and run directory.
pub fn build_bundle(run: &RunHandle) -> Result<EvidenceBundle, EngineError> {
    let store = StateStore::open(run.db_path()).map_err(EngineError::from)?;
    let record = store
        .get_run(&run.run_id)?
        .ok_or_else(|| EngineError::RunNotFound(run.run_id.clone()))?;

    let mut tasks = BTreeMap::new();
    let (mut total, mut completed, mut failed, mut cancelled) = (0usize, 0usize, 0usize, 0usize);

    for row in store.get_tasks(&run.run_id)? {
        total += 1;
        match row.status {
            TaskStatus::Completed => completed += 1,
            TaskStatus::Failed => failed += 1,
            TaskStatus::Cancelled => cancelled += 1,
            _ => {}
        }
        let attempts: Vec<AttemptEvidence> = store
            .list_attempts(&row.task.task_id)?
            .iter()
            .map(|a| attempt_evidence(run, a))
            .collect();
        tasks.insert(
            row.task.task_id.clone(),
            TaskEvidence {
                command: row.task.command.clone(),
                status: row.status.as_str().to_string(),
                operator_key: row.task.operator_key.clone(),
                attempts,
                current_attempt_id: row.current_attempt_id.clone(),
            },
        );
    }

    let snapshot_yaml = run.snapshot_dir().join("operators.yaml");
    let wiring = if snapshot_yaml.is_file() {
        WiringEvidence {
            snapshot_path: Some("operators_snapshot/operators.yaml".to_string()),
            sha256: sha256_file(&snapshot_yaml),
        }
    } else {
        WiringEvidence::default()
    };

    let task_counts: BTreeMap<String, usize> = [
        ("total".to_string(), total),
        ("completed".to_string(), completed),
        ("failed".to_string(), failed),
        ("cancelled".to_string(), cancelled),
    ]
    .into_iter()
    .collect();

    Ok(EvidenceBundle {
        run_id: record.run_id,
        workspace_slug: record.workspace_slug,
        run_status: record.status.as_str().to_string(),
        status_reason: record.status_reason,
        is_complete: record.status == RunStatus::Completed,
        generated_at: Utc::now(),
        task_counts,
        tasks,
        wiring,
        tags: record.tags,
    })
}

/// Write the bundle under `<run_root>/evidence/`: `bundle.json`, a markdown
/// report, and a copy of the wiring snapshot. Overwrites any prior export.
pub fn export_bundle(bundle: &EvidenceBundle, run: &RunHandle) -> Result<(), EngineError> {
    let evidence_dir = run.evidence_dir();
    std::fs::create_dir_all(&evidence_dir)?;

    let json = serde_json::to_string_pretty(bundle)
        .map_err(|e| EngineError::Storage(format!("encode bundle: {e}")))?;
    std::fs::write(evidence_dir.join("bundle.json"), json + "\n")?;
    std::fs::write(evidence_dir.join("report.md"), render_report(bundle))?;

    let snapshot_dir = run.snapshot_dir();
    if snapshot_dir.is_dir() {
        let dest = evidence_dir.join("operators_snapshot");
        std::fs::create_dir_all(&dest)?;
        for entry in std::fs::read_dir(&snapshot_dir)?.flatten() {
            if entry.path().is_file() {
                std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
            }
        }
    }
    info!(run_id = %bundle.run_id, dir = %evidence_dir.display(), "evidence bundle exported");
    Ok(())
}

fn render_report(bundle: &EvidenceBundle) -> String {
    let mut lines = Vec::new();
    lines.push(format!("# Evidence report: run {}", bundle.run_id));
    lines.push(format!("**Workspace:** {}", bundle.workspace_slug));
    lines.push(format!("**Status:** {}", bundle.run_status));
    if let Some(reason) = &bundle.status_reason {
        lines.push(format!("**Reason:** {reason}"));
    }
    let get = |k: &str| bundle.task_counts.get(k).copied().unwrap_or(0);
    lines.push(format!(
        "**Progress:** {}/{} tasks completed ({} failed, {} cancelled)",
        get("completed"),
        get("total"),
        get("failed"),
        get("cancelled"),
    ));
    if let Some(sha) = &bundle.wiring.sha256 {
        lines.push(format!("**Wiring:** sha256 {sha}"));
    }
    lines.push(String::new());
    lines.push("## Tasks".to_string());
    lines.push("| Task | Status | Operator | Attempts |".to_string());
    lines.push("|---|---|---|---|".to_string());
    for (task_id, task) in &bundle.tasks {
        let operator = task
            .attempts
            .last()
            .and_then(|a| a.operator_key.clone())
            .or_else(|| task.operator_key.clone())
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "| {task_id} | {} | {operator} | {} |",
            task.status,
            task.attempts.len()
        ));
    }
    lines.push(String::new());
    lines.push("## Attempts".to_string());
    for (task_id, task) in &bundle.tasks {
        for attempt in &task.attempts {
            lines.push(format!(
                "- `{task_id}` #{}: {} ({})",
                attempt.attempt_index,
                attempt.status,
                attempt
                    .evidence_path
                    .as_deref()
                    .unwrap_or("no evidence path"),
            ));
        }
    }
    lines.join("\n") + "\n"
}
