//! Per-attempt configuration snapshots.
//!
//! Each compute dispatch copies the run-level config files it depends on into
//! `<attempt>/config_snapshot/` and derives a combined hash over stable,
//! sorted lines of the per-file digests. The hash is invariant under
//! iteration order and identical for identical inputs, so provenance
//! comparisons across attempts are a string equality check.

use std::path::Path;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use matterstack_core::OperatorError;

/// Result of writing a snapshot: the combined hash plus the file metadata
/// persisted on the attempt row.
#[derive(Clone, Debug)]
pub struct ConfigSnapshot {
    pub config_hash: String,
    pub config_files: Value,
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn combined_hash(files: &[(String, String, usize)], missing: &[(String, String)]) -> String {
    let mut lines: Vec<String> = files
        .iter()
        .map(|(name, sha, size)| format!("FILE\t{name}\t{sha}\t{size}\n"))
        .collect();
    let mut missing_lines: Vec<String> = missing
        .iter()
        .map(|(name, source)| format!("MISSING\t{name}\t{source}\n"))
        .collect();
    lines.sort();
    missing_lines.sort();
    lines.extend(missing_lines);
    sha256_hex(lines.concat().as_bytes())
}

/// Copy run config, campaign state, and the attempt manifest into the
/// snapshot directory. Absent sources are recorded, not errors.
pub fn write_attempt_config_snapshot(
    run_root: &Path,
    attempt_dir: &Path,
) -> Result<ConfigSnapshot, OperatorError> {
    let snapshot_dir = attempt_dir.join("config_snapshot");
    std::fs::create_dir_all(&snapshot_dir)
        .map_err(|e| OperatorError::PathSafety(format!("create snapshot dir: {e}")))?;

    let expected = [
        ("config.json", run_root.join("config.json"), "run_root/config.json"),
        (
            "campaign_state.json",
            run_root.join("campaign_state.json"),
            "run_root/campaign_state.json",
        ),
        (
            "task_manifest.json",
            attempt_dir.join("manifest.json"),
            "attempt/manifest.json",
        ),
    ];

    let mut files: Vec<(String, String, usize)> = Vec::new();
    let mut missing: Vec<(String, String)> = Vec::new();

    for (name, source, label) in expected {
        match std::fs::read(&source) {
            Ok(data) => {
                std::fs::write(snapshot_dir.join(name), &data).map_err(|e| {
                    OperatorError::PathSafety(format!("write snapshot {name}: {e}"))
                })?;
                files.push((name.to_string(), sha256_hex(&data), data.len()));
            }
            Err(_) => missing.push((name.to_string(), label.to_string())),
        }
    }

    let config_hash = combined_hash(&files, &missing);
    let config_files = json!({
        "files": files
            .iter()
            .map(|(name, sha, size)| json!({"snapshot_path": name, "sha256": sha, "size_bytes": size}))
            .collect::<Vec<_>>(),
        "missing": missing
            .iter()
            .map(|(name, source)| json!({"snapshot_path": name, "source": source}))
            .collect::<Vec<_>>(),
        "combined_hash": config_hash,
    });

    let manifest_raw = serde_json::to_string_pretty(&config_files)
        .map_err(|e| OperatorError::ManifestValidation(format!("encode snapshot manifest: {e}")))?;
    std::fs::write(snapshot_dir.join("manifest.json"), manifest_raw + "\n")
        .map_err(|e| OperatorError::PathSafety(format!("write snapshot manifest: {e}")))?;

    Ok(ConfigSnapshot {
        config_hash,
        config_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_hash_is_deterministic() {
        let run = tempfile::tempdir().unwrap();
        std::fs::write(run.path().join("config.json"), "{}").unwrap();
        std::fs::write(run.path().join("campaign_state.json"), "{\"round\": 1}").unwrap();

        let attempt_a = run.path().join("tasks/t/attempts/a1");
        let attempt_b = run.path().join("tasks/t/attempts/a2");
        std::fs::create_dir_all(&attempt_a).unwrap();
        std::fs::create_dir_all(&attempt_b).unwrap();

        let a = write_attempt_config_snapshot(run.path(), &attempt_a).unwrap();
        let b = write_attempt_config_snapshot(run.path(), &attempt_b).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
        assert!(attempt_a.join("config_snapshot/config.json").is_file());
        assert!(attempt_a.join("config_snapshot/manifest.json").is_file());
    }

    #[test]
    fn hash_changes_with_content_and_records_missing() {
        let run = tempfile::tempdir().unwrap();
        let attempt = run.path().join("tasks/t/attempts/a1");
        std::fs::create_dir_all(&attempt).unwrap();

        let without_config = write_attempt_config_snapshot(run.path(), &attempt).unwrap();
        assert_eq!(
            without_config.config_files["missing"]
                .as_array()
                .unwrap()
                .len(),
            3
        );

        std::fs::write(run.path().join("config.json"), "{\"mode\": \"local\"}").unwrap();
        let with_config = write_attempt_config_snapshot(run.path(), &attempt).unwrap();
        assert_ne!(without_config.config_hash, with_config.config_hash);
    }
}
