//! Chronologically sortable identifiers.
//!
//! All ids share the format `YYYYMMDD_HHMMSS_<8 hex>`: sortable by plain
//! string ordering, human-readable, and unique under clock skew thanks to the
//! random suffix.

use chrono::Utc;
use uuid::Uuid;

/// Generate a chronological id, optionally prefixed (`prefix_20231225_...`).
pub fn generate_chronological_id(prefix: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    if prefix.is_empty() {
        format!("{timestamp}_{suffix}")
    } else {
        format!("{prefix}_{timestamp}_{suffix}")
    }
}

/// Generate a run id.
pub fn generate_run_id() -> String {
    generate_chronological_id("")
}

/// Generate an attempt id.
pub fn generate_attempt_id() -> String {
    generate_chronological_id("")
}

/// Generate a task id, optionally prefixed with a sanitized human hint
/// (lowercased, non-alphanumerics collapsed to underscores, 20 chars max).
pub fn generate_task_id(hint: &str) -> String {
    let safe: String = hint
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(20)
        .collect();
    let mut collapsed = String::with_capacity(safe.len());
    for c in safe.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }
    let trimmed = collapsed.trim_matches('_');
    generate_chronological_id(trimmed)
}
