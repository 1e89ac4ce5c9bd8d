//! Canonical operator keys.
//!
//! An operator key is `"<kind>.<name>"`: kind matches `[a-z][a-z0-9_]*`,
//! name matches `[a-z0-9][a-z0-9_.-]*`, split on the first dot. Legacy
//! single-word operator types ("HPC", "Local", ...) map onto `<kind>.default`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperatorKeyError {
    #[error("operator key is empty")]
    Empty,
    #[error("operator key must not contain whitespace: {0:?}")]
    Whitespace(String),
    #[error("operator key must not contain '..': {0:?}")]
    DoubleDot(String),
    #[error("operator key must match kind.name with allowed characters; got {0:?}")]
    Malformed(String),
}

fn is_valid_kind(kind: &str) -> bool {
    let mut chars = kind.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.' || c == '-')
}

/// Normalize and validate a canonical operator key.
///
/// Trims and lowercases, then enforces the canonical shape. Internal
/// whitespace and `..` are rejected rather than repaired.
pub fn normalize_operator_key(value: &str) -> Result<String, OperatorKeyError> {
    let raw = value.trim().to_lowercase();
    if raw.is_empty() {
        return Err(OperatorKeyError::Empty);
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(OperatorKeyError::Whitespace(value.to_string()));
    }
    if raw.contains("..") {
        return Err(OperatorKeyError::DoubleDot(value.to_string()));
    }
    let (kind, name) = raw
        .split_once('.')
        .ok_or_else(|| OperatorKeyError::Malformed(value.to_string()))?;
    if !is_valid_kind(kind) || !is_valid_name(name) {
        return Err(OperatorKeyError::Malformed(value.to_string()));
    }
    Ok(raw)
}

/// Split a canonical key into `(kind, name)` on the first dot.
pub fn split_operator_key(key: &str) -> Result<(String, String), OperatorKeyError> {
    let normalized = normalize_operator_key(key)?;
    let (kind, name) = normalized
        .split_once('.')
        .ok_or_else(|| OperatorKeyError::Malformed(key.to_string()))?;
    Ok((kind.to_string(), name.to_string()))
}

/// Map a legacy operator type ("HPC", "Local", "Human", "Experiment") to its
/// canonical key. Already-canonical values are normalized and returned.
pub fn legacy_operator_type_to_key(operator_type: &str) -> Option<String> {
    let raw = operator_type.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(key) = normalize_operator_key(raw) {
        return Some(key);
    }
    match raw.to_lowercase().as_str() {
        "hpc" => Some("hpc.default".to_string()),
        "local" => Some("local.default".to_string()),
        "human" => Some("human.default".to_string()),
        "experiment" => Some("experiment.default".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_keys() {
        assert_eq!(normalize_operator_key("hpc.default").unwrap(), "hpc.default");
        assert_eq!(
            normalize_operator_key("  HPC.Default ").unwrap(),
            "hpc.default"
        );
        assert_eq!(
            normalize_operator_key("local.cluster-a.dev").unwrap(),
            "local.cluster-a.dev"
        );
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            normalize_operator_key(""),
            Err(OperatorKeyError::Empty)
        ));
        assert!(matches!(
            normalize_operator_key("hpc default.x"),
            Err(OperatorKeyError::Whitespace(_))
        ));
        assert!(matches!(
            normalize_operator_key("hpc..default"),
            Err(OperatorKeyError::DoubleDot(_))
        ));
        assert!(normalize_operator_key("nodot").is_err());
        assert!(normalize_operator_key("1hpc.default").is_err());
        assert!(normalize_operator_key("hpc.").is_err());
        assert!(normalize_operator_key(".default").is_err());
    }

    #[test]
    fn splits_on_first_dot() {
        let (kind, name) = split_operator_key("hpc.cluster.dev").unwrap();
        assert_eq!(kind, "hpc");
        assert_eq!(name, "cluster.dev");
    }

    #[test]
    fn maps_legacy_types() {
        assert_eq!(
            legacy_operator_type_to_key("HPC").as_deref(),
            Some("hpc.default")
        );
        assert_eq!(
            legacy_operator_type_to_key("Human").as_deref(),
            Some("human.default")
        );
        assert_eq!(
            legacy_operator_type_to_key("hpc.atesting").as_deref(),
            Some("hpc.atesting")
        );
        assert_eq!(legacy_operator_type_to_key("Robot"), None);
        assert_eq!(legacy_operator_type_to_key(""), None);
    }
}
