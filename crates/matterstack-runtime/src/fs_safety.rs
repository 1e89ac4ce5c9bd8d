//! Run-root containment checks for operator filesystem writes.

use std::path::{Component, Path, PathBuf};

use matterstack_core::OperatorError;

/// Lexically normalize a path: drop `.`, resolve `..` against preceding
/// components, and reject traversal past the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Ensure `target` is contained in `run_root`, returning the normalized
/// absolute path. Relative targets are resolved against the run root.
pub fn ensure_under_run_root(run_root: &Path, target: &Path) -> Result<PathBuf, OperatorError> {
    let absolute = if target.is_absolute() {
        target.to_path_buf()
    } else {
        run_root.join(target)
    };
    let root = normalize(run_root).ok_or_else(|| {
        OperatorError::PathSafety(format!("run root {} is not normalizable", run_root.display()))
    })?;
    let resolved = normalize(&absolute).ok_or_else(|| {
        OperatorError::PathSafety(format!(
            "path {} escapes run root {}",
            target.display(),
            run_root.display()
        ))
    })?;
    if !resolved.starts_with(&root) {
        return Err(OperatorError::PathSafety(format!(
            "path {} escapes run root {}",
            target.display(),
            run_root.display()
        )));
    }
    Ok(resolved)
}
