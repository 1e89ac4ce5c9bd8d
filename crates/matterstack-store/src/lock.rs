//! Advisory run lock.
//!
//! OS-level exclusive flock on `run.lock`, acquired non-blocking. The file
//! records the holder's pid so contention errors can name the other process.
//! The lock releases when the handle drops; the file itself is left in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::store::StoreError;

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to acquire the exclusive lock without blocking.
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::Io(format!("open {}: {e}", path.display())))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "run lock acquired");
                file.set_len(0).map_err(|e| StoreError::Io(e.to_string()))?;
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                writeln!(file, "pid {}", std::process::id())
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                file.flush().map_err(|e| StoreError::Io(e.to_string()))?;
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(_) => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim();
                Err(StoreError::LockHeld {
                    holder: if holder.is_empty() {
                        None
                    } else {
                        Some(holder.to_string())
                    },
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "run lock released");
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquisition_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");

        let first = RunLock::acquire(&path).unwrap();
        let second = RunLock::acquire(&path);
        match second {
            Err(StoreError::LockHeld { holder }) => {
                let holder = holder.expect("holder recorded");
                assert!(holder.starts_with("pid "));
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }

        drop(first);
        RunLock::acquire(&path).expect("reacquire after release");
    }
}
