//! C2: a process-exclusive, file-based lock per plan (spec ss4.2).
//!
//! The lock file contains the owning process's pid as decimal text.
//! Acquisition races are resolved by the filesystem's exclusive-create
//! semantics (`O_EXCL`); a lock referring to a dead pid is stale and may
//! be taken over. Liveness is probed with `kill(pid, 0)`, the same
//! building block used for graceful-then-forceful process termination in
//! `crate::invoker` -- a signal of zero checks for existence without
//! actually signalling anything.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    HeldBy(u32),
}

#[derive(Debug, Clone)]
pub struct PlanLock {
    dir: PathBuf,
}

impl PlanLock {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| OrchestratorError::StorageUnavailable(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.lock"))
    }

    /// Attempt to become the lock holder for `plan_id`.
    pub fn acquire(&self, plan_id: &str) -> Result<AcquireOutcome, OrchestratorError> {
        let path = self.path_for(plan_id);
        let pid = std::process::id();

        match create_exclusive(&path, pid) {
            Ok(()) => Ok(AcquireOutcome::Acquired),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_pid(&path)?;
                match holder {
                    Some(holder_pid) if is_alive(holder_pid) => {
                        Ok(AcquireOutcome::HeldBy(holder_pid))
                    }
                    _ => {
                        // Stale lock: holder is dead or unreadable. Take it
                        // over by overwriting with our own pid.
                        write_pid(&path, pid)?;
                        Ok(AcquireOutcome::Acquired)
                    }
                }
            }
            Err(e) => Err(OrchestratorError::StorageUnavailable(format!(
                "{}: {e}",
                path.display()
            ))),
        }
    }

    /// Release the lock for `plan_id`. Idempotent: releasing a lock we
    /// don't hold (or that doesn't exist) is a silent no-op.
    pub fn release(&self, plan_id: &str) -> Result<(), OrchestratorError> {
        let path = self.path_for(plan_id);
        match read_pid(&path)? {
            Some(pid) if pid == std::process::id() => {
                match std::fs::remove_file(&path) {
                    Ok(()) | Err(_) => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

fn create_exclusive(path: &Path, pid: u32) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    write!(file, "{pid}")?;
    Ok(())
}

fn write_pid(path: &Path, pid: u32) -> Result<(), OrchestratorError> {
    std::fs::write(path, pid.to_string())
        .map_err(|e| OrchestratorError::StorageUnavailable(format!("{}: {e}", path.display())))
}

fn read_pid(path: &Path) -> Result<Option<u32>, OrchestratorError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(OrchestratorError::StorageUnavailable(format!(
            "{}: {e}",
            path.display()
        ))),
    }
}

/// Liveness probe for a pid. On Unix, `kill(pid, 0)` sends no signal but
/// reports whether the process exists and is reachable. Platforms without
/// a direct probe should fall back to treating every lock as advisory
/// (always stale-reclaimable) -- this spec explicitly allows that, per
/// ss9's "advisory file lock" note.
#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checks; pid is read from our own lock file format.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    false
}
