//! Recovery from a previous run that died without tearing its node down.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::teardown::kill_process_group;

/// The persisted pid of the first node launched in a run. Its presence means
/// a previous run's node may still be alive.
#[derive(Clone, Debug)]
pub struct ParentPidRecord {
    path: PathBuf,
}

impl ParentPidRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn write(&self, pid: u32) -> HarnessResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| HarnessError::io(parent, err))?;
            }
        }
        fs::write(&self.path, pid.to_string()).map_err(|err| HarnessError::io(&self.path, err))
    }

    /// Reads the recorded pid. Unparsable or non-positive contents yield
    /// `Ok(None)` just like a missing file.
    pub fn read(&self) -> HarnessResult<Option<i32>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(HarnessError::io(&self.path, err)),
        };
        match contents.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(
                    target: "aura::reaper",
                    path = %self.path.display(),
                    contents = %contents.trim(),
                    "ignoring malformed parent pid record"
                );
                Ok(None)
            }
        }
    }

    pub fn remove(&self) -> HarnessResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HarnessError::io(&self.path, err)),
        }
    }
}

/// Kills the process group named by the record, if any, then deletes the
/// record. Returns the pid that was signalled.
pub fn reap(record: &ParentPidRecord) -> HarnessResult<Option<i32>> {
    if !record.exists() {
        debug!(target: "aura::reaper", path = %record.path().display(), "no orphaned node recorded");
        return Ok(None);
    }

    let reaped = match record.read() {
        Ok(Some(pid)) => {
            info!(target: "aura::reaper", pid, "attempting to kill orphaned node");
            if let Err(err) = kill_process_group(pid) {
                debug!(target: "aura::reaper", pid, error = %err, "orphaned node group already gone");
            }
            Some(pid)
        }
        Ok(None) => None,
        Err(err) => {
            warn!(target: "aura::reaper", error = %err, "unable to read parent pid record");
            None
        }
    };

    record.remove()?;
    Ok(reaped)
}
