use std::io;

use tracing::{debug, info};

use crate::launcher::ProcessRegistry;

/// Sends SIGKILL to every process in the group led by `pgid`.
#[cfg(unix)]
pub fn kill_process_group(pgid: i32) -> io::Result<()> {
    if pgid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }
    let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether any process in group `pgid` still exists, probed with signal 0.
#[cfg(unix)]
pub fn process_group_alive(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    if unsafe { libc::kill(-pgid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
pub fn process_group_alive(_pgid: i32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn kill_process_group(pgid: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("process groups are not supported on this platform (group {pgid})"),
    ))
}

/// Kills every registered process group and empties the registry. Signal
/// failures are ignored, so calling this repeatedly or with an empty registry
/// is harmless. Returns the number of groups signalled.
pub fn teardown(registry: &ProcessRegistry) -> usize {
    let processes = registry.drain();
    for process in &processes {
        info!(
            target: "aura::teardown",
            pid = process.pid,
            ordinal = process.ordinal,
            "killing node process group"
        );
        if let Err(err) = kill_process_group(process.pgid) {
            debug!(
                target: "aura::teardown",
                pid = process.pid,
                error = %err,
                "node process group already gone"
            );
        }
    }
    processes.len()
}

/// Tears the registry down when dropped, including while a panic unwinds.
#[must_use = "the guard tears nodes down when it is dropped"]
pub struct TeardownGuard {
    registry: ProcessRegistry,
}

impl TeardownGuard {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self { registry }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let killed = teardown(&self.registry);
        if killed > 0 {
            debug!(target: "aura::teardown", killed, "teardown guard released");
        }
    }
}
