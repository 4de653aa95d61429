//! Spawning of node processes, each in its own process group.
//!
//! The OS process is started from a dedicated task which registers it and
//! hands the pid back over a oneshot channel. The same task then waits on the
//! child. A node leaves the registry on its own only once its whole process
//! group is gone; a leader that exits while children remain stays tracked so
//! teardown still signals the group.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::identity::SigningIdentity;
use crate::reaper::ParentPidRecord;
use crate::teardown::{kill_process_group, process_group_alive};

pub const LOGGING_ENV: &str = "LOGGING";
pub const ENGINE_SIGNER_ENV: &str = "ENGINE_SIGNER";
pub const ENGINE_SIGNER_KEY_JSON_ENV: &str = "ENGINE_SIGNER_KEY_JSON";
pub const ENGINE_SIGNER_PRIVATE_KEY_ENV: &str = "ENGINE_SIGNER_PRIVATE_KEY";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RpcEndpoint {
    host: String,
    port: u16,
}

impl RpcEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedProcess {
    pub ordinal: usize,
    pub pid: u32,
    pub pgid: i32,
    pub endpoint: RpcEndpoint,
}

/// Processes that are currently running. Appended to by launch tasks and
/// iterated by teardown, possibly from different threads.
#[derive(Clone, Debug, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<Vec<ManagedProcess>>>,
}

impl ProcessRegistry {
    pub fn register(&self, process: ManagedProcess) {
        self.inner.lock().push(process);
    }

    pub fn deregister(&self, pid: u32) -> Option<ManagedProcess> {
        let mut guard = self.inner.lock();
        let index = guard.iter().position(|process| process.pid == pid)?;
        Some(guard.remove(index))
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<ManagedProcess> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn snapshot(&self) -> Vec<ManagedProcess> {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// A node whose OS process has been assigned a pid.
#[derive(Debug)]
pub struct LaunchedNode {
    process: ManagedProcess,
    exit: watch::Receiver<Option<String>>,
}

impl LaunchedNode {
    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    pub fn pid(&self) -> u32 {
        self.process.pid
    }

    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.process.endpoint
    }

    /// Description of how the process exited, once it has.
    pub fn exit_status(&self) -> Option<String> {
        self.exit.borrow().clone()
    }

    /// True while any member of the node's process group is still running.
    pub fn group_alive(&self) -> bool {
        process_group_alive(self.process.pgid)
    }

    /// The leader's exit status, but only once nothing in its process group
    /// is left running.
    pub fn group_exit_status(&self) -> Option<String> {
        self.exit_status().filter(|_| !self.group_alive())
    }

    pub async fn wait_for_exit(&mut self) -> Option<String> {
        loop {
            if let Some(status) = self.exit.borrow_and_update().clone() {
                return Some(status);
            }
            if self.exit.changed().await.is_err() {
                return self.exit.borrow().clone();
            }
        }
    }
}

pub struct NodeLauncher {
    config: NodeConfig,
    record: ParentPidRecord,
    registry: ProcessRegistry,
    log_dir: Option<PathBuf>,
    next_port: Option<u16>,
    launched: usize,
    record_written: bool,
}

impl NodeLauncher {
    pub fn new(config: NodeConfig, record: ParentPidRecord, registry: ProcessRegistry) -> Self {
        let next_port = Some(config.rpc_base_port);
        Self {
            config,
            record,
            registry,
            log_dir: None,
            next_port,
            launched: 0,
            record_written: false,
        }
    }

    /// Node stdout and stderr are appended to `<dir>/node-<ordinal>.log`
    /// instead of being discarded.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn launched(&self) -> usize {
        self.launched
    }

    /// The endpoint the next launch will be assigned.
    pub fn next_endpoint(&self) -> Option<RpcEndpoint> {
        self.next_port.map(|port| RpcEndpoint::new(self.config.rpc_host.clone(), port))
    }

    fn reserve_endpoint(&mut self) -> HarnessResult<RpcEndpoint> {
        let port = self
            .next_port
            .ok_or_else(|| HarnessError::LaunchFailure("rpc port range exhausted".into()))?;
        self.next_port = port.checked_add(1);
        Ok(RpcEndpoint::new(self.config.rpc_host.clone(), port))
    }

    fn build_command(
        &self,
        ordinal: usize,
        identity: Option<&SigningIdentity>,
    ) -> HarnessResult<Command> {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.args);
        command.env(LOGGING_ENV, &self.config.logging);
        if let Some(identity) = identity {
            command.env(ENGINE_SIGNER_ENV, identity.address().to_checksum());
            command.env(ENGINE_SIGNER_KEY_JSON_ENV, identity.keystore_json());
            command.env(ENGINE_SIGNER_PRIVATE_KEY_ENV, identity.private_key_hex().as_str());
        }
        command.envs(&self.config.env);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());

        match &self.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|err| HarnessError::io(dir, err))?;
                let path = dir.join(format!("node-{ordinal}.log"));
                let stdout = File::create(&path).map_err(|err| HarnessError::io(&path, err))?;
                let stderr = stdout.try_clone().map_err(|err| HarnessError::io(&path, err))?;
                command.stdout(Stdio::from(stdout));
                command.stderr(Stdio::from(stderr));
            }
            None => {
                command.stdout(Stdio::null());
                command.stderr(Stdio::null());
            }
        }

        #[cfg(unix)]
        command.process_group(0);
        command.kill_on_drop(false);
        Ok(command)
    }

    /// Starts one node. Returns once the OS has assigned it a pid; readiness
    /// is the caller's concern.
    pub async fn launch(&mut self, identity: Option<&SigningIdentity>) -> HarnessResult<LaunchedNode> {
        let ordinal = self.launched;
        self.launched += 1;
        // The first node of the run that actually starts owns the record,
        // even if earlier attempts failed to spawn.
        let owns_record = !self.record_written;
        let endpoint = self.reserve_endpoint()?;
        let mut command = self.build_command(ordinal, identity)?;

        let (pid_tx, pid_rx) = oneshot::channel::<HarnessResult<u32>>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let registry = self.registry.clone();
        let record = self.record.clone();
        let program = self.config.program.clone();
        let task_endpoint = endpoint.clone();

        info!(
            target: "aura::launcher",
            ordinal,
            port = endpoint.port(),
            program = %program,
            "attempting to run node"
        );

        tokio::spawn(async move {
            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(err) => {
                    warn!(target: "aura::launcher", ordinal, error = %err, "failed to run node");
                    let _ = pid_tx.send(Err(HarnessError::LaunchFailure(format!(
                        "spawn {program}: {err}"
                    ))));
                    let _ = exit_tx.send(Some(format!("spawn failed: {err}")));
                    return;
                }
            };

            let Some(pid) = child.id() else {
                let _ = pid_tx.send(Err(HarnessError::LaunchFailure(
                    "node exited before reporting a pid".into(),
                )));
                let _ = exit_tx.send(Some("exited before reporting a pid".into()));
                return;
            };
            let pgid = i32::try_from(pid).unwrap_or(i32::MAX);

            if owns_record {
                if let Err(err) = record.write(pid) {
                    warn!(target: "aura::launcher", pid, error = %err, "failed to persist parent pid");
                    let _ = kill_process_group(pgid);
                    let _ = child.wait().await;
                    let _ = pid_tx.send(Err(err));
                    let _ = exit_tx.send(Some("killed: parent pid not persisted".into()));
                    return;
                }
            }

            registry.register(ManagedProcess {
                ordinal,
                pid,
                pgid,
                endpoint: task_endpoint,
            });
            let _ = pid_tx.send(Ok(pid));

            let (clean, outcome) = match child.wait().await {
                Ok(status) if status.success() => {
                    info!(target: "aura::launcher", pid, "node exited cleanly");
                    (true, status.to_string())
                }
                Ok(status) => {
                    warn!(target: "aura::launcher", pid, status = %status, "node exited");
                    (false, status.to_string())
                }
                Err(err) => {
                    warn!(target: "aura::launcher", pid, error = %err, "failed to await node");
                    (false, format!("wait failed: {err}"))
                }
            };

            if process_group_alive(pgid) {
                info!(
                    target: "aura::launcher",
                    pid,
                    pgid,
                    "node leader exited but its process group is still running; keeping it tracked"
                );
            } else {
                registry.deregister(pid);
                if owns_record && clean {
                    if let Err(err) = record.remove() {
                        warn!(target: "aura::launcher", pid, error = %err, "failed to remove parent pid record");
                    }
                }
            }
            let _ = exit_tx.send(Some(outcome));
        });

        let pid = pid_rx.await.map_err(|_| {
            HarnessError::LaunchFailure("launch task ended without reporting a pid".into())
        })??;
        if owns_record {
            self.record_written = true;
        }

        info!(
            target: "aura::launcher",
            ordinal,
            pid,
            port = endpoint.port(),
            "running node with JSON-RPC endpoint"
        );

        Ok(LaunchedNode {
            process: ManagedProcess {
                ordinal,
                pid,
                pgid: i32::try_from(pid).unwrap_or(i32::MAX),
                endpoint,
            },
            exit: exit_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper_config(port: u16) -> NodeConfig {
        NodeConfig {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            rpc_base_port: port,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn endpoint_formats_as_http_url() {
        let endpoint = RpcEndpoint::new("localhost", 8050);
        assert_eq!(endpoint.to_string(), "http://localhost:8050");
    }

    #[test]
    fn registry_deregisters_by_pid() {
        let registry = ProcessRegistry::default();
        for (ordinal, pid) in [(0, 10), (1, 11)] {
            registry.register(ManagedProcess {
                ordinal,
                pid,
                pgid: pid as i32,
                endpoint: RpcEndpoint::new("localhost", 8050 + ordinal as u16),
            });
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.deregister(10).map(|p| p.ordinal), Some(0));
        assert!(registry.deregister(10).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn spawn_failure_reports_launch_failure_and_consumes_port() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = NodeConfig {
            program: dir.path().join("missing-node").display().to_string(),
            args: Vec::new(),
            ..NodeConfig::default()
        };
        let record = ParentPidRecord::new(dir.path().join(".pid"));
        let mut launcher = NodeLauncher::new(config, record.clone(), ProcessRegistry::default());

        let err = launcher.launch(None).await.expect_err("spawn must fail");
        assert!(matches!(err, HarnessError::LaunchFailure(_)));
        assert!(!record.exists());
        assert!(launcher.registry().is_empty());
        assert_eq!(launcher.next_endpoint().map(|e| e.port()), Some(8051));
    }

    #[tokio::test]
    async fn clean_exit_removes_parent_record_and_registry_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = NodeConfig {
            program: "true".to_string(),
            args: Vec::new(),
            ..sleeper_config(18_050)
        };
        let record = ParentPidRecord::new(dir.path().join(".pid"));
        let registry = ProcessRegistry::default();
        let mut launcher = NodeLauncher::new(config, record.clone(), registry.clone());

        let mut node = launcher.launch(None).await.expect("launch");
        let status = node.wait_for_exit().await.expect("exit observed");
        assert!(status.contains('0'), "unexpected status {status}");
        assert!(!record.exists());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn signer_environment_reaches_node() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("env.txt");
        let config = NodeConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!(
                    "printf '%s\\n%s\\n%s\\n' \"$LOGGING\" \"$ENGINE_SIGNER\" \"$ENGINE_SIGNER_PRIVATE_KEY\" > {}",
                    out.display()
                ),
            ],
            logging: "trace".to_string(),
            ..NodeConfig::default()
        };
        let identity = SigningIdentity::generate().expect("identity");
        let mut launcher = NodeLauncher::new(
            config,
            ParentPidRecord::new(dir.path().join(".pid")),
            ProcessRegistry::default(),
        );

        let mut node = launcher.launch(Some(&identity)).await.expect("launch");
        node.wait_for_exit().await;

        let written = std::fs::read_to_string(&out).expect("env dump");
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "trace");
        assert_eq!(lines[1], identity.address().to_checksum());
        assert_eq!(lines[2], identity.private_key_hex().as_str());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn first_started_node_owns_record_after_failed_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = dir.path().join("node-shell");
        let config = NodeConfig {
            program: program.display().to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            ..NodeConfig::default()
        };
        let record = ParentPidRecord::new(dir.path().join(".pid"));
        let registry = ProcessRegistry::default();
        let mut launcher = NodeLauncher::new(config, record.clone(), registry.clone());

        let err = launcher.launch(None).await.expect_err("program not there yet");
        assert!(matches!(err, HarnessError::LaunchFailure(_)));
        assert!(!record.exists());

        std::os::unix::fs::symlink("/bin/sh", &program).expect("link shell");
        let mut node = launcher.launch(None).await.expect("second attempt starts");
        assert_eq!(node.process().ordinal, 1);
        assert_eq!(record.read().expect("read record"), Some(node.pid() as i32));

        let mut third = launcher.launch(None).await.expect("third node");
        assert_eq!(record.read().expect("read record"), Some(node.pid() as i32));

        assert_eq!(crate::teardown::teardown(&registry), 2);
        node.wait_for_exit().await;
        third.wait_for_exit().await;
    }
}
