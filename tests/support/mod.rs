//! Stub collaborators and configuration helpers shared by the integration
//! tests. Nodes are plain `sleep` processes so no chain binary is needed.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aura_harness::builder::{BuildRequest, BuiltGenesis, GenesisBuilder};
use aura_harness::config::HarnessConfig;
use aura_harness::launcher::{LaunchedNode, RpcEndpoint};
use aura_harness::readiness::LivenessProbe;
use aura_harness::{HarnessError, HarnessResult, Orchestrator};
use serde_json::{json, Map, Value};
use tokio::time::timeout;

pub const OS_REF: &str = "osA";
pub const CONSENSUS_REF: &str = "consA";
pub const CHAIN_ID: &str = "0x1a4";

/// Builder that fabricates a specification naming the signer and the genesis
/// contracts, and counts how often it was asked.
#[derive(Default)]
pub struct StubBuilder {
    calls: AtomicUsize,
    fail: bool,
}

impl StubBuilder {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenesisBuilder for StubBuilder {
    async fn build(&self, request: &BuildRequest) -> HarnessResult<BuiltGenesis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(HarnessError::BuildFailure("contracts failed to compile".into()));
        }

        let mut accounts = Map::new();
        accounts.insert(
            request.master_of_ceremony.to_checksum(),
            json!({ "balance": "0x200000000000000000000000000000000000000000000000000000000000000" }),
        );
        let mut interfaces = Map::new();
        for (name, address) in &request.genesis_contract_accounts {
            accounts.insert(address.clone(), json!({ "constructor": format!("0x60{name}") }));
            interfaces.insert(address.clone(), json!([{ "name": name }]));
        }
        let spec = json!({
            "name": "aura",
            "params": { "networkID": CHAIN_ID },
            "engine": { "os": request.key.os_ref(), "consensus": request.key.consensus_ref() },
            "accounts": Value::Object(accounts),
        });

        Ok(BuiltGenesis {
            spec: serde_json::to_vec_pretty(&spec).expect("encode spec"),
            abi: serde_json::to_vec(&Value::Object(interfaces)).expect("encode abi"),
        })
    }
}

/// Probe that answers with a fixed chain id, or never answers.
pub struct StubProbe {
    chain_id: Option<String>,
    calls: AtomicUsize,
}

impl StubProbe {
    pub fn ready() -> Self {
        Self {
            chain_id: Some(CHAIN_ID.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn silent() -> Self {
        Self {
            chain_id: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessProbe for StubProbe {
    async fn chain_id(&self, _endpoint: &RpcEndpoint) -> anyhow::Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.chain_id.clone())
    }
}

/// Configuration rooted in `root`, launching `sleep 30` as the node.
pub fn harness_config(root: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.cache_root = root.join(".spec");
    config.work_dir = root.join(".tmp");
    config.pid_file = root.join(".pid");
    config.revisions.os_ref = OS_REF.to_string();
    config.revisions.consensus_ref = CONSENSUS_REF.to_string();
    config.node.program = "sleep".to_string();
    config.node.args = vec!["30".to_string()];
    config.readiness.timeout_ms = 5_000;
    config.readiness.initial_backoff_ms = 5;
    config.readiness.max_backoff_ms = 20;
    config
}

pub fn orchestrator(
    config: HarnessConfig,
    builder: Arc<StubBuilder>,
    probe: Arc<StubProbe>,
) -> Orchestrator {
    Orchestrator::new(config, builder, probe).expect("valid harness config")
}

pub async fn wait_for_exit(node: &mut LaunchedNode) -> String {
    timeout(Duration::from_secs(10), node.wait_for_exit())
        .await
        .expect("node exit within timeout")
        .expect("exit status recorded")
}

/// True once `pid` has exited. A zombie still waiting for its new parent to
/// reap it counts as exited.
pub fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => (unsafe { libc::kill(pid, 0) }) != 0,
    }
}

/// Polls for up to five seconds; returns whether `pid` went away.
pub async fn wait_until_gone(pid: i32) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    process_gone(pid)
}

/// Waits for a shell to write `$!` into `path`.
pub async fn read_pid_file(path: &Path) -> anyhow::Result<i32> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse() {
                return Ok(pid);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("no pid written to {}", path.display());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A shell command that backgrounds `sleep 60`, records its pid in
/// `pid_file`, then runs `tail`.
pub fn background_child_script(pid_file: &Path, tail: &str) -> Vec<String> {
    vec![
        "-c".to_string(),
        format!("sleep 60 & echo $! > '{}'; {tail}", pid_file.display()),
    ]
}
