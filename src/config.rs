use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;
use crate::errors::{HarnessError, HarnessResult};

pub const OS_REF_ENV: &str = "OS_REF";
pub const CONSENSUS_REF_ENV: &str = "NETWORK_CONSENSUS_REF";

/// Top-level harness configuration. Every field has a default so an empty
/// TOML document is a valid configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_network_id")]
    pub network_id: String,
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default)]
    pub existing_dirs: ExistingDirPolicy,
    #[serde(default)]
    pub revisions: RevisionConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
}

/// How `PrepareDirs` treats a working or cache directory that is already
/// present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingDirPolicy {
    #[default]
    Reuse,
    Reject,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RevisionConfig {
    #[serde(default)]
    pub os_ref: String,
    #[serde(default)]
    pub consensus_ref: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_program")]
    pub program: String,
    #[serde(default = "default_node_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_logging")]
    pub logging: String,
    #[serde(default = "default_rpc_host")]
    pub rpc_host: String,
    #[serde(default = "default_rpc_base_port")]
    pub rpc_base_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_ready_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuilderConfig {
    #[serde(default = "default_builder_program")]
    pub program: String,
    #[serde(default = "default_builder_args")]
    pub args: Vec<String>,
    #[serde(default = "default_builder_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_network_id() -> String {
    "arbitraryidentifier".to_string()
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("./.spec")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./.tmp")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("./.pid")
}

fn default_node_program() -> String {
    "bash".to_string()
}

fn default_node_args() -> Vec<String> {
    vec!["-c".to_string(), "./start-node.sh".to_string()]
}

fn default_logging() -> String {
    "debug".to_string()
}

fn default_rpc_host() -> String {
    "localhost".to_string()
}

fn default_rpc_base_port() -> u16 {
    8050
}

fn default_ready_timeout_ms() -> u64 {
    120_000
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_builder_program() -> String {
    "bash".to_string()
}

fn default_builder_args() -> Vec<String> {
    vec!["-c".to_string(), "./build-chainspec.sh".to_string()]
}

fn default_builder_timeout_ms() -> u64 {
    1_800_000
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            network_id: default_network_id(),
            cache_root: default_cache_root(),
            work_dir: default_work_dir(),
            pid_file: default_pid_file(),
            existing_dirs: ExistingDirPolicy::default(),
            revisions: RevisionConfig::default(),
            node: NodeConfig::default(),
            readiness: ReadinessConfig::default(),
            builder: BuilderConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            program: default_node_program(),
            args: default_node_args(),
            working_dir: None,
            env: BTreeMap::new(),
            logging: default_logging(),
            rpc_host: default_rpc_host(),
            rpc_base_port: default_rpc_base_port(),
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ready_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            program: default_builder_program(),
            args: default_builder_args(),
            timeout_ms: default_builder_timeout_ms(),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| HarnessError::io(path, err))?;
        toml::from_str(&content)
            .map_err(|err| HarnessError::Config(format!("unable to parse config: {err}")))
    }

    /// Loads `path` when it exists, otherwise starts from the defaults.
    pub fn load_or_default(path: &Path) -> HarnessResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| HarnessError::io(parent, err))?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| HarnessError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded).map_err(|err| HarnessError::io(path, err))
    }

    /// Overrides the revision identifiers from `OS_REF` and
    /// `NETWORK_CONSENSUS_REF` when they are set.
    pub fn apply_env(&mut self) {
        if let Ok(value) = env::var(OS_REF_ENV) {
            self.revisions.os_ref = value;
        }
        if let Ok(value) = env::var(CONSENSUS_REF_ENV) {
            self.revisions.consensus_ref = value;
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.node.program.trim().is_empty() {
            return Err(HarnessError::Config("node.program must not be empty".into()));
        }
        if self.node.rpc_base_port == 0 {
            return Err(HarnessError::Config("node.rpc_base_port must be non-zero".into()));
        }
        if self.readiness.timeout_ms == 0 {
            return Err(HarnessError::Config("readiness.timeout_ms must be non-zero".into()));
        }
        if self.readiness.initial_backoff_ms > self.readiness.max_backoff_ms {
            return Err(HarnessError::Config(
                "readiness.initial_backoff_ms exceeds readiness.max_backoff_ms".into(),
            ));
        }
        CacheKey::new(
            self.revisions.os_ref.as_str(),
            self.revisions.consensus_ref.as_str(),
        )?;
        Ok(())
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl BuilderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
