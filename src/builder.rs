use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::cache::CacheKey;
use crate::config::BuilderConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::identity::Address;

const SPEC_FILE: &str = "spec.json";
const ABI_FILE: &str = "spec.abi.json";

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub key: CacheKey,
    pub master_of_ceremony: Address,
    pub genesis_contract_accounts: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltGenesis {
    pub spec: Vec<u8>,
    pub abi: Vec<u8>,
}

/// Compiles the upstream contracts into a genesis specification.
#[async_trait]
pub trait GenesisBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> HarnessResult<BuiltGenesis>;
}

/// Runs an external build script that writes `spec.json` and `spec.abi.json`
/// into the directory named by `CHAINSPEC_OUTPUT_DIR`.
#[derive(Clone, Debug)]
pub struct CommandGenesisBuilder {
    program: String,
    args: Vec<String>,
    output_dir: PathBuf,
    timeout: Duration,
}

impl CommandGenesisBuilder {
    pub fn new(config: &BuilderConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            output_dir: output_dir.into(),
            timeout: config.timeout(),
        }
    }

    /// Removes outputs left by an earlier build so a script that exits 0
    /// without writing anything cannot hand back another key's genesis.
    async fn clear_outputs(&self) -> HarnessResult<()> {
        for name in [SPEC_FILE, ABI_FILE] {
            let path = self.output_dir.join(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(target: "aura::builder", path = %path.display(), "removed stale builder output");
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(HarnessError::io(path, err)),
            }
        }
        Ok(())
    }

    async fn read_output(&self, name: &str) -> HarnessResult<Vec<u8>> {
        let path = self.output_dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(HarnessError::BuildFailure(
                format!("builder did not produce {}", path.display()),
            )),
            Err(err) => Err(HarnessError::io(path, err)),
        }
    }
}

#[async_trait]
impl GenesisBuilder for CommandGenesisBuilder {
    async fn build(&self, request: &BuildRequest) -> HarnessResult<BuiltGenesis> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|err| HarnessError::io(&self.output_dir, err))?;
        self.clear_outputs().await?;
        let accounts = serde_json::to_string(&request.genesis_contract_accounts)
            .map_err(|err| HarnessError::BuildFailure(format!("encode contract accounts: {err}")))?;

        info!(
            target: "aura::builder",
            os_ref = request.key.os_ref(),
            consensus_ref = request.key.consensus_ref(),
            program = %self.program,
            "compiling genesis contracts from source"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("OS_REF", request.key.os_ref())
            .env("NETWORK_CONSENSUS_REF", request.key.consensus_ref())
            .env("MASTER_OF_CEREMONY", request.master_of_ceremony.to_checksum())
            .env("GENESIS_CONTRACT_ACCOUNTS", accounts)
            .env("CHAINSPEC_OUTPUT_DIR", &self.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| {
            HarnessError::BuildFailure(format!("spawn builder {}: {err}", self.program))
        })?;
        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                HarnessError::BuildFailure(format!("builder timed out after {:?}", self.timeout))
            })?
            .map_err(|err| HarnessError::BuildFailure(format!("await builder: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::BuildFailure(format!(
                "builder exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let spec = self.read_output(SPEC_FILE).await?;
        let abi = self.read_output(ABI_FILE).await?;
        Ok(BuiltGenesis { spec, abi })
    }
}
