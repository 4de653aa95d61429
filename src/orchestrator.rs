//! Composes the harness components into the bootstrap sequence:
//! reap, prepare directories, obtain the signing identity, resolve the genesis
//! specification, launch, await readiness, parse. The first failing step
//! aborts the sequence and its error is returned unchanged.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::builder::{BuildRequest, CommandGenesisBuilder, GenesisBuilder};
use crate::cache::{ArtifactCache, ArtifactKind, CacheKey};
use crate::config::{ExistingDirPolicy, HarnessConfig};
use crate::errors::{HarnessError, HarnessResult};
use crate::genesis::{genesis_contract_accounts, GenesisSpec};
use crate::identity::{Address, IdentityProvider, SigningIdentity};
use crate::launcher::{LaunchedNode, NodeLauncher, ProcessRegistry, RpcEndpoint};
use crate::readiness::{JsonRpcProbe, LivenessProbe, ReadinessGate};
use crate::reaper::{reap, ParentPidRecord};
use crate::teardown::{teardown, TeardownGuard};

pub const WORK_SPEC_FILE: &str = "spec.json";
pub const WORK_ABI_FILE: &str = "spec.abi.json";
const BUILD_DIR: &str = "build";
const LOG_DIR: &str = "logs";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecSource {
    Cached,
    Built,
}

#[derive(Debug)]
pub struct BootstrapOutcome {
    pub network_id: String,
    pub endpoint: RpcEndpoint,
    pub chain_id: String,
    pub signer: Address,
    pub spec: GenesisSpec,
    pub spec_source: SpecSource,
    pub node: LaunchedNode,
}

pub struct Orchestrator {
    config: HarnessConfig,
    key: CacheKey,
    cache: ArtifactCache,
    record: ParentPidRecord,
    launcher: NodeLauncher,
    gate: ReadinessGate,
    builder: Arc<dyn GenesisBuilder>,
    probe: Arc<dyn LivenessProbe>,
    identity: Option<SigningIdentity>,
}

impl Orchestrator {
    pub fn new(
        config: HarnessConfig,
        builder: Arc<dyn GenesisBuilder>,
        probe: Arc<dyn LivenessProbe>,
    ) -> HarnessResult<Self> {
        config.validate()?;
        let key = CacheKey::new(
            config.revisions.os_ref.clone(),
            config.revisions.consensus_ref.clone(),
        )?;
        let cache = ArtifactCache::new(config.cache_root.clone());
        let record = ParentPidRecord::new(config.pid_file.clone());
        let launcher = NodeLauncher::new(
            config.node.clone(),
            record.clone(),
            ProcessRegistry::default(),
        )
        .with_log_dir(config.work_dir.join(LOG_DIR));
        let gate = ReadinessGate::from_config(&config.readiness);

        Ok(Self {
            config,
            key,
            cache,
            record,
            launcher,
            gate,
            builder,
            probe,
            identity: None,
        })
    }

    /// Wires the command-line builder and the JSON-RPC probe.
    pub fn from_config(config: HarnessConfig) -> HarnessResult<Self> {
        let builder = CommandGenesisBuilder::new(&config.builder, config.work_dir.join(BUILD_DIR));
        let probe = JsonRpcProbe::new(config.readiness.request_timeout())?;
        Self::new(config, Arc::new(builder), Arc::new(probe))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn registry(&self) -> ProcessRegistry {
        self.launcher.registry().clone()
    }

    pub fn identity(&self) -> Option<&SigningIdentity> {
        self.identity.as_ref()
    }

    pub fn teardown_guard(&self) -> TeardownGuard {
        TeardownGuard::new(self.registry())
    }

    pub fn teardown(&self) -> usize {
        teardown(self.launcher.registry())
    }

    pub fn work_spec_path(&self) -> PathBuf {
        self.config.work_dir.join(WORK_SPEC_FILE)
    }

    pub fn identity_provider(&self) -> IdentityProvider {
        IdentityProvider::new(self.cache.clone(), self.key.clone())
    }

    pub async fn bootstrap(&mut self) -> HarnessResult<BootstrapOutcome> {
        if let Some(pid) = reap(&self.record)? {
            info!(target: "aura::orchestrator", pid, "reaped orphaned node from a previous run");
        }
        self.prepare_dirs()?;

        let identity = self.identity_provider().obtain()?;
        let signer = identity.address();
        self.identity = Some(identity);

        let (raw_spec, abi, spec_source) = self.resolve_spec(signer).await?;
        self.stage_spec(&raw_spec, abi.as_deref())?;

        let node = self.launcher.launch(self.identity.as_ref()).await?;
        let chain_id = self.gate.await_ready(self.probe.as_ref(), &node).await?;
        let spec = GenesisSpec::parse(raw_spec, abi)?;

        info!(
            target: "aura::orchestrator",
            network_id = %self.config.network_id,
            endpoint = %node.endpoint(),
            chain_id = %chain_id,
            signer = %signer,
            source = ?spec_source,
            "network bootstrapped"
        );

        Ok(BootstrapOutcome {
            network_id: self.config.network_id.clone(),
            endpoint: node.endpoint().clone(),
            chain_id,
            signer,
            spec,
            spec_source,
            node,
        })
    }

    /// Launches one more node against the already staged specification and
    /// waits for it to answer.
    pub async fn add_node(&mut self) -> HarnessResult<(LaunchedNode, String)> {
        if self.identity.is_none() || !self.work_spec_path().is_file() {
            return Err(HarnessError::Config(
                "bootstrap must succeed before additional nodes are launched".into(),
            ));
        }
        let node = self.launcher.launch(self.identity.as_ref()).await?;
        let chain_id = self.gate.await_ready(self.probe.as_ref(), &node).await?;
        Ok((node, chain_id))
    }

    fn prepare_dirs(&self) -> HarnessResult<()> {
        for dir in [&self.config.work_dir, &self.config.cache_root] {
            prepare_dir(dir, self.config.existing_dirs)?;
        }
        Ok(())
    }

    async fn resolve_spec(
        &self,
        signer: Address,
    ) -> HarnessResult<(Vec<u8>, Option<Vec<u8>>, SpecSource)> {
        if let Some(spec) = self.cache.read(ArtifactKind::Spec, &self.key)? {
            info!(target: "aura::orchestrator", prefix = %self.key, "using cached genesis specification");
            let abi = self.cache.read(ArtifactKind::SpecAbi, &self.key)?;
            if abi.is_none() {
                warn!(target: "aura::orchestrator", prefix = %self.key, "no cached genesis interface document");
            }
            return Ok((spec, abi, SpecSource::Cached));
        }

        let request = BuildRequest {
            key: self.key.clone(),
            master_of_ceremony: signer,
            genesis_contract_accounts: genesis_contract_accounts(),
        };
        let built = self.builder.build(&request).await?;
        self.cache.write(ArtifactKind::Spec, &self.key, &built.spec)?;
        self.cache.write(ArtifactKind::SpecAbi, &self.key, &built.abi)?;
        Ok((built.spec, Some(built.abi), SpecSource::Built))
    }

    fn stage_spec(&self, spec: &[u8], abi: Option<&[u8]>) -> HarnessResult<()> {
        let spec_path = self.work_spec_path();
        fs::write(&spec_path, spec).map_err(|err| HarnessError::io(&spec_path, err))?;
        let abi_path = self.config.work_dir.join(WORK_ABI_FILE);
        fs::write(&abi_path, abi.unwrap_or_default())
            .map_err(|err| HarnessError::io(&abi_path, err))?;
        Ok(())
    }
}

fn prepare_dir(dir: &Path, policy: ExistingDirPolicy) -> HarnessResult<()> {
    match policy {
        ExistingDirPolicy::Reuse => {
            fs::create_dir_all(dir).map_err(|err| HarnessError::io(dir, err))
        }
        ExistingDirPolicy::Reject => match fs::create_dir(dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(HarnessError::DirectoryExists(dir.to_path_buf()))
            }
            Err(err) => Err(HarnessError::io(dir, err)),
        },
    }
}
