//! Blocks the caller until a launched node answers RPC.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::config::ReadinessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::launcher::{LaunchedNode, RpcEndpoint};

/// The one RPC capability the harness needs: ask a node for its chain id.
/// `Ok(None)` and `Err(_)` both mean "not ready yet".
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn chain_id(&self, endpoint: &RpcEndpoint) -> anyhow::Result<Option<String>>;
}

/// Issues `eth_chainId` over HTTP JSON-RPC.
#[derive(Clone, Debug)]
pub struct JsonRpcProbe {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl JsonRpcProbe {
    pub fn new(request_timeout: Duration) -> HarnessResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| HarnessError::Config(format!("build JSON-RPC client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LivenessProbe for JsonRpcProbe {
    async fn chain_id(&self, endpoint: &RpcEndpoint) -> anyhow::Result<Option<String>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_chainId",
            "params": [],
        });
        let response = self.client.post(endpoint.url()).json(&body).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let payload: JsonRpcResponse = response.json().await?;
        if let Some(error) = payload.error {
            anyhow::bail!("eth_chainId returned error {error}");
        }
        Ok(match payload.result {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Some(id),
            Some(serde_json::Value::Number(id)) => Some(id.to_string()),
            _ => None,
        })
    }
}

/// Polls a probe with exponential backoff until it yields a chain id or the
/// deadline passes.
#[derive(Clone, Debug)]
pub struct ReadinessGate {
    timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ReadinessGate {
    pub fn new(timeout: Duration, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            timeout,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    pub fn from_config(config: &ReadinessConfig) -> Self {
        Self::new(config.timeout(), config.initial_backoff(), config.max_backoff())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for `node` and fails early with `LaunchFailure` once its process
    /// group is gone without having answered.
    pub async fn await_ready(
        &self,
        probe: &dyn LivenessProbe,
        node: &LaunchedNode,
    ) -> HarnessResult<String> {
        self.poll(probe, node.endpoint(), || node.group_exit_status()).await
    }

    /// Waits for an endpoint without a process to watch.
    pub async fn await_endpoint(
        &self,
        probe: &dyn LivenessProbe,
        endpoint: &RpcEndpoint,
    ) -> HarnessResult<String> {
        self.poll(probe, endpoint, || None).await
    }

    async fn poll<F>(
        &self,
        probe: &dyn LivenessProbe,
        endpoint: &RpcEndpoint,
        exited: F,
    ) -> HarnessResult<String>
    where
        F: Fn() -> Option<String>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut backoff = self.initial_backoff;
        let mut attempts = 0u32;

        loop {
            if let Some(status) = exited() {
                return Err(HarnessError::LaunchFailure(format!(
                    "node for {endpoint} exited before becoming ready ({status})"
                )));
            }

            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, probe.chain_id(endpoint))
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("probe exceeded the readiness deadline")))
            {
                Ok(Some(chain_id)) => {
                    info!(
                        target: "aura::readiness",
                        endpoint = %endpoint,
                        chain_id = %chain_id,
                        attempts,
                        "node is ready"
                    );
                    return Ok(chain_id);
                }
                Ok(None) => {
                    debug!(target: "aura::readiness", endpoint = %endpoint, attempts, "no chain id yet");
                }
                Err(err) => {
                    debug!(target: "aura::readiness", endpoint = %endpoint, attempts, error = %err, "probe failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::NotReady {
                    endpoint: endpoint.url(),
                    attempts,
                    waited: now.duration_since(started),
                });
            }
            sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }
}
