use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::errors::{HarnessError, HarnessResult};

pub const ABSTRACT_STORAGE_ADDRESS: &str = "0x0000000000000000000000000000000000000009";
pub const REGISTRY_IDX_ADDRESS: &str = "0x0000000000000000000000000000000000000010";
pub const PROVIDER_ADDRESS: &str = "0x0000000000000000000000000000000000000011";
pub const AURA_ADDRESS: &str = "0x0000000000000000000000000000000000000012";
pub const VALIDATOR_CONSOLE_ADDRESS: &str = "0x0000000000000000000000000000000000000013";
pub const VOTING_CONSOLE_ADDRESS: &str = "0x0000000000000000000000000000000000000014";
pub const INIT_BRIDGES_ADDRESS: &str = "0x0000000000000000000000000000000000000015";
pub const BRIDGES_CONSOLE_ADDRESS: &str = "0x0000000000000000000000000000000000000016";
pub const ORACLES_CONSOLE_ADDRESS: &str = "0x0000000000000000000000000000000000000017";
pub const NETWORK_CONSENSUS_ADDRESS: &str = "0x0000000000000000000000000000000000000018";

/// Named contract accounts that the builder places into the genesis block.
pub fn genesis_contract_accounts() -> BTreeMap<String, String> {
    [
        ("AbstractStorage", ABSTRACT_STORAGE_ADDRESS),
        ("RegistryIdx", REGISTRY_IDX_ADDRESS),
        ("Provider", PROVIDER_ADDRESS),
        ("Aura", AURA_ADDRESS),
        ("ValidatorConsole", VALIDATOR_CONSOLE_ADDRESS),
        ("VotingConsole", VOTING_CONSOLE_ADDRESS),
        ("InitBridges", INIT_BRIDGES_ADDRESS),
        ("BridgesConsole", BRIDGES_CONSOLE_ADDRESS),
        ("OraclesConsole", ORACLES_CONSOLE_ADDRESS),
        ("NetworkConsensus", NETWORK_CONSENSUS_ADDRESS),
    ]
    .into_iter()
    .map(|(name, address)| (name.to_string(), address.to_string()))
    .collect()
}

/// A genesis specification as consumed by the node, plus the parsed view used
/// for assertions after the network is up.
#[derive(Clone, Debug)]
pub struct GenesisSpec {
    raw: Vec<u8>,
    abi: Option<Vec<u8>>,
    parsed: Map<String, Value>,
}

impl GenesisSpec {
    pub fn parse(raw: Vec<u8>, abi: Option<Vec<u8>>) -> HarnessResult<Self> {
        let parsed = match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(HarnessError::CorruptCache(format!(
                    "genesis specification must be a JSON object, found {}",
                    json_kind(&other)
                )))
            }
            Err(err) => {
                return Err(HarnessError::CorruptCache(format!(
                    "undecodable genesis specification: {err}"
                )))
            }
        };
        Ok(Self { raw, abi, parsed })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn abi(&self) -> Option<&[u8]> {
        self.abi.as_deref()
    }

    pub fn parsed(&self) -> &Map<String, Value> {
        &self.parsed
    }

    pub fn accounts(&self) -> Option<&Map<String, Value>> {
        self.parsed.get("accounts").and_then(Value::as_object)
    }

    /// `params.networkID`, which the builder writes as a hex quantity.
    pub fn network_id(&self) -> Option<u64> {
        let raw = self.parsed.get("params")?.get("networkID")?.as_str()?;
        let digits = raw.strip_prefix("0x").unwrap_or(raw);
        u64::from_str_radix(digits, 16).ok()
    }

    /// Looks up an account entry, tolerating checksum casing differences.
    pub fn account(&self, address: &str) -> Option<&Value> {
        let accounts = self.accounts()?;
        accounts.get(address).or_else(|| {
            accounts
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(address))
                .map(|(_, value)| value)
        })
    }

    /// Returns the interface definition the builder emitted for the contract
    /// deployed at `address`.
    pub fn contract_interface(&self, address: &str) -> HarnessResult<Option<Value>> {
        let Some(abi) = self.abi.as_deref() else {
            return Ok(None);
        };
        let document: Value = serde_json::from_slice(abi).map_err(|err| {
            HarnessError::CorruptCache(format!("undecodable genesis interface document: {err}"))
        })?;
        let Some(entries) = document.as_object() else {
            return Err(HarnessError::CorruptCache(
                "genesis interface document must be a JSON object".into(),
            ));
        };
        Ok(entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(address))
            .map(|(_, value)| value.clone()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "name": "aura",
        "params": {"networkID": "0x1a4"},
        "accounts": {
            "0x0000000000000000000000000000000000000012": {"constructor": "0x6080"},
            "0xAbCd000000000000000000000000000000000001": {"balance": "1"}
        }
    }"#;

    #[test]
    fn contract_account_table_has_ten_entries() {
        let accounts = genesis_contract_accounts();
        assert_eq!(accounts.len(), 10);
        assert_eq!(
            accounts.get("NetworkConsensus").map(String::as_str),
            Some(NETWORK_CONSENSUS_ADDRESS)
        );
    }

    #[test]
    fn account_lookup_ignores_case() {
        let spec = GenesisSpec::parse(SPEC.as_bytes().to_vec(), None).expect("parse spec");
        assert!(spec.account(AURA_ADDRESS).is_some());
        assert!(spec
            .account("0xabcd000000000000000000000000000000000001")
            .is_some());
        assert!(spec.account(PROVIDER_ADDRESS).is_none());
        assert_eq!(spec.network_id(), Some(0x1a4));
    }

    #[test]
    fn non_object_spec_is_rejected() {
        let err = GenesisSpec::parse(b"[1,2,3]".to_vec(), None).expect_err("array rejected");
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn interface_lookup_reads_abi_document() {
        let abi = format!(r#"{{"{NETWORK_CONSENSUS_ADDRESS}": [{{"name": "getValidators"}}]}}"#);
        let spec = GenesisSpec::parse(SPEC.as_bytes().to_vec(), Some(abi.into_bytes()))
            .expect("parse spec");
        let interface = spec
            .contract_interface(NETWORK_CONSENSUS_ADDRESS)
            .expect("decode abi")
            .expect("interface present");
        assert_eq!(interface[0]["name"], "getValidators");
        assert!(spec.contract_interface(AURA_ADDRESS).expect("decode").is_none());
    }
}
