//! Master of ceremony identity: the secp256k1 key that seals genesis.
//!
//! The key is persisted twice under the cache prefix: as an encrypted keystore
//! document and as a raw hex private key. Recovery re-derives the address from
//! the raw key and refuses to continue when the two files disagree.

use std::fmt;
use std::str::FromStr;

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use k256::ecdsa::SigningKey;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cache::{ArtifactCache, ArtifactKind, CacheKey};
use crate::errors::{HarnessError, HarnessResult};

const KEYSTORE_VERSION: u32 = 3;
const CIPHER_ALGORITHM: &str = "aes-128-ctr";
const KDF_ALGORITHM: &str = "scrypt";
// Light scrypt cost: N = 2^12, r = 8, p = 6.
const SCRYPT_LOG_N: u8 = 12;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 6;
const DERIVED_KEY_LEN: usize = 32;
const CIPHER_KEY_LEN: usize = 16;
const SALT_LEN: usize = 32;
const IV_LEN: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// 20-byte account address derived from the keccak hash of the public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub fn from_signing_key(key: &SigningKey) -> Self {
        let point = key.verifying_key().to_encoded_point(false);
        let digest = Keccak256::digest(&point.as_bytes()[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex without the `0x` prefix, the form stored in keystores.
    pub fn to_plain_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Mixed-case checksummed form (EIP-55).
    pub fn to_checksum(&self) -> String {
        let plain = self.to_plain_hex();
        let hash = Keccak256::digest(plain.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (index, ch) in plain.chars().enumerate() {
            let nibble = if index % 2 == 0 {
                hash[index / 2] >> 4
            } else {
                hash[index / 2] & 0x0f
            };
            if ch.is_ascii_alphabetic() && nibble >= 8 {
                out.push(ch.to_ascii_uppercase());
            } else {
                out.push(ch);
            }
        }
        out
    }
}

impl FromStr for Address {
    type Err = HarnessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let decoded = hex::decode(digits)
            .map_err(|err| HarnessError::CorruptCache(format!("invalid address `{value}`: {err}")))?;
        let bytes: [u8; 20] = decoded.as_slice().try_into().map_err(|_| {
            HarnessError::CorruptCache(format!(
                "invalid address `{value}`: expected 20 bytes, found {}",
                decoded.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_checksum())
    }
}

/// The master of ceremony key pair together with its serialized keystore.
#[derive(Clone)]
pub struct SigningIdentity {
    address: Address,
    key: SigningKey,
    keystore_json: String,
}

impl SigningIdentity {
    pub fn generate() -> HarnessResult<Self> {
        let key = SigningKey::random(&mut OsRng);
        Self::from_signing_key(key)
    }

    pub fn from_signing_key(key: SigningKey) -> HarnessResult<Self> {
        let address = Address::from_signing_key(&key);
        let passphrase = Zeroizing::new(hex::encode(key.to_bytes()));
        let document = KeystoreDocument::encrypt(&address, &key, passphrase.as_bytes())?;
        let keystore_json = serde_json::to_string(&document)
            .map_err(|err| HarnessError::CorruptCache(format!("unable to encode keystore: {err}")))?;
        Ok(Self {
            address,
            key,
            keystore_json,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    pub fn private_key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.key.to_bytes()))
    }

    pub fn keystore_json(&self) -> &str {
        &self.keystore_json
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Web3 secret storage (version 3) document, as read by the node's
/// `--engine-signer` keystore loader.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeystoreDocument {
    pub version: u32,
    pub id: String,
    pub address: String,
    #[serde(alias = "Crypto")]
    pub crypto: KeystoreCrypto,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeystoreCrypto {
    pub cipher: String,
    pub ciphertext: String,
    pub cipherparams: CipherParams,
    pub kdf: String,
    pub kdfparams: ScryptParams,
    pub mac: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CipherParams {
    pub iv: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScryptParams {
    pub dklen: usize,
    pub n: u64,
    pub r: u32,
    pub p: u32,
    pub salt: String,
}

impl KeystoreDocument {
    pub fn encrypt(address: &Address, key: &SigningKey, passphrase: &[u8]) -> HarnessResult<Self> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let derived = derive_key(passphrase, &salt, SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)?;
        let mut ciphertext = key.to_bytes().to_vec();
        apply_keystream(&derived[..CIPHER_KEY_LEN], &iv, &mut ciphertext)?;
        let mac = keystore_mac(&derived, &ciphertext);

        Ok(Self {
            version: KEYSTORE_VERSION,
            id: Uuid::new_v4().to_string(),
            address: address.to_plain_hex(),
            crypto: KeystoreCrypto {
                cipher: CIPHER_ALGORITHM.to_string(),
                ciphertext: hex::encode(&ciphertext),
                cipherparams: CipherParams {
                    iv: hex::encode(iv),
                },
                kdf: KDF_ALGORITHM.to_string(),
                kdfparams: ScryptParams {
                    dklen: DERIVED_KEY_LEN,
                    n: 1u64 << SCRYPT_LOG_N,
                    r: SCRYPT_R,
                    p: SCRYPT_P,
                    salt: hex::encode(salt),
                },
                mac: hex::encode(mac),
            },
        })
    }

    pub fn parse(bytes: &[u8]) -> HarnessResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| HarnessError::CorruptCache(format!("undecodable keystore: {err}")))
    }

    pub fn address(&self) -> HarnessResult<Address> {
        self.address.parse()
    }

    pub fn decrypt(&self, passphrase: &[u8]) -> HarnessResult<SigningKey> {
        if self.version != KEYSTORE_VERSION {
            return Err(HarnessError::CorruptCache(format!(
                "unsupported keystore version {} (expected {KEYSTORE_VERSION})",
                self.version
            )));
        }
        if self.crypto.cipher != CIPHER_ALGORITHM {
            return Err(HarnessError::CorruptCache(format!(
                "unsupported keystore cipher {}",
                self.crypto.cipher
            )));
        }
        if self.crypto.kdf != KDF_ALGORITHM {
            return Err(HarnessError::CorruptCache(format!(
                "unsupported keystore kdf {}",
                self.crypto.kdf
            )));
        }

        let params = &self.crypto.kdfparams;
        if params.dklen != DERIVED_KEY_LEN {
            return Err(HarnessError::CorruptCache(format!(
                "unsupported keystore dklen {}",
                params.dklen
            )));
        }
        if !params.n.is_power_of_two() || params.n < 2 {
            return Err(HarnessError::CorruptCache(format!(
                "keystore scrypt n {} is not a power of two",
                params.n
            )));
        }
        let log_n = u8::try_from(params.n.trailing_zeros())
            .map_err(|_| HarnessError::CorruptCache("keystore scrypt n out of range".into()))?;

        let salt = decode_field(&params.salt, "salt")?;
        let iv = decode_field(&self.crypto.cipherparams.iv, "iv")?;
        let ciphertext = decode_field(&self.crypto.ciphertext, "ciphertext")?;
        let expected_mac = decode_field(&self.crypto.mac, "mac")?;

        let derived = derive_key(passphrase, &salt, log_n, params.r, params.p)?;
        if keystore_mac(&derived, &ciphertext).as_slice() != expected_mac.as_slice() {
            return Err(HarnessError::CorruptCache(
                "keystore mac mismatch: wrong passphrase or tampered document".into(),
            ));
        }

        let mut plaintext = Zeroizing::new(ciphertext);
        apply_keystream(&derived[..CIPHER_KEY_LEN], &iv, &mut plaintext)?;
        SigningKey::from_slice(&plaintext)
            .map_err(|err| HarnessError::CorruptCache(format!("invalid keystore secret: {err}")))
    }
}

fn derive_key(
    passphrase: &[u8],
    salt: &[u8],
    log_n: u8,
    r: u32,
    p: u32,
) -> HarnessResult<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    let params = scrypt::Params::new(log_n, r, p, DERIVED_KEY_LEN)
        .map_err(|err| HarnessError::CorruptCache(format!("invalid scrypt parameters: {err}")))?;
    let mut derived = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    scrypt::scrypt(passphrase, salt, &params, derived.as_mut())
        .map_err(|err| HarnessError::CorruptCache(format!("scrypt failure: {err}")))?;
    Ok(derived)
}

fn apply_keystream(key: &[u8], iv: &[u8], buf: &mut [u8]) -> HarnessResult<()> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|_| HarnessError::CorruptCache("invalid keystore cipher parameters".into()))?;
    cipher.apply_keystream(buf);
    Ok(())
}

/// keccak256 over the second half of the derived key followed by the
/// ciphertext.
fn keystore_mac(derived: &[u8; DERIVED_KEY_LEN], ciphertext: &[u8]) -> [u8; 32] {
    Keccak256::new()
        .chain_update(&derived[CIPHER_KEY_LEN..])
        .chain_update(ciphertext)
        .finalize()
        .into()
}

fn decode_field(value: &str, label: &str) -> HarnessResult<Vec<u8>> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits)
        .map_err(|err| HarnessError::CorruptCache(format!("invalid keystore {label} encoding: {err}")))
}

fn parse_private_key(raw: &[u8]) -> HarnessResult<SigningKey> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HarnessError::CorruptCache("private key file is not utf-8".into()))?;
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = Zeroizing::new(
        hex::decode(digits)
            .map_err(|err| HarnessError::CorruptCache(format!("invalid private key encoding: {err}")))?,
    );
    SigningKey::from_slice(&bytes)
        .map_err(|err| HarnessError::CorruptCache(format!("invalid private key bytes: {err}")))
}

/// Produces or recovers the one identity associated with a cache prefix.
#[derive(Clone, Debug)]
pub struct IdentityProvider {
    cache: ArtifactCache,
    key: CacheKey,
}

impl IdentityProvider {
    pub fn new(cache: ArtifactCache, key: CacheKey) -> Self {
        Self { cache, key }
    }

    pub fn has(&self) -> bool {
        self.cache.contains(ArtifactKind::Keystore, &self.key)
            && self.cache.contains(ArtifactKind::PrivateKey, &self.key)
    }

    pub fn obtain(&self) -> HarnessResult<SigningIdentity> {
        if self.has() {
            return self.recover();
        }

        let identity = SigningIdentity::generate()?;
        self.cache.write(
            ArtifactKind::Keystore,
            &self.key,
            identity.keystore_json().as_bytes(),
        )?;
        self.cache.write(
            ArtifactKind::PrivateKey,
            &self.key,
            identity.private_key_hex().as_bytes(),
        )?;
        info!(
            target: "aura::identity",
            prefix = %self.key,
            address = %identity.address(),
            "generated master of ceremony identity"
        );
        Ok(identity)
    }

    fn recover(&self) -> HarnessResult<SigningIdentity> {
        let raw_key = self.read_required(ArtifactKind::PrivateKey)?;
        let keystore_bytes = self.read_required(ArtifactKind::Keystore)?;

        let key = parse_private_key(&raw_key)?;
        let document = KeystoreDocument::parse(&keystore_bytes)?;
        let stored = document.address()?;
        let derived = Address::from_signing_key(&key);
        if stored != derived {
            warn!(
                target: "aura::identity",
                prefix = %self.key,
                keystore = %stored,
                private_key = %derived,
                "cached keystore and private key disagree"
            );
            return Err(HarnessError::CorruptCache(format!(
                "keystore address {stored} does not match private key address {derived}"
            )));
        }

        let passphrase = Zeroizing::new(hex::encode(key.to_bytes()));
        let sealed = document.decrypt(passphrase.as_bytes())?;
        if sealed.to_bytes() != key.to_bytes() {
            return Err(HarnessError::CorruptCache(
                "keystore secret does not match cached private key".into(),
            ));
        }

        let keystore_json = String::from_utf8(keystore_bytes)
            .map_err(|_| HarnessError::CorruptCache("keystore is not utf-8".into()))?;
        info!(
            target: "aura::identity",
            prefix = %self.key,
            address = %derived,
            "recovered cached master of ceremony identity"
        );
        Ok(SigningIdentity {
            address: derived,
            key,
            keystore_json,
        })
    }

    fn read_required(&self, kind: ArtifactKind) -> HarnessResult<Vec<u8>> {
        self.cache.read(kind, &self.key)?.ok_or_else(|| {
            HarnessError::CorruptCache(format!(
                "{} disappeared while recovering identity",
                self.cache.path_for(kind, &self.key).display()
            ))
        })
    }
}
