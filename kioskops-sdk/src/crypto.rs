//! # crypto
//!
//! At-rest AES-256-GCM for queued payloads and (optionally) audit journal
//! lines, with versioned keys so rotation never strands old ciphertext.
//!
//! ## Blob layout (`AESGCM_V1`)
//!
//! ```text
//! [magic 4B "KAG1"][key version u16 BE][nonce 12B][ciphertext || 16B tag]
//! ```
//!
//! Nonces are random per encryption and never reused with a given key.
//! Decrypt fails closed: magic mismatch, unknown version, or a bad tag yield
//! `CorruptCiphertext` / `UnknownKeyVersion`, never silent plaintext.

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::error::{CryptoError, SdkError};

const MAGIC: &[u8; 4] = b"KAG1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 2 + NONCE_LEN;
const KEY_LEN_BITS: u16 = 256;
const ALGORITHM: &str = "AES-256-GCM";

// ── Key metadata ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub version: u16,
    pub created_ms: i64,
    pub algorithm: String,
    pub key_length_bits: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_from_version: Option<u16>,
    #[serde(default)]
    pub is_hardware_backed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    metadata: KeyMetadata,
    material_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyRingFile {
    current_version: u16,
    keys: Vec<StoredKey>,
}

struct KeyRing {
    path: PathBuf,
    current: u16,
    ciphers: HashMap<u16, Aes256Gcm>,
    metadata: Vec<KeyMetadata>,
}

// ── Provider ──────────────────────────────────────────────────────────────────

/// Symmetric AEAD provider. `noop` when queue encryption is disabled;
/// encrypt/decrypt are then the identity and the codec tags payloads
/// `PLAIN_UTF8`.
pub struct CryptoProvider {
    ring: Option<KeyRing>,
}

impl CryptoProvider {
    pub fn noop() -> Self {
        Self { ring: None }
    }

    /// Loads the keyring file, creating it with a fresh version-1 key on
    /// first run. The file lives in app-private storage; the original
    /// platform keystore is not available to a portable SDK, so
    /// `is_hardware_backed` stays false.
    pub async fn load_or_init(path: &Path, now_ms: i64) -> Result<Self, SdkError> {
        let file = match fs::read_to_string(path).await {
            Ok(data) => match serde_json::from_str::<KeyRingFile>(&data) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!("keyring file unreadable ({e}), reinitializing");
                    None
                }
            },
            Err(_) => None,
        };

        let file = match file {
            Some(f) if !f.keys.is_empty() => f,
            _ => {
                let first = new_stored_key(1, now_ms, None);
                let file = KeyRingFile { current_version: 1, keys: vec![first] };
                persist(path, &file).await?;
                info!("generated initial queue encryption key (version 1)");
                file
            }
        };

        let mut ciphers = HashMap::new();
        let mut metadata = Vec::new();
        for key in &file.keys {
            let material = STANDARD
                .decode(&key.material_b64)
                .map_err(|_| SdkError::Corrupt("keyring material not base64".into()))?;
            let cipher = Aes256Gcm::new_from_slice(&material)
                .map_err(|_| SdkError::Corrupt("keyring material wrong length".into()))?;
            ciphers.insert(key.metadata.version, cipher);
            metadata.push(key.metadata.clone());
        }
        if !ciphers.contains_key(&file.current_version) {
            return Err(SdkError::Corrupt(format!(
                "keyring current version {} has no material",
                file.current_version
            )));
        }

        Ok(Self {
            ring: Some(KeyRing {
                path: path.to_path_buf(),
                current: file.current_version,
                ciphers,
                metadata,
            }),
        })
    }

    pub fn enabled(&self) -> bool {
        self.ring.is_some()
    }

    pub fn current_key_version(&self) -> Option<u16> {
        self.ring.as_ref().map(|r| r.current)
    }

    pub fn key_metadata(&self) -> &[KeyMetadata] {
        self.ring.as_ref().map(|r| r.metadata.as_slice()).unwrap_or(&[])
    }

    /// Encrypts under the current key. Identity when disabled.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(ring) = &self.ring else {
            return Ok(plain.to_vec());
        };
        let cipher = ring
            .ciphers
            .get(&ring.current)
            .ok_or(CryptoError::UnknownKeyVersion(ring.current))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, plain).map_err(|_| CryptoError::CorruptCiphertext)?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&ring.current.to_be_bytes());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Key version named in a `KAG1` blob header, without decrypting.
    pub fn blob_key_version(blob: &[u8]) -> Result<u16, CryptoError> {
        if blob.len() < HEADER_LEN + TAG_LEN || &blob[..4] != MAGIC {
            return Err(CryptoError::CorruptCiphertext);
        }
        Ok(u16::from_be_bytes([blob[4], blob[5]]))
    }

    /// Decrypts a `KAG1` blob with whichever key version it names. Identity
    /// when disabled.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(ring) = &self.ring else {
            return Ok(blob.to_vec());
        };
        if blob.len() < HEADER_LEN + TAG_LEN || &blob[..4] != MAGIC {
            return Err(CryptoError::CorruptCiphertext);
        }
        let version = u16::from_be_bytes([blob[4], blob[5]]);
        let cipher = ring.ciphers.get(&version).ok_or(CryptoError::UnknownKeyVersion(version))?;
        let nonce = Nonce::from_slice(&blob[6..6 + NONCE_LEN]);
        cipher
            .decrypt(nonce, &blob[HEADER_LEN..])
            .map_err(|_| CryptoError::CorruptCiphertext)
    }

    /// Rotation mechanics: mint `current + 1`, persist it, switch over. Old
    /// versions stay resolvable for decrypt. Policy (age/event thresholds)
    /// belongs to the caller; this only rotates.
    pub async fn rotate_key(&mut self, now_ms: i64) -> Result<u16, SdkError> {
        let Some(ring) = &mut self.ring else {
            return Err(SdkError::Config("cannot rotate keys: encryption disabled".into()));
        };
        let next_version = ring.current + 1;
        let stored = new_stored_key(next_version, now_ms, Some(ring.current));
        let metadata = stored.metadata.clone();
        let material = STANDARD.decode(&stored.material_b64).expect("freshly encoded");
        let cipher = Aes256Gcm::new_from_slice(&material).expect("freshly generated 32-byte key");

        // Read-modify-write the on-disk ring: old material must survive so
        // existing ciphertext stays decryptable.
        let existing = fs::read_to_string(&ring.path).await?;
        let mut on_disk: KeyRingFile = serde_json::from_str(&existing)
            .map_err(|_| SdkError::Corrupt("keyring file unreadable during rotation".into()))?;
        on_disk.keys.push(stored);
        on_disk.current_version = next_version;
        persist(&ring.path, &on_disk).await?;

        ring.ciphers.insert(next_version, cipher);
        ring.metadata.push(metadata);
        ring.current = next_version;
        info!("rotated queue encryption key to version {next_version}");
        Ok(next_version)
    }
}

fn new_stored_key(version: u16, now_ms: i64, rotated_from: Option<u16>) -> StoredKey {
    let key: Key<Aes256Gcm> = Aes256Gcm::generate_key(&mut OsRng);
    let fingerprint = hex::encode(&Sha256::digest(key.as_slice())[..4]);
    info!("minted key version {version} (fingerprint {fingerprint})");
    StoredKey {
        metadata: KeyMetadata {
            version,
            created_ms: now_ms,
            algorithm: ALGORITHM.to_string(),
            key_length_bits: KEY_LEN_BITS,
            rotated_from_version: rotated_from,
            is_hardware_backed: false,
        },
        material_b64: STANDARD.encode(key.as_slice()),
    }
}

async fn persist(path: &Path, file: &KeyRingFile) -> Result<(), SdkError> {
    let json = serde_json::to_string_pretty(file)?;
    fs::write(path, json).await?;
    Ok(())
}
