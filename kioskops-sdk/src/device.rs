//! Device identity store: a single-file JSON key/value record holding the
//! install secret, the device id, and the audit chain generation counter.
//!
//! The install secret seeds deterministic idempotency keys; it is generated
//! once (32 random bytes), read once at init, and cached immutably.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SdkError;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    install_secret_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(default)]
    chain_generation: u64,
}

pub struct DeviceStore {
    path: PathBuf,
    file: DeviceFile,
    install_secret: Vec<u8>,
}

impl DeviceStore {
    /// Loads the device file, minting the secret and device id on first run.
    /// A corrupt file is replaced; identity is re-minted rather than
    /// bricking the device.
    pub async fn load_or_init(path: &Path) -> Result<Self, SdkError> {
        let mut file = match fs::read_to_string(path).await {
            Ok(data) => match serde_json::from_str::<DeviceFile>(&data) {
                Ok(file) => file,
                Err(e) => {
                    warn!("device file unreadable ({e}), re-minting identity");
                    DeviceFile::default()
                }
            },
            Err(_) => DeviceFile::default(),
        };

        let mut dirty = false;
        if file.install_secret_b64.is_none() {
            let mut secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            file.install_secret_b64 = Some(STANDARD.encode(secret));
            dirty = true;
        }
        if file.device_id.is_none() {
            let id = Uuid::new_v4().to_string();
            info!("minted device id {id}");
            file.device_id = Some(id);
            dirty = true;
        }

        let install_secret = STANDARD
            .decode(file.install_secret_b64.as_deref().unwrap_or_default())
            .map_err(|_| SdkError::Corrupt("install secret not base64".into()))?;

        let store = Self { path: path.to_path_buf(), file, install_secret };
        if dirty {
            store.persist().await?;
        }
        Ok(store)
    }

    pub fn install_secret(&self) -> &[u8] {
        &self.install_secret
    }

    pub fn device_id(&self) -> &str {
        self.file.device_id.as_deref().unwrap_or_default()
    }

    /// Replaces the device id with a fresh UUIDv4 and returns it.
    pub async fn reset_device_id(&mut self) -> Result<String, SdkError> {
        let id = Uuid::new_v4().to_string();
        info!("device id reset");
        self.file.device_id = Some(id.clone());
        self.persist().await?;
        Ok(id)
    }

    /// Bumps and persists the audit chain generation. Called once per init so
    /// generations stay distinguishable across process restarts even though
    /// each one starts from GENESIS.
    pub async fn next_chain_generation(&mut self) -> Result<u64, SdkError> {
        self.file.chain_generation += 1;
        self.persist().await?;
        Ok(self.file.chain_generation)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), SdkError> {
        let json = serde_json::to_string_pretty(&self.file)?;
        fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");

        let store = DeviceStore::load_or_init(&path).await.unwrap();
        let secret = store.install_secret().to_vec();
        let id = store.device_id().to_string();
        assert_eq!(secret.len(), 32);
        assert!(!id.is_empty());

        let reloaded = DeviceStore::load_or_init(&path).await.unwrap();
        assert_eq!(reloaded.install_secret(), secret.as_slice());
        assert_eq!(reloaded.device_id(), id);
    }

    #[tokio::test]
    async fn reset_replaces_only_the_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");

        let mut store = DeviceStore::load_or_init(&path).await.unwrap();
        let secret = store.install_secret().to_vec();
        let old_id = store.device_id().to_string();

        let new_id = store.reset_device_id().await.unwrap();
        assert_ne!(new_id, old_id);
        assert_eq!(store.install_secret(), secret.as_slice());

        let reloaded = DeviceStore::load_or_init(&path).await.unwrap();
        assert_eq!(reloaded.device_id(), new_id);
    }

    #[tokio::test]
    async fn chain_generation_counts_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");

        let mut store = DeviceStore::load_or_init(&path).await.unwrap();
        assert_eq!(store.next_chain_generation().await.unwrap(), 1);
        assert_eq!(store.next_chain_generation().await.unwrap(), 2);

        let mut reloaded = DeviceStore::load_or_init(&path).await.unwrap();
        assert_eq!(reloaded.next_chain_generation().await.unwrap(), 3);
    }
}
