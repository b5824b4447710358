//! # kioskops-sdk
//!
//! Embeddable operational-event pipeline for unattended kiosk-style devices.
//!
//! Hosts enqueue small JSON events (scans, heartbeats, errors); the SDK
//! persists them in a durable local queue with compliance guardrails at
//! write time, and, once sync is enabled, batches them to an ingest
//! endpoint with deterministic idempotency keys and exponential backoff.
//! Every state transition lands in a SHA-256 hash-chained, optionally
//! signed audit journal.
//!
//! ## Layout on device (under `data_dir`)
//!
//! - `kioskops_queue.db`: event queue (SQLite, WAL)
//! - `kioskops_audit/`: daily journal files `audit_YYYY-MM-DD.jsonl[.enc]`
//! - `kioskops_logs/`: daily ring-log files
//! - `kioskops_device.json`: install secret, device id, chain generation
//! - `kioskops_keys.json`: versioned AES-256-GCM key material
//!
//! The host owns scheduling (call [`KioskOps::sync_once`] on its own cadence)
//! and may plug in its own [`Transport`] and [`AuthProvider`].

pub mod admission;
pub mod audit;
pub mod backoff;
pub mod clock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod idempotency;
pub mod retention;
pub mod ringlog;
pub mod store;
pub mod sync;
pub mod transport;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::info;

pub use admission::{AdmissionController, EnqueueResult, RejectReason};
pub use audit::{AuditEntry, AuditTrail, ChainState, ChainVerdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::PayloadEncoding;
pub use config::{
    Config, IdempotencyConfig, OverflowStrategy, QueueLimits, RetentionPolicy, SecurityPolicy,
    SyncPolicy,
};
pub use crypto::{CryptoProvider, KeyMetadata};
pub use error::{AuditError, CryptoError, SdkError};
pub use retention::{RetentionJanitor, RetentionReport};
pub use store::{EventRecord, EventState, QueueStore};
pub use sync::{SyncEngine, SyncOnceResult};
pub use transport::{AuthProvider, HttpTransport, NoAuth, Transport, TransportResult};

use device::DeviceStore;
use ringlog::RingLog;

const QUEUE_DB_FILE: &str = "kioskops_queue.db";
const AUDIT_DIR: &str = "kioskops_audit";
const LOGS_DIR: &str = "kioskops_logs";
const DEVICE_FILE: &str = "kioskops_device.json";
const KEYS_FILE: &str = "kioskops_keys.json";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide SDK root. Construct one per process with [`KioskOps::init`]
/// and share it by reference; all entry points take `&self`.
pub struct KioskOps {
    config: Config,
    clock: Arc<dyn Clock>,
    device: RwLock<DeviceStore>,
    store: Arc<QueueStore>,
    crypto: Arc<RwLock<CryptoProvider>>,
    audit: Arc<AuditTrail>,
    ringlog: Arc<RingLog>,
    admission: AdmissionController,
    sync: SyncEngine,
    janitor: RetentionJanitor,
    transport: Option<Arc<dyn Transport>>,
    network_metered: AtomicBool,
}

impl KioskOps {
    /// Initializes the SDK with the system clock and the built-in HTTP
    /// transport (anonymous requests).
    pub async fn init(config: Config) -> Result<Self, SdkError> {
        Self::init_with(config, Arc::new(SystemClock), None, Arc::new(NoAuth)).await
    }

    /// Full-control constructor: the host supplies the clock, a transport
    /// (`None` builds the HTTP one when a base URL is configured) and the
    /// auth header hook.
    pub async fn init_with(
        config: Config,
        clock: Arc<dyn Clock>,
        transport: Option<Arc<dyn Transport>>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, SdkError> {
        let config = config.validate()?;
        let now_ms = clock.now_ms();

        let audit_dir = config.data_dir.join(AUDIT_DIR);
        let logs_dir = config.data_dir.join(LOGS_DIR);
        fs::create_dir_all(&audit_dir).await?;
        fs::create_dir_all(&logs_dir).await?;

        let mut device = DeviceStore::load_or_init(&config.data_dir.join(DEVICE_FILE)).await?;

        let needs_cipher = config.security_policy.encrypt_queue_payloads
            || config.security_policy.encrypt_audit_journal;
        let crypto = if needs_cipher {
            CryptoProvider::load_or_init(&config.data_dir.join(KEYS_FILE), now_ms).await?
        } else {
            CryptoProvider::noop()
        };
        let crypto = Arc::new(RwLock::new(crypto));

        let store = Arc::new(QueueStore::open(&config.data_dir.join(QUEUE_DB_FILE)).await?);
        let recovered = store.recover_in_flight(now_ms).await?;

        let chain_generation = device.next_chain_generation().await?;
        let audit = Arc::new(AuditTrail::new(
            audit_dir,
            chain_generation,
            config.security_policy.sign_audit_journal,
            config.security_policy.encrypt_audit_journal,
            crypto.clone(),
            clock.clone(),
        ));
        let ringlog = Arc::new(RingLog::new(logs_dir, clock.clone()));

        let mut init_fields = BTreeMap::new();
        init_fields.insert("recovered_in_flight".to_string(), recovered.to_string());
        init_fields.insert("kiosk_enabled".to_string(), config.kiosk_enabled.to_string());
        audit.record("sdk_init", init_fields).await;
        ringlog
            .append(&format!(
                "init: device {} chain generation {chain_generation}, recovered {recovered} in-flight",
                device.device_id()
            ))
            .await;

        let admission = AdmissionController::new(
            store.clone(),
            crypto.clone(),
            audit.clone(),
            clock.clone(),
            config.security_policy.clone(),
            config.queue_limits.clone(),
            config.idempotency_config.clone(),
            device.install_secret().to_vec(),
        );
        let sync = SyncEngine::new(
            store.clone(),
            crypto.clone(),
            audit.clone(),
            clock.clone(),
            config.sync_policy.clone(),
            config.base_url.clone(),
            config.location_id.clone(),
        );
        let janitor = RetentionJanitor::new(store.clone(), audit.clone(), ringlog.clone(), clock.clone());

        let transport = match transport {
            Some(transport) => Some(transport),
            None if !config.base_url.trim().is_empty() => Some(Arc::new(HttpTransport::new(
                &config.base_url,
                &config.sync_policy.endpoint_path,
                DEFAULT_REQUEST_TIMEOUT,
                auth,
            )?) as Arc<dyn Transport>),
            None => None,
        };

        info!(
            "kioskops sdk v{} ready (location {}, sync {})",
            env!("CARGO_PKG_VERSION"),
            config.location_id,
            if config.sync_policy.enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            config,
            clock,
            device: RwLock::new(device),
            store,
            crypto,
            audit,
            ringlog,
            admission,
            sync,
            janitor,
            transport,
            network_metered: AtomicBool::new(false),
        })
    }

    /// Admits one event into the durable queue. Synchronous answer, never a
    /// network touch.
    pub async fn enqueue(
        &self,
        event_type: &str,
        json_payload: &str,
        stable_event_id: Option<&str>,
    ) -> Result<EnqueueResult, SdkError> {
        self.admission.enqueue(event_type, json_payload, stable_event_id).await
    }

    /// One claim → send → apply pass, followed by a retention pass. Gated
    /// off (all-zero result) until sync is enabled and a base URL is set.
    pub async fn sync_once(&self) -> Result<SyncOnceResult, SdkError> {
        let result = match &self.transport {
            Some(transport) => {
                self.sync
                    .sync_once(transport.as_ref(), self.network_metered.load(Ordering::Relaxed))
                    .await?
            }
            None => SyncOnceResult::default(),
        };
        let report = self.janitor.run(&self.config.retention_policy).await?;
        if result.attempted > 0 || !report.is_empty() {
            self.ringlog
                .append(&format!(
                    "sync pass: attempted={} sent={} transient={} permanent={} rejected={}",
                    result.attempted,
                    result.sent,
                    result.transient_failed,
                    result.permanent_failed,
                    result.rejected
                ))
                .await;
        }
        Ok(result)
    }

    /// Events in any state other than `SENT`.
    pub async fn count_active(&self) -> Result<i64, SdkError> {
        self.store.count_active().await
    }

    /// Paths a diagnostics bundle would collect: queue db, audit journals,
    /// ring logs and the device file. Key material stays on the device.
    pub async fn export_local_files(&self) -> Result<Vec<PathBuf>, SdkError> {
        let mut files = Vec::new();
        let db = self.config.data_dir.join(QUEUE_DB_FILE);
        if db.exists() {
            files.push(db);
        }
        files.extend(self.audit.journal_files().await?);
        files.extend(self.ringlog.files().await?);
        let device = self.device.read().await;
        if device.path().exists() {
            files.push(device.path().to_path_buf());
        }
        Ok(files)
    }

    /// Host-facing audit hook for events outside the pipeline (door opened,
    /// maintenance mode, …).
    pub async fn record_audit(&self, name: &str, fields: BTreeMap<String, String>) {
        self.audit.record(name, fields).await;
    }

    /// Replaces the device id and returns the new one. The install secret,
    /// and with it idempotency-key derivation, is untouched.
    pub async fn reset_device_id(&self) -> Result<String, SdkError> {
        self.device.write().await.reset_device_id().await
    }

    /// Retention pass on demand (also runs after every sync).
    pub async fn run_retention(&self) -> Result<RetentionReport, SdkError> {
        self.janitor.run(&self.config.retention_policy).await
    }

    /// Full-journal chain verification.
    pub async fn verify_audit_chain(&self) -> Result<ChainVerdict, SdkError> {
        Ok(self.audit.verify().await?)
    }

    /// Snapshot of the audit chain head.
    pub async fn audit_chain_state(&self) -> ChainState {
        self.audit.chain_state().await
    }

    /// Mints the next queue-encryption key version. Old versions stay
    /// resolvable; rotation policy is the fleet config's call.
    pub async fn rotate_encryption_key(&self) -> Result<u16, SdkError> {
        self.crypto.write().await.rotate_key(self.clock.now_ms()).await
    }

    /// Host hint for `require_unmetered_network` gating.
    pub fn set_network_metered(&self, metered: bool) {
        self.network_metered.store(metered, Ordering::Relaxed);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
