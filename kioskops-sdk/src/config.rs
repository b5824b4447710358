//! SDK configuration.
//!
//! Deserializable from managed-configuration JSON pushed by an MDM, with
//! defaults chosen for an unattended device: encryption on, sync off until
//! explicitly enabled, bounded queue with drop-oldest overflow.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::SdkError;

const MIN_SYNC_INTERVAL_MINUTES: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Ingest base URL, e.g. "https://ingest.example.com/". May be empty
    /// while the device is provisioned offline; sync stays gated until set.
    #[serde(default)]
    pub base_url: String,
    /// Fleet location identifier, stamped on every batch.
    pub location_id: String,
    #[serde(default)]
    pub kiosk_enabled: bool,
    /// Host scheduler cadence hint. Clamped to at least 5 minutes.
    #[serde(default = "default_sync_interval_minutes")]
    pub sync_interval_minutes: u32,
    /// Root directory for the queue db, audit journals, ring logs and keys
    /// (the app-private storage directory on a device).
    pub data_dir: PathBuf,
    #[serde(default)]
    pub security_policy: SecurityPolicy,
    #[serde(default)]
    pub queue_limits: QueueLimits,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    #[serde(default)]
    pub idempotency_config: IdempotencyConfig,
}

impl Config {
    pub fn new(location_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: String::new(),
            location_id: location_id.into(),
            kiosk_enabled: false,
            sync_interval_minutes: default_sync_interval_minutes(),
            data_dir: data_dir.into(),
            security_policy: SecurityPolicy::default(),
            queue_limits: QueueLimits::default(),
            sync_policy: SyncPolicy::default(),
            retention_policy: RetentionPolicy::default(),
            idempotency_config: IdempotencyConfig::default(),
        }
    }

    /// Normalizes and checks the config at init time. Sync may legitimately
    /// be disabled, but a config that could never work is rejected here
    /// rather than at 3 a.m. on a store floor.
    pub fn validate(mut self) -> Result<Self, SdkError> {
        if self.location_id.trim().is_empty() {
            return Err(SdkError::Config("location_id is required".into()));
        }
        if self.sync_policy.enabled && self.base_url.trim().is_empty() {
            tracing::warn!("sync enabled without base_url; sync_once will no-op until one is set");
        }
        if self.sync_policy.batch_size == 0 {
            return Err(SdkError::Config("sync_policy.batch_size must be >= 1".into()));
        }
        if self.queue_limits.max_active_events <= 0 || self.queue_limits.max_active_bytes <= 0 {
            return Err(SdkError::Config("queue_limits must be positive".into()));
        }
        if self.sync_interval_minutes < MIN_SYNC_INTERVAL_MINUTES {
            tracing::warn!(
                "sync_interval_minutes {} below minimum, clamping to {}",
                self.sync_interval_minutes,
                MIN_SYNC_INTERVAL_MINUTES
            );
            self.sync_interval_minutes = MIN_SYNC_INTERVAL_MINUTES;
        }
        Ok(self)
    }
}

// ── Security ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    /// Encrypt queued payloads at rest (AES-256-GCM). The wire always sees
    /// plaintext JSON; this is storage-local.
    #[serde(default = "default_true")]
    pub encrypt_queue_payloads: bool,
    #[serde(default = "default_max_event_payload_bytes")]
    pub max_event_payload_bytes: usize,
    /// JSON keys (matched case-insensitively, at any nesting depth) that
    /// reject an event at admission unless raw storage is allowed.
    #[serde(default = "default_denylist_json_keys")]
    pub denylist_json_keys: Vec<String>,
    #[serde(default)]
    pub allow_raw_payload_storage: bool,
    /// Sign each audit entry with a per-generation ECDSA-P256 key.
    #[serde(default)]
    pub sign_audit_journal: bool,
    /// Encrypt audit journal lines with the queue cipher.
    #[serde(default)]
    pub encrypt_audit_journal: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            encrypt_queue_payloads: true,
            max_event_payload_bytes: default_max_event_payload_bytes(),
            denylist_json_keys: default_denylist_json_keys(),
            allow_raw_payload_storage: false,
            sign_audit_journal: false,
            encrypt_audit_journal: false,
        }
    }
}

// ── Queue Limits ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverflowStrategy {
    /// Evict the oldest evictable row to make room; fall back to dropping
    /// the new event when nothing is evictable.
    #[default]
    DropOldest,
    /// Count and drop the incoming event.
    DropNewest,
    /// Reject the enqueue with `QueueFull`.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLimits {
    #[serde(default = "default_max_active_events")]
    pub max_active_events: i64,
    #[serde(default = "default_max_active_bytes")]
    pub max_active_bytes: i64,
    #[serde(default)]
    pub overflow_strategy: OverflowStrategy,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_active_events: default_max_active_events(),
            max_active_bytes: default_max_active_bytes(),
            overflow_strategy: OverflowStrategy::DropOldest,
        }
    }
}

// ── Sync ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Master switch. Off by default: devices buffer locally until the fleet
    /// config explicitly turns the uplink on.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_attempts_per_event")]
    pub max_attempts_per_event: i64,
    /// Skip sync while the host reports a metered network.
    #[serde(default)]
    pub require_unmetered_network: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_path: default_endpoint_path(),
            batch_size: default_batch_size(),
            max_attempts_per_event: default_max_attempts_per_event(),
            require_unmetered_network: false,
        }
    }
}

// ── Retention ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default = "default_retain_sent_days")]
    pub retain_sent_days: u32,
    #[serde(default = "default_retain_failed_days")]
    pub retain_failed_days: u32,
    #[serde(default = "default_retain_audit_days")]
    pub retain_audit_days: u32,
    #[serde(default = "default_retain_logs_days")]
    pub retain_logs_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retain_sent_days: default_retain_sent_days(),
            retain_failed_days: default_retain_failed_days(),
            retain_audit_days: default_retain_audit_days(),
            retain_logs_days: default_retain_logs_days(),
        }
    }
}

// ── Idempotency ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyConfig {
    #[serde(default = "default_true")]
    pub deterministic_enabled: bool,
    /// Width of the time bucket folded into deterministic keys. One day by
    /// default; `<= 0` disables bucketing (bucket pinned to 0).
    #[serde(default = "default_bucket_ms")]
    pub bucket_ms: i64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { deterministic_enabled: true, bucket_ms: default_bucket_ms() }
    }
}

// ── serde defaults ────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_sync_interval_minutes() -> u32 {
    MIN_SYNC_INTERVAL_MINUTES
}

fn default_max_event_payload_bytes() -> usize {
    65_536
}

fn default_denylist_json_keys() -> Vec<String> {
    ["password", "secret", "token", "authorization", "email", "phone", "ssn", "pan", "cvv"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_active_events() -> i64 {
    5_000
}

fn default_max_active_bytes() -> i64 {
    50 * 1024 * 1024
}

fn default_endpoint_path() -> String {
    "events/batch".to_string()
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_attempts_per_event() -> i64 {
    12
}

fn default_retain_sent_days() -> u32 {
    7
}

fn default_retain_failed_days() -> u32 {
    14
}

fn default_retain_audit_days() -> u32 {
    30
}

fn default_retain_logs_days() -> u32 {
    7
}

fn default_bucket_ms() -> i64 {
    86_400_000
}
