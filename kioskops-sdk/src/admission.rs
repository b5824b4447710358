//! # admission
//!
//! Write-path gatekeeper. Every host `enqueue` passes through, in order:
//! size guard, denylist guard, idempotency derivation, dedup probe, codec +
//! crypto, and bounded insert. Each step is a point of rejection, every
//! outcome is audited, and payload content never reaches the audit fields.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::clock::Clock;
use crate::codec;
use crate::config::{IdempotencyConfig, QueueLimits, SecurityPolicy};
use crate::crypto::CryptoProvider;
use crate::error::SdkError;
use crate::idempotency;
use crate::store::{EventRecord, EventState, InsertOutcome, QueueStore};

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    PayloadTooLarge,
    DenylistedKey,
    QueueFull,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PayloadTooLarge => "payload_too_large",
            Self::DenylistedKey => "denylisted_key",
            Self::QueueFull => "queue_full",
        }
    }
}

/// Synchronous answer to every enqueue. `Accepted` covers the degenerate
/// cases too: a dedup hit (`duplicate`) and a drop-newest overflow
/// (`dropped_newest`, counted but not inserted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Accepted {
        /// Row id: the existing row's on a dedup hit, `None` when the event
        /// was counted and dropped.
        id: Option<String>,
        duplicate: bool,
        dropped_oldest: u32,
        dropped_newest: bool,
    },
    Rejected { reason: RejectReason },
}

impl EnqueueResult {
    fn inserted(id: String, dropped_oldest: u32) -> Self {
        Self::Accepted { id: Some(id), duplicate: false, dropped_oldest, dropped_newest: false }
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

pub struct AdmissionController {
    store: Arc<QueueStore>,
    crypto: Arc<RwLock<CryptoProvider>>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
    security: SecurityPolicy,
    limits: QueueLimits,
    idempotency: IdempotencyConfig,
    install_secret: Vec<u8>,
    /// Lowercased once; payload keys are matched case-insensitively.
    denylist: Vec<String>,
}

impl AdmissionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<QueueStore>,
        crypto: Arc<RwLock<CryptoProvider>>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
        security: SecurityPolicy,
        limits: QueueLimits,
        idempotency: IdempotencyConfig,
        install_secret: Vec<u8>,
    ) -> Self {
        let denylist = security.denylist_json_keys.iter().map(|k| k.to_lowercase()).collect();
        Self { store, crypto, audit, clock, security, limits, idempotency, install_secret, denylist }
    }

    pub async fn enqueue(
        &self,
        event_type: &str,
        json: &str,
        stable_event_id: Option<&str>,
    ) -> Result<EnqueueResult, SdkError> {
        let now_ms = self.clock.now_ms();

        // 1. Size guard
        if json.len() > self.security.max_event_payload_bytes {
            self.audit_rejected(event_type, RejectReason::PayloadTooLarge).await;
            return Ok(EnqueueResult::Rejected { reason: RejectReason::PayloadTooLarge });
        }

        // 2. Denylist guard: keys at any depth, arrays of objects included.
        //    An unparseable payload has no keys to scan and passes as opaque
        //    text.
        if !self.security.allow_raw_payload_storage {
            if let Ok(value) = serde_json::from_str::<Value>(json) {
                if let Some(hit) = self.scan_denylisted(&value) {
                    warn!("enqueue rejected: payload carries denylisted key `{hit}`");
                    self.audit_rejected(event_type, RejectReason::DenylistedKey).await;
                    return Ok(EnqueueResult::Rejected { reason: RejectReason::DenylistedKey });
                }
            }
        }

        // 3. Idempotency derivation
        let idempotency_key = match stable_event_id {
            Some(stable_id) if self.idempotency.deterministic_enabled => {
                idempotency::deterministic_key(
                    &self.install_secret,
                    event_type,
                    stable_id,
                    now_ms,
                    self.idempotency.bucket_ms,
                )
            }
            _ => idempotency::random_key(),
        };

        // 4. Dedup probe: a live row with this key wins silently.
        let probe = self.fallible(self.store.find_active_by_idem(&idempotency_key).await, event_type).await?;
        if let Some(existing) = probe {
            debug!("enqueue deduped against live event {}", existing.id);
            self.audit_accepted(event_type, &[("duplicate", "true".to_string())]).await;
            return Ok(EnqueueResult::Accepted {
                id: Some(existing.id),
                duplicate: true,
                dropped_oldest: 0,
                dropped_newest: false,
            });
        }

        // 5. Codec + crypto
        let (payload_blob, encoding, key_version) = {
            let crypto = self.crypto.read().await;
            codec::encode_json(json, self.security.encrypt_queue_payloads, &crypto)?
        };

        // 6. Bounded insert (overflow enforcement inside one transaction)
        let record = EventRecord {
            id: Uuid::new_v4().to_string(),
            idempotency_key,
            event_type: event_type.to_string(),
            payload_blob,
            encoding,
            key_version,
            created_ms: now_ms,
            updated_ms: now_ms,
            state: EventState::Pending,
            attempts: 0,
            next_visible_ms: 0,
            last_error: None,
        };
        let outcome =
            self.fallible(self.store.insert_bounded(&record, &self.limits).await, event_type).await?;

        // 7. Audit the accepted shapes
        match outcome {
            InsertOutcome::Inserted { dropped_oldest } => {
                let mut extra = Vec::new();
                if dropped_oldest > 0 {
                    extra.push(("dropped_oldest", dropped_oldest.to_string()));
                }
                self.audit_accepted(event_type, &extra).await;
                Ok(EnqueueResult::inserted(record.id, dropped_oldest))
            }
            InsertOutcome::DroppedNewest => {
                self.audit_accepted(event_type, &[("dropped_newest", "true".to_string())]).await;
                Ok(EnqueueResult::Accepted {
                    id: None,
                    duplicate: false,
                    dropped_oldest: 0,
                    dropped_newest: true,
                })
            }
            InsertOutcome::QueueFull => {
                self.audit_rejected(event_type, RejectReason::QueueFull).await;
                Ok(EnqueueResult::Rejected { reason: RejectReason::QueueFull })
            }
            // a concurrent enqueue with the same key won the insert between
            // the probe and here; same silent dedup as the probe path
            InsertOutcome::DuplicateKey => {
                let existing = self.store.find_active_by_idem(&record.idempotency_key).await?;
                self.audit_accepted(event_type, &[("duplicate", "true".to_string())]).await;
                Ok(EnqueueResult::Accepted {
                    id: existing.map(|e| e.id),
                    duplicate: true,
                    dropped_oldest: 0,
                    dropped_newest: false,
                })
            }
        }
    }

    /// Depth-first key scan. Returns the matched *config* entry, never the
    /// payload's own spelling, so the caller can log it safely.
    fn scan_denylisted(&self, value: &Value) -> Option<String> {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let lowered = key.to_lowercase();
                    if let Some(hit) = self.denylist.iter().find(|d| **d == lowered) {
                        return Some(hit.clone());
                    }
                    if let Some(hit) = self.scan_denylisted(child) {
                        return Some(hit);
                    }
                }
                None
            }
            Value::Array(items) => items.iter().find_map(|item| self.scan_denylisted(item)),
            _ => None,
        }
    }

    async fn audit_accepted(&self, event_type: &str, extra: &[(&str, String)]) {
        let mut fields = BTreeMap::new();
        fields.insert("type".to_string(), event_type.to_string());
        fields.insert("attempts".to_string(), "0".to_string());
        for (key, value) in extra {
            fields.insert((*key).to_string(), value.clone());
        }
        self.audit.record("enqueue_accepted", fields).await;
    }

    async fn audit_rejected(&self, event_type: &str, reason: RejectReason) {
        let mut fields = BTreeMap::new();
        fields.insert("type".to_string(), event_type.to_string());
        fields.insert("reason".to_string(), reason.as_str().to_string());
        self.audit.record("enqueue_rejected", fields).await;
    }

    /// Write-path storage failures are audited (`reason: "io"`) before they
    /// propagate to the caller.
    async fn fallible<T>(&self, result: Result<T, SdkError>, event_type: &str) -> Result<T, SdkError> {
        if result.is_err() {
            let mut fields = BTreeMap::new();
            fields.insert("type".to_string(), event_type.to_string());
            fields.insert("reason".to_string(), "io".to_string());
            self.audit.record("enqueue_rejected", fields).await;
        }
        result
    }
}
