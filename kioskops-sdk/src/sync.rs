//! # sync
//!
//! Batched uplink. One pass: claim a batch (short transaction), decode the
//! payloads back to plaintext JSON, hand them to the transport *outside any
//! transaction*, then apply per-item outcomes (second short transaction) and
//! schedule retries. Only one pass runs per process at a time; concurrent
//! callers coalesce to zeros rather than double-claim.

use kioskops_types::{BatchItem, BatchRequest};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::audit::AuditTrail;
use crate::backoff;
use crate::clock::Clock;
use crate::codec;
use crate::config::SyncPolicy;
use crate::crypto::CryptoProvider;
use crate::error::SdkError;
use crate::store::{EventRecord, QueueStore};
use crate::transport::{Transport, TransportResult};

const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Counters for one sync pass. All zeros when the gate is closed or another
/// pass is already running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOnceResult {
    pub attempted: u32,
    pub sent: u32,
    pub permanent_failed: u32,
    pub transient_failed: u32,
    pub rejected: u32,
}

pub struct SyncEngine {
    store: Arc<QueueStore>,
    crypto: Arc<RwLock<CryptoProvider>>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
    policy: SyncPolicy,
    base_url: String,
    location_id: String,
    running: Mutex<()>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<QueueStore>,
        crypto: Arc<RwLock<CryptoProvider>>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
        policy: SyncPolicy,
        base_url: String,
        location_id: String,
    ) -> Self {
        Self {
            store,
            crypto,
            audit,
            clock,
            policy,
            base_url,
            location_id,
            running: Mutex::new(()),
        }
    }

    /// One claim → send → apply pass. `network_metered` comes from the host
    /// (device posture is an external collaborator).
    pub async fn sync_once(
        &self,
        transport: &dyn Transport,
        network_metered: bool,
    ) -> Result<SyncOnceResult, SdkError> {
        let mut result = SyncOnceResult::default();

        // Gate: uplink disabled, unprovisioned, or wrong network class.
        if !self.policy.enabled || self.base_url.trim().is_empty() {
            return Ok(result);
        }
        if self.policy.require_unmetered_network && network_metered {
            debug!("sync skipped: network is metered");
            return Ok(result);
        }

        // Per-process exclusivity: a second caller coalesces to zeros
        // instead of double-claiming.
        let Ok(_running) = self.running.try_lock() else {
            debug!("sync already running, coalescing");
            return Ok(result);
        };

        let now_ms = self.clock.now_ms();
        let claimed = self.store.claim_batch(self.policy.batch_size, now_ms).await?;
        if claimed.is_empty() {
            return Ok(result);
        }
        result.attempted = claimed.len() as u32;

        // If this future is dropped mid-send, the guard puts still-in-flight
        // rows back to PENDING with attempts unchanged (cancelled != failed).
        let mut guard = ClaimGuard::new(
            self.store.clone(),
            self.clock.clone(),
            claimed.iter().map(|e| e.id.clone()).collect(),
        );

        // Decode to plaintext for the wire. A row that no longer decodes,
        // including one whose key_version column disagrees with its
        // ciphertext header, can never be sent and is quarantined on the
        // spot.
        let mut items = Vec::with_capacity(claimed.len());
        let mut sendable = Vec::with_capacity(claimed.len());
        {
            let crypto = self.crypto.read().await;
            for event in &claimed {
                match codec::decode(&event.payload_blob, event.encoding, event.key_version, &crypto)
                {
                    Ok(payload_json) => {
                        items.push(BatchItem {
                            id: event.id.clone(),
                            idempotency_key: event.idempotency_key.clone(),
                            event_type: event.event_type.clone(),
                            payload_json,
                            created_ms: event.created_ms,
                            attempts: event.attempts,
                        });
                        sendable.push(event.clone());
                    }
                    Err(e) => {
                        warn!("event {} undecodable ({e}), quarantining", event.id);
                        self.quarantine(&event.id, "payload_decode", &mut result).await;
                    }
                }
            }
        }
        if items.is_empty() {
            guard.disarm();
            return Ok(result);
        }

        let request = BatchRequest {
            location_id: self.location_id.clone(),
            sdk_version: SDK_VERSION.to_string(),
            items,
        };

        // The long network call happens with no store transaction open.
        let outcome = transport.send_batch(&request).await;
        let applied_ms = self.clock.now_ms();

        match outcome {
            TransportResult::Success { accepted_ids, rejected, http_status } => {
                let accepted: HashSet<&str> = accepted_ids.iter().map(String::as_str).collect();
                let rejected_ids: HashSet<&str> =
                    rejected.iter().map(|r| r.id.as_str()).collect();

                let to_send: Vec<String> = sendable
                    .iter()
                    .filter(|e| accepted.contains(e.id.as_str()))
                    .map(|e| e.id.clone())
                    .collect();
                match self.store.mark_sent(&to_send, applied_ms).await {
                    Ok(marked) => result.sent = marked as u32,
                    Err(e) => warn!("mark_sent failed: {e}"),
                }

                for item in &rejected {
                    if sendable.iter().any(|e| e.id == item.id) {
                        self.store
                            .mark_quarantined(&item.id, &item.reason, applied_ms)
                            .await
                            .unwrap_or_else(|e| warn!("quarantine failed: {e}"));
                        result.rejected += 1;
                    }
                }

                // ids the endpoint never mentioned stay retryable
                for event in sendable
                    .iter()
                    .filter(|e| !accepted.contains(e.id.as_str()) && !rejected_ids.contains(e.id.as_str()))
                {
                    self.reschedule(event, "unacknowledged", applied_ms, &mut result).await;
                }

                self.audit_batch("sync_batch_success", &result, Some(http_status)).await;
            }
            TransportResult::TransientFailure { http_status, cause } => {
                let reason = cause
                    .or_else(|| http_status.map(|s| format!("http {s}")))
                    .unwrap_or_else(|| "network".to_string());
                for event in &sendable {
                    self.reschedule(event, &reason, applied_ms, &mut result).await;
                }
                self.audit_batch("sync_batch_transient", &result, http_status).await;
            }
            TransportResult::PermanentFailure { http_status, message } => {
                for event in &sendable {
                    self.quarantine(&event.id, &message, &mut result).await;
                }
                self.audit_batch("sync_batch_permanent", &result, http_status).await;
            }
        }

        guard.disarm();
        Ok(result)
    }

    /// Transient outcome for one event: back off, or quarantine once the
    /// retry budget is spent. Attempt `n` waits the schedule's `n-1`th step,
    /// so a first failure retries after the base delay.
    async fn reschedule(&self, event: &EventRecord, reason: &str, now_ms: i64, result: &mut SyncOnceResult) {
        if event.attempts >= self.policy.max_attempts_per_event {
            self.quarantine(&event.id, "retry_budget_exhausted", result).await;
            return;
        }
        let next_visible_ms = now_ms + backoff::next_delay_ms(event.attempts.saturating_sub(1));
        match self.store.mark_transient(&event.id, next_visible_ms, reason, now_ms).await {
            Ok(()) => result.transient_failed += 1,
            Err(e) => warn!("mark_transient failed for {}: {e}", event.id),
        }
    }

    async fn quarantine(&self, id: &str, reason: &str, result: &mut SyncOnceResult) {
        let now_ms = self.clock.now_ms();
        match self.store.mark_quarantined(id, reason, now_ms).await {
            Ok(()) => result.permanent_failed += 1,
            Err(e) => warn!("quarantine failed for {id}: {e}"),
        }
    }

    /// Counters only, never payloads or ids.
    async fn audit_batch(&self, name: &str, result: &SyncOnceResult, http_status: Option<u16>) {
        let mut fields = BTreeMap::new();
        fields.insert("attempted".to_string(), result.attempted.to_string());
        fields.insert("sent".to_string(), result.sent.to_string());
        fields.insert("rejected".to_string(), result.rejected.to_string());
        fields.insert("transient".to_string(), result.transient_failed.to_string());
        fields.insert("permanent".to_string(), result.permanent_failed.to_string());
        if let Some(status) = http_status {
            fields.insert("http_status".to_string(), status.to_string());
        }
        self.audit.record(name, fields).await;
    }
}

/// Returns claimed rows to `PENDING` if the sync future dies before the
/// outcome is applied. Rows already marked by the apply step are untouched
/// (the release only matches rows still `IN_FLIGHT`).
struct ClaimGuard {
    store: Arc<QueueStore>,
    clock: Arc<dyn Clock>,
    ids: Vec<String>,
    armed: bool,
}

impl ClaimGuard {
    fn new(store: Arc<QueueStore>, clock: Arc<dyn Clock>, ids: Vec<String>) -> Self {
        Self { store, clock, ids, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed || self.ids.is_empty() {
            return;
        }
        let store = self.store.clone();
        let ids = std::mem::take(&mut self.ids);
        let now_ms = self.clock.now_ms();
        // Runtime gone (process exit): startup recovery handles the rows.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match store.release_claimed(&ids, now_ms).await {
                    Ok(released) if released > 0 => {
                        warn!("sync cancelled: released {released} claimed event(s)")
                    }
                    Ok(_) => {}
                    Err(e) => warn!("failed to release claimed events: {e}"),
                }
            });
        }
    }
}
