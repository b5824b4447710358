//! # kioskops-types
//!
//! Shared wire types for the KioskOps batch ingest protocol.
//!
//! These types are used by:
//! - `kioskops-sdk`: the sync engine serializes claimed events into a
//!   `BatchRequest` and interprets the endpoint's `BatchResponse`
//! - `packages/ingest-simulator`: the development endpoint parses and answers
//!   the same shapes
//!
//! ## Wire Conventions
//!
//! - Field names are camelCase on the wire
//! - The event payload travels as a *string of JSON* (`payloadJson`), not an
//!   embedded object, so the ingest side can archive it byte-for-byte
//! - Per-item acknowledgement: ids missing from both `accepted` and
//!   `rejected` stay queued on the device and are retried

use serde::{Deserialize, Serialize};

// ── Batch Request ─────────────────────────────────────────────────────────────

/// One queued event, decoded back to plaintext JSON for transport.
/// At-rest encryption is storage-local; the wire sees only plaintext
/// (transport security is the HTTP layer's job).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub id: String,
    pub idempotency_key: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload_json: String,
    pub created_ms: i64,
    pub attempts: i64,
}

/// The body of `POST {base_url}/{endpoint_path}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub location_id: String,
    pub sdk_version: String,
    pub items: Vec<BatchItem>,
}

// ── Batch Response ────────────────────────────────────────────────────────────

/// Per-item rejection. The reason string ends up in the event's `last_error`
/// and in the quarantine audit record, so keep it short and content-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedItem {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub accepted: Vec<String>,
    #[serde(default)]
    pub rejected: Vec<RejectedItem>,
}
