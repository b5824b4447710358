//! Idempotency-key derivation.
//!
//! The ingest endpoint rejects duplicates by key, so retries are harmless no
//! matter how often a batch is resent. Keys are deterministic when the host
//! supplies a stable event id: the same (type, stable id, time bucket) always
//! yields the same key on the same install, and nothing about the payload
//! leaks into it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256(install_secret, "type|stableId|bucket"), base64url without
/// padding, always 43 chars. `bucket` floors `now_ms` to the bucket start,
/// or 0 when bucketing is disabled (`bucket_ms <= 0`).
pub fn deterministic_key(
    install_secret: &[u8],
    event_type: &str,
    stable_id: &str,
    now_ms: i64,
    bucket_ms: i64,
) -> String {
    let bucket = if bucket_ms > 0 { (now_ms / bucket_ms) * bucket_ms } else { 0 };
    let mut mac =
        HmacSha256::new_from_slice(install_secret).expect("HMAC-SHA256 accepts any key length");
    mac.update(format!("{event_type}|{stable_id}|{bucket}").as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Key for events without a stable id. 128 random bits, hashed so the stored
/// key has the same 43-char shape as the deterministic variant.
pub fn random_key() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(Sha256::digest(raw))
}
