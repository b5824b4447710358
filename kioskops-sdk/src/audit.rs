//! # audit
//!
//! SHA-256 hash-chained, optionally signed audit journal.
//!
//! Every pipeline transition (enqueue accept/reject, batch outcome,
//! retention pass) is appended as an entry whose hash covers the previous
//! entry's hash. Rewriting any past entry breaks the chain, detectable by
//! `verify`. The chain is tamper-*evident*, not tamper-proof: an attacker
//! with file write access can truncate, but cannot forge a consistent
//! history without the journal showing a fresh generation.
//!
//! The chain restarts from `GENESIS` on every process start; the generation
//! counter (persisted in the device store) keeps restarts distinguishable.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypto::CryptoProvider;
use crate::error::AuditError;

pub const GENESIS: &str = "GENESIS";

// ── Entry ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub ts_ms: i64,
    pub name: String,
    /// Short string fields only (counters and classifications), never
    /// payload content. Sorted by construction (BTreeMap).
    pub fields: BTreeMap<String, String>,
    /// Hash of the previous entry, or `GENESIS` at a chain start.
    pub prev_hash: String,
    /// base64url(SHA-256("ts|name|sortedFields|prev_hash"))
    pub hash: String,
    /// base64(ECDSA-P256-SHA256 over `hash`), when signing is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub chain_generation: u64,
    /// Serialized verifying key, captured once on the first signed entry of
    /// a generation so the journal is self-verifying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_blob: Option<String>,
}

fn chain_hash(ts_ms: i64, name: &str, fields: &BTreeMap<String, String>, prev_hash: &str) -> String {
    let sorted_fields =
        fields.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
    let payload = format!("{ts_ms}|{name}|{sorted_fields}|{prev_hash}");
    URL_SAFE_NO_PAD.encode(Sha256::digest(payload.as_bytes()))
}

// ── Chain state ───────────────────────────────────────────────────────────────

/// Snapshot of the chain head, updated atomically with each insert.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    pub last_hash: String,
    pub last_ts_ms: i64,
    pub chain_generation: u64,
    pub event_count: u64,
}

struct ChainHead {
    last_hash: String,
    last_ts_ms: i64,
    event_count: u64,
    attestation_recorded: bool,
}

/// Outcome of a full-journal verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    Ok { entries_checked: u64 },
    ChainBroken { first_divergent_id: String },
    SignatureInvalid { entry_id: String },
}

// ── Trail ─────────────────────────────────────────────────────────────────────

/// Append-only journal with daily files `audit_YYYY-MM-DD.jsonl[.enc]`.
/// Appends are best-effort: a failure is logged and the originating
/// operation proceeds; a missing entry *is* tamper evidence.
pub struct AuditTrail {
    dir: PathBuf,
    crypto: Arc<RwLock<CryptoProvider>>,
    encrypt_journal: bool,
    signer: Option<SigningKey>,
    clock: Arc<dyn Clock>,
    chain_generation: u64,
    head: Mutex<ChainHead>,
}

impl AuditTrail {
    pub fn new(
        dir: PathBuf,
        chain_generation: u64,
        sign: bool,
        encrypt_journal: bool,
        crypto: Arc<RwLock<CryptoProvider>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // A fresh signing key per generation. The platform original held this
        // in hardware; here the verifying key rides along as the attestation
        // blob so each generation stays self-verifying.
        let signer = sign.then(|| SigningKey::random(&mut OsRng));
        Self {
            dir,
            crypto,
            encrypt_journal,
            signer,
            clock,
            chain_generation,
            head: Mutex::new(ChainHead {
                last_hash: GENESIS.to_string(),
                last_ts_ms: 0,
                event_count: 0,
                attestation_recorded: false,
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn chain_state(&self) -> ChainState {
        let head = self.head.lock().await;
        ChainState {
            last_hash: head.last_hash.clone(),
            last_ts_ms: head.last_ts_ms,
            chain_generation: self.chain_generation,
            event_count: head.event_count,
        }
    }

    /// Appends one entry. This is the single write path; failures never
    /// propagate to the caller.
    pub async fn record(&self, name: &str, fields: BTreeMap<String, String>) {
        if let Err(e) = self.try_record(name, fields).await {
            warn!("audit: append failed: {e}");
        }
    }

    async fn try_record(
        &self,
        name: &str,
        fields: BTreeMap<String, String>,
    ) -> Result<(), AuditError> {
        let ts_ms = self.clock.now_ms();

        // The head lock is held across hash computation and the file append:
        // readers never observe a torn last_hash and entries land in chain
        // order.
        let mut head = self.head.lock().await;
        let prev_hash = head.last_hash.clone();
        let hash = chain_hash(ts_ms, name, &fields, &prev_hash);

        let signature = self
            .signer
            .as_ref()
            .map(|key| {
                let sig: Signature = key.sign(hash.as_bytes());
                STANDARD.encode(sig.to_der().as_bytes())
            });
        let attestation_blob = match (&self.signer, head.attestation_recorded) {
            (Some(key), false) => {
                let point = VerifyingKey::from(key).to_encoded_point(true);
                Some(STANDARD.encode(point.as_bytes()))
            }
            _ => None,
        };

        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            ts_ms,
            name: name.to_string(),
            fields,
            prev_hash,
            hash: hash.clone(),
            signature,
            chain_generation: self.chain_generation,
            attestation_blob,
        };

        let mut line = serde_json::to_string(&entry)?;
        if self.encrypt_journal {
            let crypto = self.crypto.read().await;
            line = URL_SAFE_NO_PAD.encode(crypto.encrypt(line.as_bytes())?);
        }
        line.push('\n');

        let path = self.dir.join(file_name(entry.ts_ms, self.encrypt_journal));
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;

        head.last_hash = hash;
        head.last_ts_ms = ts_ms;
        head.event_count += 1;
        if entry.attestation_blob.is_some() {
            head.attestation_recorded = true;
        }
        Ok(())
    }

    /// Recomputes every hash in the journal directory, in chronological
    /// order, and checks chain linkage (restarting at `GENESIS` on each
    /// generation boundary) plus signatures where present. Reports the first
    /// divergent entry.
    pub async fn verify(&self) -> Result<ChainVerdict, AuditError> {
        let mut checked = 0u64;
        let mut current_gen: Option<u64> = None;
        let mut expected_prev = GENESIS.to_string();
        let mut verifier: Option<VerifyingKey> = None;

        for path in self.journal_files().await? {
            let encrypted = path.extension().is_some_and(|e| e == "enc");
            let data = fs::read_to_string(&path).await?;
            for raw_line in data.lines().filter(|l| !l.trim().is_empty()) {
                let json = if encrypted {
                    let crypto = self.crypto.read().await;
                    let blob = URL_SAFE_NO_PAD
                        .decode(raw_line)
                        .map_err(|_| AuditError::Io(corrupt_line(&path)))?;
                    String::from_utf8(crypto.decrypt(&blob)?)
                        .map_err(|_| AuditError::Io(corrupt_line(&path)))?
                } else {
                    raw_line.to_string()
                };
                let entry: AuditEntry = serde_json::from_str(&json)?;

                if current_gen != Some(entry.chain_generation) {
                    current_gen = Some(entry.chain_generation);
                    expected_prev = GENESIS.to_string();
                    verifier = None;
                }

                if entry.prev_hash != expected_prev {
                    return Ok(ChainVerdict::ChainBroken { first_divergent_id: entry.id });
                }
                let recomputed = chain_hash(entry.ts_ms, &entry.name, &entry.fields, &entry.prev_hash);
                if recomputed != entry.hash {
                    return Ok(ChainVerdict::ChainBroken { first_divergent_id: entry.id });
                }

                if let Some(blob) = &entry.attestation_blob {
                    verifier = STANDARD
                        .decode(blob)
                        .ok()
                        .and_then(|bytes| VerifyingKey::from_sec1_bytes(&bytes).ok());
                    if verifier.is_none() {
                        return Ok(ChainVerdict::SignatureInvalid { entry_id: entry.id });
                    }
                }
                if let (Some(sig_b64), Some(key)) = (&entry.signature, &verifier) {
                    let valid = STANDARD
                        .decode(sig_b64)
                        .ok()
                        .and_then(|der| Signature::from_der(&der).ok())
                        .is_some_and(|sig| key.verify(entry.hash.as_bytes(), &sig).is_ok());
                    if !valid {
                        return Ok(ChainVerdict::SignatureInvalid { entry_id: entry.id });
                    }
                }

                expected_prev = entry.hash.clone();
                checked += 1;
            }
        }
        Ok(ChainVerdict::Ok { entries_checked: checked })
    }

    /// All journal files, oldest first (the date in the name sorts
    /// lexicographically).
    pub async fn journal_files(&self) -> Result<Vec<PathBuf>, AuditError> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(_) => return Ok(files), // nothing recorded yet
        };
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().to_string();
            if name.starts_with("audit_") && (name.ends_with(".jsonl") || name.ends_with(".jsonl.enc"))
            {
                files.push(item.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Removes day-files whose day started at or before the cutoff.
    pub async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u32, AuditError> {
        let mut purged = 0;
        for path in self.journal_files().await? {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            let Some(day_start) = day_start_ms(&name) else { continue };
            if day_start <= cutoff_ms {
                fs::remove_file(&path).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn file_name(ts_ms: i64, encrypted: bool) -> String {
    let day = chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string());
    if encrypted {
        format!("audit_{day}.jsonl.enc")
    } else {
        format!("audit_{day}.jsonl")
    }
}

/// Epoch ms of the day named by `audit_YYYY-MM-DD.jsonl[.enc]`.
fn day_start_ms(file_name: &str) -> Option<i64> {
    let day = file_name.strip_prefix("audit_")?.split(".jsonl").next()?;
    let date = chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

fn corrupt_line(path: &Path) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("undecodable journal line in {}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const DAY_MS: i64 = 86_400_000;
    // 2026-08-01T00:00:00Z
    const T0: i64 = 1_785_542_400_000;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn plain_trail(dir: &Path, clock: Arc<ManualClock>, generation: u64) -> AuditTrail {
        AuditTrail::new(
            dir.to_path_buf(),
            generation,
            false,
            false,
            Arc::new(RwLock::new(CryptoProvider::noop())),
            clock,
        )
    }

    #[tokio::test]
    async fn chain_links_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let trail = plain_trail(dir.path(), clock.clone(), 1);

        trail.record("enqueue_accepted", fields(&[("type", "SCAN"), ("attempts", "0")])).await;
        clock.advance_ms(1_000);
        trail.record("sync_batch_success", fields(&[("sent", "2")])).await;

        let state = trail.chain_state().await;
        assert_eq!(state.event_count, 2);
        assert_ne!(state.last_hash, GENESIS);

        assert_eq!(trail.verify().await.unwrap(), ChainVerdict::Ok { entries_checked: 2 });
        let files = trail.journal_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with("audit_2026-08-01.jsonl"));
    }

    #[tokio::test]
    async fn bit_flip_breaks_the_chain_at_that_entry() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let trail = plain_trail(dir.path(), clock.clone(), 1);
        for i in 0..3 {
            trail.record("tick", fields(&[("n", &i.to_string())])).await;
            clock.advance_ms(10);
        }

        let path = &trail.journal_files().await.unwrap()[0];
        let data = std::fs::read_to_string(path).unwrap();
        let mut lines: Vec<String> = data.lines().map(String::from).collect();
        // corrupt the middle entry's fields
        lines[1] = lines[1].replace("\"n\":\"1\"", "\"n\":\"9\"");
        let tampered_id =
            serde_json::from_str::<AuditEntry>(&lines[1]).unwrap().id;
        std::fs::write(path, lines.join("\n") + "\n").unwrap();

        assert_eq!(
            trail.verify().await.unwrap(),
            ChainVerdict::ChainBroken { first_divergent_id: tampered_id }
        );
    }

    #[tokio::test]
    async fn generation_boundary_restarts_from_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));

        let gen1 = plain_trail(dir.path(), clock.clone(), 1);
        gen1.record("boot", fields(&[])).await;
        gen1.record("tick", fields(&[])).await;

        // process restart: new trail, next generation, same directory
        let gen2 = plain_trail(dir.path(), clock.clone(), 2);
        gen2.record("boot", fields(&[])).await;

        assert_eq!(gen2.verify().await.unwrap(), ChainVerdict::Ok { entries_checked: 3 });
    }

    #[tokio::test]
    async fn signed_journal_verifies_and_rejects_resigning() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let trail = AuditTrail::new(
            dir.path().to_path_buf(),
            1,
            true,
            false,
            Arc::new(RwLock::new(CryptoProvider::noop())),
            clock.clone(),
        );
        trail.record("boot", fields(&[])).await;
        trail.record("tick", fields(&[])).await;
        assert_eq!(trail.verify().await.unwrap(), ChainVerdict::Ok { entries_checked: 2 });

        // attestation rides on the first entry only
        let path = &trail.journal_files().await.unwrap()[0];
        let data = std::fs::read_to_string(path).unwrap();
        let entries: Vec<AuditEntry> =
            data.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert!(entries[0].attestation_blob.is_some());
        assert!(entries[1].attestation_blob.is_none());
        assert!(entries.iter().all(|e| e.signature.is_some()));

        // swapping in a signature from a different key must be caught
        let other = SigningKey::random(&mut OsRng);
        let mut forged = entries[1].clone();
        let sig: Signature = other.sign(forged.hash.as_bytes());
        forged.signature = Some(STANDARD.encode(sig.to_der().as_bytes()));
        let forged_line = serde_json::to_string(&forged).unwrap();
        let mut lines: Vec<String> = data.lines().map(String::from).collect();
        lines[1] = forged_line;
        std::fs::write(path, lines.join("\n") + "\n").unwrap();

        assert_eq!(
            trail.verify().await.unwrap(),
            ChainVerdict::SignatureInvalid { entry_id: forged.id }
        );
    }

    #[tokio::test]
    async fn encrypted_journal_is_opaque_but_verifiable() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let crypto =
            CryptoProvider::load_or_init(&dir.path().join("keys.json"), T0).await.unwrap();
        let trail = AuditTrail::new(
            dir.path().to_path_buf(),
            1,
            false,
            true,
            Arc::new(RwLock::new(crypto)),
            clock,
        );
        trail.record("boot", fields(&[("mode", "kiosk")])).await;

        let files = trail.journal_files().await.unwrap();
        assert!(files[0].to_string_lossy().ends_with(".jsonl.enc"));
        let raw = std::fs::read_to_string(&files[0]).unwrap();
        assert!(!raw.contains("boot"), "journal lines must not be readable at rest");

        assert_eq!(trail.verify().await.unwrap(), ChainVerdict::Ok { entries_checked: 1 });
    }

    #[tokio::test]
    async fn day_files_roll_and_purge_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let trail = plain_trail(dir.path(), clock.clone(), 1);

        trail.record("day1", fields(&[])).await;
        clock.advance_ms(DAY_MS);
        trail.record("day2", fields(&[])).await;
        assert_eq!(trail.journal_files().await.unwrap().len(), 2);

        // cutoff at the start of day 1: only the first file goes
        let purged = trail.purge_older_than(T0).await.unwrap();
        assert_eq!(purged, 1);
        let files = trail.journal_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().contains("2026-08-02"));
    }
}
