//! # store
//!
//! Durable event queue over a single SQLite file (WAL mode). The store is
//! the synchronization boundary for every queue invariant: state edges are
//! guarded in SQL, active-footprint limits are enforced inside one exclusive
//! transaction, and terminal rows (`SENT`, `QUARANTINED`) never transition
//! again.
//!
//! ## State machine
//!
//! ```text
//! PENDING ──claim──▶ IN_FLIGHT ──ack──▶ SENT
//!                        │
//!                        ├─transient─▶ PENDING (next_visible_ms = now + backoff)
//!                        ├─permanent─▶ QUARANTINED
//!                        └─release/restart─▶ PENDING (attempts unchanged)
//! ```

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use tracing::{info, warn};

use crate::codec::PayloadEncoding;
use crate::config::{OverflowStrategy, QueueLimits};
use crate::error::SdkError;

// ── Row types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    Pending,
    InFlight,
    Sent,
    FailedTransient,
    Quarantined,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InFlight => "IN_FLIGHT",
            Self::Sent => "SENT",
            Self::FailedTransient => "FAILED_TRANSIENT",
            Self::Quarantined => "QUARANTINED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SdkError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_FLIGHT" => Ok(Self::InFlight),
            "SENT" => Ok(Self::Sent),
            "FAILED_TRANSIENT" => Ok(Self::FailedTransient),
            "QUARANTINED" => Ok(Self::Quarantined),
            other => Err(SdkError::Corrupt(format!("unknown event state `{other}`"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Quarantined)
    }
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: String,
    pub idempotency_key: String,
    pub event_type: String,
    pub payload_blob: Vec<u8>,
    pub encoding: PayloadEncoding,
    pub key_version: Option<u16>,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub state: EventState,
    pub attempts: i64,
    pub next_visible_ms: i64,
    pub last_error: Option<String>,
}

/// Outcome of a bounded insert, decided inside the overflow transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { dropped_oldest: u32 },
    /// The new event was counted and discarded (DROP_NEWEST, or DROP_OLDEST
    /// with nothing evictable).
    DroppedNewest,
    /// BLOCK strategy: the caller must surface `QueueFull`.
    QueueFull,
    /// The unique partial index fired: a live row with this idempotency key
    /// landed between the caller's dedup probe and this insert.
    DuplicateKey,
}

// ── Store ─────────────────────────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_blob BLOB NOT NULL,
    encoding TEXT NOT NULL,
    key_version INTEGER,
    created_ms INTEGER NOT NULL,
    updated_ms INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'PENDING',
    attempts INTEGER NOT NULL DEFAULT 0,
    next_visible_ms INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_claim ON events(state, next_visible_ms);
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_idem_active
    ON events(idempotency_key) WHERE state != 'SENT';
CREATE INDEX IF NOT EXISTS idx_events_evict ON events(state, created_ms);
"#;

const EVENT_COLUMNS: &str = "id, idempotency_key, event_type, payload_blob, encoding, \
     key_version, created_ms, updated_ms, state, attempts, next_visible_ms, last_error";

pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub async fn open(db_path: &Path) -> Result<Self, SdkError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        // Single connection: transactions are exclusive by construction and
        // SQLite never sees concurrent writers.
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Startup recovery: rows stranded `IN_FLIGHT` by a crash mid-send go
    /// back to `PENDING` with attempts unchanged (the claim already counted
    /// the attempt) and immediate visibility.
    pub async fn recover_in_flight(&self, now_ms: i64) -> Result<u64, SdkError> {
        let result = sqlx::query(
            "UPDATE events SET state = 'PENDING', next_visible_ms = ?1, updated_ms = ?1
             WHERE state = 'IN_FLIGHT'",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("recovered {recovered} in-flight event(s) from a previous run");
        }
        Ok(recovered)
    }

    /// Inserts under the active-footprint limits, all inside one exclusive
    /// transaction so concurrent enqueuers cannot both observe room for one.
    pub async fn insert_bounded(
        &self,
        record: &EventRecord,
        limits: &QueueLimits,
    ) -> Result<InsertOutcome, SdkError> {
        let mut tx = self.pool.begin().await?;
        let new_bytes = record.payload_blob.len() as i64;
        let mut dropped_oldest = 0u32;

        loop {
            let active_count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE state != 'SENT'")
                    .fetch_one(&mut *tx)
                    .await?;
            let active_bytes: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(LENGTH(payload_blob)), 0) FROM events WHERE state != 'SENT'",
            )
            .fetch_one(&mut *tx)
            .await?;

            if active_count < limits.max_active_events
                && active_bytes + new_bytes <= limits.max_active_bytes
            {
                break;
            }

            match limits.overflow_strategy {
                OverflowStrategy::DropOldest => {
                    // Quarantined and in-flight rows are not evictable; when
                    // nothing else remains, the *new* event is the casualty.
                    let evicted = sqlx::query(
                        "DELETE FROM events WHERE id IN (
                             SELECT id FROM events
                             WHERE state IN ('PENDING', 'FAILED_TRANSIENT')
                             ORDER BY created_ms ASC, id ASC LIMIT 1)",
                    )
                    .execute(&mut *tx)
                    .await?;
                    if evicted.rows_affected() == 0 {
                        tx.rollback().await?;
                        return Ok(InsertOutcome::DroppedNewest);
                    }
                    dropped_oldest += 1;
                }
                OverflowStrategy::DropNewest => {
                    tx.rollback().await?;
                    return Ok(InsertOutcome::DroppedNewest);
                }
                OverflowStrategy::Block => {
                    tx.rollback().await?;
                    return Ok(InsertOutcome::QueueFull);
                }
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO events (id, idempotency_key, event_type, payload_blob, encoding,
                                 key_version, created_ms, updated_ms, state, attempts,
                                 next_visible_ms, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&record.id)
        .bind(&record.idempotency_key)
        .bind(&record.event_type)
        .bind(&record.payload_blob)
        .bind(record.encoding.as_str())
        .bind(record.key_version.map(|v| v as i64))
        .bind(record.created_ms)
        .bind(record.updated_ms)
        .bind(record.state.as_str())
        .bind(record.attempts)
        .bind(record.next_visible_ms)
        .bind(&record.last_error)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                tx.rollback().await?;
                return Ok(InsertOutcome::DuplicateKey);
            }
            return Err(e.into());
        }
        tx.commit().await?;

        if dropped_oldest > 0 {
            warn!("queue overflow: evicted {dropped_oldest} oldest event(s)");
        }
        Ok(InsertOutcome::Inserted { dropped_oldest })
    }

    /// Claims up to `limit` visible rows in `(created_ms, id)` order and
    /// moves them to `IN_FLIGHT`, counting the attempt at claim time so a
    /// crash mid-send still counts on next boot.
    pub async fn claim_batch(&self, limit: u32, now_ms: i64) -> Result<Vec<EventRecord>, SdkError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE state IN ('PENDING', 'FAILED_TRANSIENT') AND next_visible_ms <= ?1
             ORDER BY created_ms ASC, id ASC LIMIT ?2"
        ))
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut event = row_to_event(row)?;
            sqlx::query(
                "UPDATE events SET state = 'IN_FLIGHT', attempts = attempts + 1, updated_ms = ?1
                 WHERE id = ?2",
            )
            .bind(now_ms)
            .bind(&event.id)
            .execute(&mut *tx)
            .await?;
            event.state = EventState::InFlight;
            event.attempts += 1;
            event.updated_ms = now_ms;
            claimed.push(event);
        }
        tx.commit().await?;
        Ok(claimed)
    }

    /// Acknowledged by the endpoint. Only an `IN_FLIGHT` row can become
    /// `SENT`; anything else is a stale ack and ignored.
    pub async fn mark_sent(&self, ids: &[String], now_ms: i64) -> Result<u64, SdkError> {
        let mut marked = 0;
        for id in ids {
            let result = sqlx::query(
                "UPDATE events SET state = 'SENT', updated_ms = ?1, last_error = NULL
                 WHERE id = ?2 AND state = 'IN_FLIGHT'",
            )
            .bind(now_ms)
            .bind(id)
            .execute(&self.pool)
            .await?;
            marked += result.rows_affected();
        }
        Ok(marked)
    }

    /// Transient failure: back to `PENDING`, invisible until
    /// `next_visible_ms`. The reason is a short classification, never
    /// payload-derived.
    pub async fn mark_transient(
        &self,
        id: &str,
        next_visible_ms: i64,
        reason: &str,
        now_ms: i64,
    ) -> Result<(), SdkError> {
        sqlx::query(
            "UPDATE events SET state = 'PENDING', next_visible_ms = ?1, last_error = ?2,
                               updated_ms = ?3
             WHERE id = ?4 AND state = 'IN_FLIGHT'",
        )
        .bind(next_visible_ms)
        .bind(reason)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal non-success. Guarded so terminal rows never transition again.
    pub async fn mark_quarantined(&self, id: &str, reason: &str, now_ms: i64) -> Result<(), SdkError> {
        sqlx::query(
            "UPDATE events SET state = 'QUARANTINED', last_error = ?1, updated_ms = ?2
             WHERE id = ?3 AND state NOT IN ('SENT', 'QUARANTINED')",
        )
        .bind(reason)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancellation path: claimed rows go back to `PENDING` immediately,
    /// attempts unchanged (cancelled ≠ failed; the claim already counted).
    pub async fn release_claimed(&self, ids: &[String], now_ms: i64) -> Result<u64, SdkError> {
        let mut released = 0;
        for id in ids {
            let result = sqlx::query(
                "UPDATE events SET state = 'PENDING', next_visible_ms = ?1, updated_ms = ?1
                 WHERE id = ?2 AND state = 'IN_FLIGHT'",
            )
            .bind(now_ms)
            .bind(id)
            .execute(&self.pool)
            .await?;
            released += result.rows_affected();
        }
        Ok(released)
    }

    pub async fn count_active(&self) -> Result<i64, SdkError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE state != 'SENT'")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn active_bytes(&self) -> Result<i64, SdkError> {
        Ok(sqlx::query_scalar(
            "SELECT COALESCE(SUM(LENGTH(payload_blob)), 0) FROM events WHERE state != 'SENT'",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    /// Dedup probe: a live (non-SENT) row with this idempotency key.
    pub async fn find_active_by_idem(&self, key: &str) -> Result<Option<EventRecord>, SdkError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE idempotency_key = ?1 AND state != 'SENT' LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    pub async fn get(&self, id: &str) -> Result<Option<EventRecord>, SdkError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    pub async fn purge_sent_before(&self, cutoff_ms: i64) -> Result<u64, SdkError> {
        let result = sqlx::query("DELETE FROM events WHERE state = 'SENT' AND updated_ms < ?1")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_quarantined_before(&self, cutoff_ms: i64) -> Result<u64, SdkError> {
        let result =
            sqlx::query("DELETE FROM events WHERE state = 'QUARANTINED' AND updated_ms < ?1")
                .bind(cutoff_ms)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation)
}

fn row_to_event(row: &SqliteRow) -> Result<EventRecord, SdkError> {
    let encoding_str: String = row.try_get("encoding")?;
    let state_str: String = row.try_get("state")?;
    Ok(EventRecord {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        event_type: row.try_get("event_type")?,
        payload_blob: row.try_get("payload_blob")?,
        encoding: PayloadEncoding::parse(&encoding_str)?,
        key_version: row.try_get::<Option<i64>, _>("key_version")?.map(|v| v as u16),
        created_ms: row.try_get("created_ms")?,
        updated_ms: row.try_get("updated_ms")?,
        state: EventState::parse(&state_str)?,
        attempts: row.try_get("attempts")?,
        next_visible_ms: row.try_get("next_visible_ms")?,
        last_error: row.try_get("last_error")?,
    })
}
