//! End-to-end pipeline scenarios: enqueue through sync against a scripted
//! transport, with a manual clock and a scratch data directory. Queue rows
//! are inspected through a second store handle on the same SQLite file, and
//! audit entries by reading the day files back.

use async_trait::async_trait;
use kioskops_types::{BatchRequest, RejectedItem};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use kioskops_sdk::{
    AuditEntry, ChainVerdict, Clock, Config, EnqueueResult, EventState, ManualClock, NoAuth,
    QueueStore, RejectReason, Transport, TransportResult,
};

const T0: i64 = 1_785_542_400_000; // 2026-08-01T00:00:00Z

// ── Scripted transport ────────────────────────────────────────────────────────

enum Step {
    AcceptAll,
    Transient(u16),
    Permanent(u16),
    /// Reject items at these positions (by batch order) with a reason;
    /// accept the rest.
    Reject(Vec<(usize, &'static str)>),
}

#[derive(Default)]
struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<BatchRequest>>,
}

impl ScriptedTransport {
    fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    fn requests(&self) -> Vec<BatchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_batch(&self, request: &BatchRequest) -> TransportResult {
        self.requests.lock().unwrap().push(request.clone());
        match self.steps.lock().unwrap().pop_front().unwrap_or(Step::AcceptAll) {
            Step::AcceptAll => TransportResult::Success {
                accepted_ids: request.items.iter().map(|i| i.id.clone()).collect(),
                rejected: Vec::new(),
                http_status: 200,
            },
            Step::Transient(status) => TransportResult::TransientFailure {
                http_status: Some(status),
                cause: Some(format!("http {status}")),
            },
            Step::Permanent(status) => TransportResult::PermanentFailure {
                http_status: Some(status),
                message: format!("http {status}"),
            },
            Step::Reject(rejects) => {
                let mut accepted_ids = Vec::new();
                let mut rejected = Vec::new();
                for (position, item) in request.items.iter().enumerate() {
                    match rejects.iter().find(|(p, _)| *p == position) {
                        Some((_, reason)) => rejected
                            .push(RejectedItem { id: item.id.clone(), reason: reason.to_string() }),
                        None => accepted_ids.push(item.id.clone()),
                    }
                }
                TransportResult::Success { accepted_ids, rejected, http_status: 200 }
            }
        }
    }
}

// ── Rig ───────────────────────────────────────────────────────────────────────

struct Rig {
    sdk: kioskops_sdk::KioskOps,
    clock: Arc<ManualClock>,
    transport: Arc<ScriptedTransport>,
    dir: tempfile::TempDir,
}

impl Rig {
    async fn store(&self) -> QueueStore {
        QueueStore::open(&self.dir.path().join("kioskops_queue.db")).await.unwrap()
    }

    fn audit_entries(&self) -> Vec<AuditEntry> {
        audit_entries(self.dir.path())
    }
}

async fn rig(configure: impl FnOnce(&mut Config)) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new("loc-e2e", dir.path());
    config.base_url = "https://ingest.test/".into();
    config.sync_policy.enabled = true;
    configure(&mut config);

    let clock = Arc::new(ManualClock::new(T0));
    let transport = Arc::new(ScriptedTransport::default());
    let sdk = kioskops_sdk::KioskOps::init_with(
        config,
        clock.clone(),
        Some(transport.clone() as Arc<dyn Transport>),
        Arc::new(NoAuth),
    )
    .await
    .unwrap();
    Rig { sdk, clock, transport, dir }
}

fn audit_entries(dir: &Path) -> Vec<AuditEntry> {
    let mut paths: Vec<_> = std::fs::read_dir(dir.join("kioskops_audit"))
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    paths.sort();
    paths
        .iter()
        .flat_map(|p| {
            std::fs::read_to_string(p)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str::<AuditEntry>(l).unwrap())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn accepted_id(result: EnqueueResult) -> String {
    match result {
        EnqueueResult::Accepted { id: Some(id), .. } => id,
        other => panic!("expected an inserted event, got {other:?}"),
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

/// S1: happy path: two encrypted events, one batch, everything acked.
#[tokio::test]
async fn happy_path_sends_both_events() {
    let rig = rig(|c| c.sync_policy.batch_size = 2).await;

    let id_a = accepted_id(rig.sdk.enqueue("SCAN", r#"{"scan":"12345"}"#, Some("A")).await.unwrap());
    rig.clock.advance_ms(1);
    let id_b = accepted_id(rig.sdk.enqueue("SCAN", r#"{"scan":"12345"}"#, Some("B")).await.unwrap());

    rig.transport.push(Step::AcceptAll);
    let result = rig.sdk.sync_once().await.unwrap();
    assert_eq!(
        (result.attempted, result.sent, result.transient_failed, result.permanent_failed, result.rejected),
        (2, 2, 0, 0, 0)
    );

    let store = rig.store().await;
    for id in [&id_a, &id_b] {
        assert_eq!(store.get(id).await.unwrap().unwrap().state, EventState::Sent);
    }

    // the wire saw plaintext, ordered by creation
    let requests = rig.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].items[0].payload_json, r#"{"scan":"12345"}"#);
    assert_eq!(requests[0].location_id, "loc-e2e");

    let entries = rig.audit_entries();
    let batch = entries.iter().find(|e| e.name == "sync_batch_success").unwrap();
    assert_eq!(batch.fields["sent"], "2");

    assert!(matches!(rig.sdk.verify_audit_chain().await.unwrap(), ChainVerdict::Ok { .. }));
}

/// S2: transient then success: one 503 backs everything off 10 s, the next
/// pass drains the queue.
#[tokio::test]
async fn transient_failure_backs_off_then_succeeds() {
    let rig = rig(|_| {}).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        rig.clock.advance_ms(1);
        let result =
            rig.sdk.enqueue("HEARTBEAT", &format!(r#"{{"seq":{i}}}"#), None).await.unwrap();
        ids.push(accepted_id(result));
    }

    rig.transport.push(Step::Transient(503));
    let sync_at = rig.clock.now_ms();
    let result = rig.sdk.sync_once().await.unwrap();
    assert_eq!((result.attempted, result.transient_failed), (3, 3));
    assert_eq!(result.sent, 0);

    let store = rig.store().await;
    for id in &ids {
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.state, EventState::Pending);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.next_visible_ms, sync_at + 10_000);
        assert_eq!(row.last_error.as_deref(), Some("http 503"));
    }

    // nothing visible yet; a pass in between claims nothing
    rig.clock.advance_ms(5_000);
    assert_eq!(rig.sdk.sync_once().await.unwrap().attempted, 0);

    rig.clock.advance_ms(5_000);
    rig.transport.push(Step::AcceptAll);
    let result = rig.sdk.sync_once().await.unwrap();
    assert_eq!((result.attempted, result.sent), (3, 3));
    for id in &ids {
        assert_eq!(store.get(id).await.unwrap().unwrap().state, EventState::Sent);
    }

    let entries = rig.audit_entries();
    assert!(entries.iter().any(|e| e.name == "sync_batch_transient"));
    assert!(entries.iter().any(|e| e.name == "sync_batch_success"));
}

/// S3: per-item quarantine: the endpoint acks one and rejects the other.
#[tokio::test]
async fn per_item_rejection_quarantines_with_server_reason() {
    let rig = rig(|_| {}).await;
    let id_1 = accepted_id(rig.sdk.enqueue("SCAN", r#"{"scan":"1"}"#, None).await.unwrap());
    rig.clock.advance_ms(1);
    let id_2 = accepted_id(rig.sdk.enqueue("SCAN", r#"{"scan":"2"}"#, None).await.unwrap());

    rig.transport.push(Step::Reject(vec![(1, "schema")]));
    let result = rig.sdk.sync_once().await.unwrap();
    assert_eq!((result.sent, result.rejected), (1, 1));
    assert_eq!(result.permanent_failed, 0);

    let store = rig.store().await;
    assert_eq!(store.get(&id_1).await.unwrap().unwrap().state, EventState::Sent);
    let row = store.get(&id_2).await.unwrap().unwrap();
    assert_eq!(row.state, EventState::Quarantined);
    assert_eq!(row.last_error.as_deref(), Some("schema"));
}

/// S4: overflow drop-oldest: a cap of 3 keeps the newest three.
#[tokio::test]
async fn overflow_drops_oldest_event() {
    let rig = rig(|c| {
        c.sync_policy.enabled = false;
        c.queue_limits.max_active_events = 3;
    })
    .await;

    let mut ids = Vec::new();
    for i in 1..=4 {
        rig.clock.advance_ms(1);
        let result = rig.sdk.enqueue("SCAN", &format!(r#"{{"n":{i}}}"#, ), None).await.unwrap();
        match result {
            EnqueueResult::Accepted { id: Some(id), dropped_oldest, .. } => {
                assert_eq!(dropped_oldest, u32::from(i == 4), "only E4 evicts");
                ids.push(id);
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    assert_eq!(rig.sdk.count_active().await.unwrap(), 3);
    let store = rig.store().await;
    assert!(store.get(&ids[0]).await.unwrap().is_none(), "E1 evicted");
    for id in &ids[1..] {
        assert!(store.get(id).await.unwrap().is_some());
    }
}

/// S5: denylist: a payload carrying a denylisted key never lands.
#[tokio::test]
async fn denylisted_key_rejects_the_event() {
    let rig = rig(|c| c.sync_policy.enabled = false).await;
    let result = rig.sdk.enqueue("T", r#"{"email":"a@b.com"}"#, None).await.unwrap();
    assert_eq!(result, EnqueueResult::Rejected { reason: RejectReason::DenylistedKey });
    assert_eq!(rig.sdk.count_active().await.unwrap(), 0);

    let entries = rig.audit_entries();
    let rejection = entries.iter().find(|e| e.name == "enqueue_rejected").unwrap();
    assert_eq!(rejection.fields["reason"], "denylisted_key");
    assert!(!rejection.fields.values().any(|v| v.contains("a@b.com")), "payload never audited");
}

/// S6: idempotency dedupe: same stable id, same day bucket, one row.
#[tokio::test]
async fn duplicate_within_bucket_is_deduped() {
    let rig = rig(|c| c.sync_policy.enabled = false).await;

    let first = rig.sdk.enqueue("ORDER", r#"{"total":9}"#, Some("X")).await.unwrap();
    let first_id = accepted_id(first);
    rig.clock.advance_ms(3_600_000); // same day
    let second = rig.sdk.enqueue("ORDER", r#"{"total":9}"#, Some("X")).await.unwrap();
    assert_eq!(
        second,
        EnqueueResult::Accepted {
            id: Some(first_id),
            duplicate: true,
            dropped_oldest: 0,
            dropped_newest: false,
        }
    );
    assert_eq!(rig.sdk.count_active().await.unwrap(), 1);
}

// ── Beyond the lettered scenarios ─────────────────────────────────────────────

/// Retry budget: transient failures quarantine once attempts run out.
#[tokio::test]
async fn exhausted_retry_budget_quarantines() {
    let rig = rig(|c| c.sync_policy.max_attempts_per_event = 2).await;
    let id = accepted_id(rig.sdk.enqueue("SCAN", "{}", None).await.unwrap());
    let store = rig.store().await;

    rig.transport.push(Step::Transient(503));
    let result = rig.sdk.sync_once().await.unwrap();
    assert_eq!(result.transient_failed, 1);

    rig.clock.advance_ms(10_000);
    rig.transport.push(Step::Transient(503));
    let result = rig.sdk.sync_once().await.unwrap();
    // attempts hit the budget on this claim: quarantined instead of rescheduled
    assert_eq!((result.transient_failed, result.permanent_failed), (0, 1));

    let row = store.get(&id).await.unwrap().unwrap();
    assert_eq!(row.state, EventState::Quarantined);
    assert_eq!(row.last_error.as_deref(), Some("retry_budget_exhausted"));
    assert_eq!(row.attempts, 2);
}

/// A whole-batch permanent failure quarantines every claimed event.
#[tokio::test]
async fn permanent_failure_quarantines_the_batch() {
    let rig = rig(|_| {}).await;
    let id = accepted_id(rig.sdk.enqueue("SCAN", "{}", None).await.unwrap());

    rig.transport.push(Step::Permanent(400));
    let result = rig.sdk.sync_once().await.unwrap();
    assert_eq!((result.attempted, result.permanent_failed), (1, 1));

    let store = rig.store().await;
    let row = store.get(&id).await.unwrap().unwrap();
    assert_eq!(row.state, EventState::Quarantined);
    assert_eq!(row.last_error.as_deref(), Some("http 400"));

    let entries = rig.audit_entries();
    assert!(entries.iter().any(|e| e.name == "sync_batch_permanent"));
}

/// The gate: no transport call while sync is disabled or unprovisioned.
#[tokio::test]
async fn gate_returns_zeros_without_touching_transport() {
    let rig1 = rig(|c| c.sync_policy.enabled = false).await;
    rig1.sdk.enqueue("SCAN", "{}", None).await.unwrap();

    let result = rig1.sdk.sync_once().await.unwrap();
    assert_eq!(result.attempted, 0);
    assert!(rig1.transport.requests().is_empty());

    // metered network with require_unmetered_network also gates
    let rig2 = rig(|c| c.sync_policy.require_unmetered_network = true).await;
    rig2.sdk.enqueue("SCAN", "{}", None).await.unwrap();
    rig2.sdk.set_network_metered(true);
    assert_eq!(rig2.sdk.sync_once().await.unwrap().attempted, 0);
    assert!(rig2.transport.requests().is_empty());

    rig2.sdk.set_network_metered(false);
    rig2.transport.push(Step::AcceptAll);
    assert_eq!(rig2.sdk.sync_once().await.unwrap().sent, 1);
}

/// The audit chain stays verifiable across the whole pipeline, and sync
/// batch entries never leak ids or payloads.
#[tokio::test]
async fn audit_chain_survives_a_full_session() {
    let rig = rig(|_| {}).await;
    rig.sdk.enqueue("SCAN", r#"{"scan":"777"}"#, Some("A")).await.unwrap();
    rig.clock.advance_ms(1);
    rig.sdk.enqueue("T", r#"{"email":"x@y.z"}"#, None).await.unwrap(); // rejected
    rig.transport.push(Step::Transient(503));
    rig.sdk.sync_once().await.unwrap();
    rig.clock.advance_ms(10_000);
    rig.transport.push(Step::AcceptAll);
    rig.sdk.sync_once().await.unwrap();

    assert!(matches!(
        rig.sdk.verify_audit_chain().await.unwrap(),
        ChainVerdict::Ok { entries_checked } if entries_checked >= 5
    ));

    for entry in rig.audit_entries().iter().filter(|e| e.name.starts_with("sync_batch")) {
        assert!(!entry.fields.values().any(|v| v.contains("777")));
        assert!(entry.fields.keys().all(|k| k != "id"));
    }
}
