//! main.rs: KioskOps ingest simulator entry point
//!
//! A stand-in for the fleet ingest endpoint during SDK development:
//! accepts `POST /events/batch`, acknowledges per item, and injects faults
//! on demand so the device-side retry/quarantine paths can be exercised
//! against a real HTTP server:
//!
//!   --fail-status 503          every response is a bare 503 (transient path)
//!   --fail-first 2             first N batches fail 503, then recover
//!   --reject-type BADTYPE      items of this type are rejected with "schema"
//!
//! Duplicate idempotency keys are accepted idempotently (acked, not
//! re-recorded), mirroring production dedup semantics.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use kioskops_types::{BatchRequest, BatchResponse, RejectedItem};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ingest-sim", about = "KioskOps ingest endpoint simulator")]
struct Args {
    /// Listen port
    #[arg(long, default_value_t = 8787)]
    port: u16,
    /// Always answer with this HTTP status (e.g. 503) instead of processing
    #[arg(long)]
    fail_status: Option<u16>,
    /// Fail the first N batches with 503, then behave normally
    #[arg(long, default_value_t = 0)]
    fail_first: u64,
    /// Reject items of this event type with reason "schema"
    #[arg(long)]
    reject_type: Option<String>,
}

// ── State ─────────────────────────────────────────────────────────────────────

struct SimState {
    args: Args,
    batches_seen: AtomicU64,
    events_accepted: AtomicU64,
    seen_keys: RwLock<HashSet<String>>,
}

type SharedState = Arc<SimState>;

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "batchesSeen": state.batches_seen.load(Ordering::Relaxed),
        "eventsAccepted": state.events_accepted.load(Ordering::Relaxed),
    }))
}

async fn events_batch(
    State(state): State<SharedState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, StatusCode> {
    let batch_no = state.batches_seen.fetch_add(1, Ordering::Relaxed) + 1;

    if let Some(status) = state.args.fail_status {
        warn!("batch {batch_no}: injecting {status}");
        return Err(StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE));
    }
    if batch_no <= state.args.fail_first {
        warn!("batch {batch_no}: injecting 503 ({} more to go)", state.args.fail_first - batch_no);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let mut response = BatchResponse::default();
    let mut seen = state.seen_keys.write().await;
    for item in &request.items {
        if state.args.reject_type.as_deref() == Some(item.event_type.as_str()) {
            response.rejected.push(RejectedItem { id: item.id.clone(), reason: "schema".into() });
            continue;
        }
        // duplicates ack without re-recording; that is the whole point of
        // the idempotency key
        if seen.insert(item.idempotency_key.clone()) {
            state.events_accepted.fetch_add(1, Ordering::Relaxed);
        }
        response.accepted.push(item.id.clone());
    }

    info!(
        "batch {batch_no} from {} (sdk {}): {} item(s), {} accepted, {} rejected",
        request.location_id,
        request.sdk_version,
        request.items.len(),
        response.accepted.len(),
        response.rejected.len()
    );
    Ok(Json(response))
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let port = args.port;
    info!(
        "ingest simulator starting on :{port} (fail_status={:?}, fail_first={}, reject_type={:?})",
        args.fail_status, args.fail_first, args.reject_type
    );

    let state: SharedState = Arc::new(SimState {
        args,
        batches_seen: AtomicU64::new(0),
        events_accepted: AtomicU64::new(0),
        seen_keys: RwLock::new(HashSet::new()),
    });

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = Router::new()
        .route("/health", get(health))
        .route("/events/batch", post(events_batch))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
