//! Retention janitor: ages out what is already done. Terminal queue rows,
//! audit day-files and ring logs past their retention windows are deleted;
//! non-terminal rows are never touched.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::AuditTrail;
use crate::clock::Clock;
use crate::config::RetentionPolicy;
use crate::error::SdkError;
use crate::ringlog::RingLog;
use crate::store::QueueStore;

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub sent_purged: u64,
    pub quarantined_purged: u64,
    pub audit_files_purged: u32,
    pub log_files_purged: u32,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RetentionJanitor {
    store: Arc<QueueStore>,
    audit: Arc<AuditTrail>,
    ringlog: Arc<RingLog>,
    clock: Arc<dyn Clock>,
}

impl RetentionJanitor {
    pub fn new(
        store: Arc<QueueStore>,
        audit: Arc<AuditTrail>,
        ringlog: Arc<RingLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, audit, ringlog, clock }
    }

    /// One pass, invoked after each sync and on demand. File deletions are
    /// best-effort; row purges are not.
    pub async fn run(&self, policy: &RetentionPolicy) -> Result<RetentionReport, SdkError> {
        let now_ms = self.clock.now_ms();
        let mut report = RetentionReport::default();

        report.sent_purged =
            self.store.purge_sent_before(now_ms - i64::from(policy.retain_sent_days) * DAY_MS).await?;
        report.quarantined_purged = self
            .store
            .purge_quarantined_before(now_ms - i64::from(policy.retain_failed_days) * DAY_MS)
            .await?;

        match self
            .audit
            .purge_older_than(now_ms - i64::from(policy.retain_audit_days) * DAY_MS)
            .await
        {
            Ok(purged) => report.audit_files_purged = purged,
            Err(e) => warn!("audit retention failed: {e}"),
        }
        match self
            .ringlog
            .purge_older_than(now_ms - i64::from(policy.retain_logs_days) * DAY_MS)
            .await
        {
            Ok(purged) => report.log_files_purged = purged,
            Err(e) => warn!("ring log retention failed: {e}"),
        }

        if !report.is_empty() {
            info!(
                "retention pass: {} sent, {} quarantined, {} audit file(s), {} log file(s)",
                report.sent_purged,
                report.quarantined_purged,
                report.audit_files_purged,
                report.log_files_purged
            );
        }
        Ok(report)
    }
}
