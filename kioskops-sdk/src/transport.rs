//! Pluggable batch transport.
//!
//! The sync engine hands a fully decoded `BatchRequest` to a `Transport` and
//! gets back a classified outcome; everything network-specific (TLS,
//! pinning, retry-after headers, body signing) stays behind this seam. The
//! built-in `HttpTransport` covers the common case of a JSON POST with
//! host-supplied auth headers.

use async_trait::async_trait;
use kioskops_types::{BatchRequest, BatchResponse, RejectedItem};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::SdkError;

/// Classified outcome of one batch send. A closed sum; the sync engine
/// matches exhaustively and the state machine absorbs every case.
#[derive(Debug, Clone)]
pub enum TransportResult {
    Success {
        accepted_ids: Vec<String>,
        rejected: Vec<RejectedItem>,
        http_status: u16,
    },
    /// Worth retrying: network failure, timeout, 408/429/5xx, or auth
    /// failures (401/403; a token refresh may heal them).
    TransientFailure {
        http_status: Option<u16>,
        cause: Option<String>,
    },
    /// Not worth retrying: the endpoint rejected the batch outright.
    PermanentFailure {
        http_status: Option<u16>,
        message: String,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_batch(&self, request: &BatchRequest) -> TransportResult;
}

/// Header-mutator hook: the host owns token lifecycle, the SDK only asks
/// for the headers to attach to each request.
pub trait AuthProvider: Send + Sync {
    fn headers(&self) -> Vec<(String, String)>;
}

/// Default provider: anonymous requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

// ── HTTP transport ────────────────────────────────────────────────────────────

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        endpoint_path: &str,
        request_timeout: Duration,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, SdkError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SdkError::Config(format!("http client: {e}")))?;
        let endpoint = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            endpoint_path.trim_start_matches('/')
        );
        Ok(Self { client, endpoint, auth })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, request: &BatchRequest) -> TransportResult {
        let mut req = self.client.post(&self.endpoint).json(request);
        for (name, value) in self.auth.headers() {
            req = req.header(&name, &value);
        }

        let response = match req.send().await {
            Ok(response) => response,
            Err(e) => {
                // connect errors and timeouts both retry
                warn!("batch send failed: {e}");
                return TransportResult::TransientFailure {
                    http_status: None,
                    cause: Some(if e.is_timeout() { "timeout".into() } else { "network".into() }),
                };
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            match response.json::<BatchResponse>().await {
                Ok(body) => TransportResult::Success {
                    accepted_ids: body.accepted,
                    rejected: body.rejected,
                    http_status: status,
                },
                Err(e) => TransportResult::TransientFailure {
                    http_status: Some(status),
                    cause: Some(format!("malformed response body: {e}")),
                },
            }
        } else if matches!(status, 401 | 403 | 408 | 429) || status >= 500 {
            TransportResult::TransientFailure {
                http_status: Some(status),
                cause: Some(format!("http {status}")),
            }
        } else if (400..500).contains(&status) {
            TransportResult::PermanentFailure {
                http_status: Some(status),
                message: format!("http {status}"),
            }
        } else {
            // unexpected 1xx/3xx: treat as retryable noise
            TransportResult::TransientFailure {
                http_status: Some(status),
                cause: Some(format!("unexpected http {status}")),
            }
        }
    }
}
