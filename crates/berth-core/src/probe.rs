//! Health probing.
//!
//! A probe is one request with a hard timeout. Retry policy belongs to the
//! deploy orchestrator, not the prober.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{truncate_diagnostic, BerthError, Result};

/// Maximum characters of response body or error kept in a probe diagnostic.
pub const PROBE_DIAGNOSTIC_CAP: usize = 300;

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// Status in `[200, 300)`.
    pub success: bool,
    /// HTTP status, when a response was received at all.
    pub status: Option<u16>,
    pub diagnostic: String,
}

impl ProbeResult {
    pub fn passed(status: u16, body: &str) -> Self {
        Self {
            success: true,
            status: Some(status),
            diagnostic: truncate_diagnostic(body, PROBE_DIAGNOSTIC_CAP),
        }
    }

    pub fn failed(status: Option<u16>, detail: &str) -> Self {
        let detail = truncate_diagnostic(detail, PROBE_DIAGNOSTIC_CAP);
        let diagnostic = match status {
            Some(code) if detail.is_empty() => format!("HTTP {}", code),
            Some(code) => format!("HTTP {}: {}", code, detail),
            None => detail,
        };
        Self {
            success: false,
            status,
            diagnostic,
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, method: &str, timeout: Duration) -> ProbeResult;
}

/// reqwest-backed [`HealthProbe`].
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BerthError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, method: &str, timeout: Duration) -> ProbeResult {
        let method = reqwest::Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let request = async {
            let response = self
                .client
                .request(method, url)
                .timeout(timeout)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Ok::<_, reqwest::Error>((status, body))
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(Ok((status, body))) if status.is_success() => {
                ProbeResult::passed(status.as_u16(), &body)
            }
            Ok(Ok((status, body))) => ProbeResult::failed(Some(status.as_u16()), &body),
            Ok(Err(e)) => ProbeResult::failed(None, &e.to_string()),
            Err(_) => ProbeResult::failed(
                None,
                &format!("no response within {} ms", timeout.as_millis()),
            ),
        }
    }
}
