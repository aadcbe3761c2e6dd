//! Best-effort forwarding of step samples to a collector endpoint.
//!
//! Every batch is sent with a single POST. There is no retry and no
//! acknowledgement contract: the response body is logged and failures are
//! dropped after logging.

use crate::core::payload::{to_body, PayloadError, StepBatch, StepTotal};
use crate::store::QuantitySample;
use crate::transparency::SharedTransparencyLog;
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default collector endpoint.
pub const DEFAULT_COLLECTOR_URL: &str = "http://localhost:3333/steps";

/// Collector endpoint configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Full URL batches are posted to
    pub url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Zone timestamps are rendered in
    pub timezone: Tz,
}

impl CollectorConfig {
    /// Create a configuration posting to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
            timezone: Tz::UTC,
        }
    }

    /// Collector listening on `host:port`, posting to its `/steps` route.
    pub fn from_host(host: &str, port: u16) -> Self {
        Self::new(format!("http://{host}:{port}/steps"))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_COLLECTOR_URL)
    }
}

/// Forwarding error types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ForwardError {
    #[error("collector config error: {0}")]
    Config(String),

    #[error("collector network error: {0}")]
    Network(String),

    #[error("collector serialization error: {0}")]
    Serialization(String),
}

impl From<PayloadError> for ForwardError {
    fn from(e: PayloadError) -> Self {
        match e {
            PayloadError::Serialization(msg) => ForwardError::Serialization(msg),
        }
    }
}

/// What the collector answered. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardReceipt {
    pub status: u16,
    pub body: String,
}

/// Client posting step data to the collector.
pub struct SyncForwarder {
    config: CollectorConfig,
    client: reqwest::Client,
    user_agent: String,
    log: Option<SharedTransparencyLog>,
}

impl SyncForwarder {
    /// Create a new forwarder.
    pub fn new(config: CollectorConfig) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ForwardError::Config(format!("Failed to create HTTP client: {e}")))?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let user_agent = format!("libreconnect/{} ({hostname})", env!("CARGO_PKG_VERSION"));

        Ok(Self {
            config,
            client,
            user_agent,
            log: None,
        })
    }

    /// Count forwarding activity in `log`.
    pub fn with_log(mut self, log: SharedTransparencyLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Body for a batch of step samples.
    pub fn batch_body(&self, samples: &[QuantitySample]) -> Result<Vec<u8>, ForwardError> {
        Ok(to_body(&StepBatch::from_samples(samples, self.config.timezone))?)
    }

    /// Body for a scalar step total.
    pub fn total_body(&self, total: f64) -> Result<Vec<u8>, ForwardError> {
        Ok(to_body(&StepTotal { steps: total })?)
    }

    /// Send a batch of samples and wait for the collector's answer.
    pub async fn send_batch(&self, samples: &[QuantitySample]) -> Result<ForwardReceipt, ForwardError> {
        let body = self.batch_body(samples)?;
        self.post(body).await
    }

    /// Send a scalar step total and wait for the collector's answer.
    pub async fn send_total(&self, total: f64) -> Result<ForwardReceipt, ForwardError> {
        let body = self.total_body(total)?;
        self.post(body).await
    }

    async fn post(&self, body: Vec<u8>) -> Result<ForwardReceipt, ForwardError> {
        let response = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", self.user_agent.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| ForwardError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ForwardError::Network(e.to_string()))?;

        Ok(ForwardReceipt { status, body })
    }

    /// Send a batch in the background. The outcome is only logged.
    pub fn forward(self: &Arc<Self>, samples: Vec<QuantitySample>) -> JoinHandle<()> {
        let forwarder = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(ref log) = forwarder.log {
                log.record_forward();
            }

            match forwarder.send_batch(&samples).await {
                Ok(receipt) => {
                    tracing::info!(
                        status = receipt.status,
                        samples = samples.len(),
                        body = %receipt.body,
                        "collector responded"
                    );
                }
                Err(e) => {
                    tracing::warn!(samples = samples.len(), error = %e, "forwarding to collector failed");
                    if let Some(ref log) = forwarder.log {
                        log.record_forward_failure();
                    }
                }
            }
        })
    }
}
