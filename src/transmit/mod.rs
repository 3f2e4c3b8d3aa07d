use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{ConnectivityStatus, DocumentRecord};
use crate::retry::RetrySchedule;

pub mod model;

pub use model::{FailureKind, SendOutcome, TransmissionStatistics};

/// Delivery seam used by the outbox drain; the HTTP client is the production
/// implementation, tests plug in recording doubles.
#[async_trait]
pub trait Transmitter: Send + Sync {
    async fn send(&self, record: &DocumentRecord) -> SendOutcome;

    async fn health_check(&self) -> SendOutcome;

    fn connection_status(&self) -> ConnectivityStatus;

    fn statistics(&self) -> TransmissionStatistics;

    /// True when a send or probe succeeded within `spacing`.
    fn succeeded_within(&self, spacing: Duration) -> bool;
}

/// Probe every `interval` until cancelled, skipping ticks that follow a
/// recent success by less than `min_spacing`.
pub async fn run_health_monitor(
    transmitter: Arc<dyn Transmitter>,
    interval: Duration,
    min_spacing: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if transmitter.succeeded_within(min_spacing) {
                    debug!("skipping health probe; recent success");
                    continue;
                }
                let outcome = transmitter.health_check().await;
                if !outcome.success {
                    warn!(error = ?outcome.error, "ingestion endpoint unhealthy");
                }
            }
        }
    }
    debug!("health monitor stopped");
}

#[derive(Clone)]
pub struct ClientSettings {
    pub endpoint: Url,
    pub health_url: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub health_timeout: Duration,
    pub max_attempts: u32,
    pub retry: RetrySchedule,
    /// Bodies larger than this many bytes are gzip-compressed.
    pub compression_threshold: usize,
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("endpoint", &self.endpoint)
            .field("health_url", &self.health_url)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("compression_threshold", &self.compression_threshold)
            .finish_non_exhaustive()
    }
}

impl ClientSettings {
    pub fn new(endpoint: Url, health_url: Url) -> Self {
        Self {
            endpoint,
            health_url,
            api_key: None,
            timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry: RetrySchedule::default(),
            compression_threshold: 1024,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let tx = &cfg.transmission;
        Ok(Self {
            endpoint: Url::parse(&tx.endpoint).context("invalid transmission.endpoint")?,
            health_url: Url::parse(&tx.health_url).context("invalid transmission.health_url")?,
            api_key: tx.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout: Duration::from_secs(tx.timeout_secs),
            health_timeout: Duration::from_secs(tx.health_timeout_secs),
            max_attempts: tx.max_attempts.max(1),
            retry: cfg.retry_schedule(),
            compression_threshold: tx.compression_threshold_bytes,
        })
    }
}

#[derive(Default)]
struct ClientState {
    status: RwLock<ConnectivityStatus>,
    stats: Mutex<TransmissionStatistics>,
    last_success: Mutex<Option<Instant>>,
}

/// HTTP client for the ingestion endpoint. Clones share connectivity state
/// and statistics.
#[derive(Clone)]
pub struct TransmissionClient {
    http: Client,
    settings: Arc<ClientSettings>,
    state: Arc<ClientState>,
    cancel: CancellationToken,
}

impl fmt::Debug for TransmissionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmissionClient")
            .field("endpoint", &self.settings.endpoint)
            .field("status", &self.connection_status())
            .finish_non_exhaustive()
    }
}

enum Attempt {
    Response { status: StatusCode, body: String },
    Transport { error: reqwest::Error },
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

impl TransmissionClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        Self::with_cancellation(settings, CancellationToken::new())
    }

    /// Backoff sleeps between retries end early once `cancel` fires.
    pub fn with_cancellation(settings: ClientSettings, cancel: CancellationToken) -> Result<Self> {
        let http = Client::builder()
            .user_agent("edge-collector/0.1")
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            settings: Arc::new(settings),
            state: Arc::new(ClientState::default()),
            cancel,
        })
    }

    /// Gzip the body when it is larger than the compression threshold.
    pub fn encode_body(&self, raw: Vec<u8>) -> std::io::Result<(Vec<u8>, bool)> {
        if raw.len() <= self.settings.compression_threshold {
            return Ok((raw, false));
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
        encoder.write_all(&raw)?;
        Ok((encoder.finish()?, true))
    }

    pub fn build_request(&self, body: Vec<u8>, compressed: bool) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .post(self.settings.endpoint.clone())
            .timeout(self.settings.timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if compressed {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(key) = &self.settings.api_key {
            builder = builder.bearer_auth(key);
        }
        builder.build().context("failed to build ingestion request")
    }

    async fn attempt(&self, body: &[u8], compressed: bool) -> Result<Attempt> {
        let request = self.build_request(body.to_vec(), compressed)?;
        debug!(url = %request.url(), bytes = body.len(), compressed, "sending document");
        match self.http.execute(request).await {
            Ok(res) => {
                let status = res.status();
                let body = match res.text().await {
                    Ok(body) => body,
                    Err(err) => {
                        warn!(%status, error = %err, "failed to read response body");
                        String::new()
                    }
                };
                Ok(Attempt::Response { status, body })
            }
            Err(error) => Ok(Attempt::Transport { error }),
        }
    }

    /// Serialise, compress and POST a record, retrying transient failures.
    pub async fn send_record(&self, record: &DocumentRecord) -> SendOutcome {
        let started = Instant::now();
        let encoded = serde_json::to_vec(record)
            .map_err(|err| err.to_string())
            .and_then(|raw| self.encode_body(raw).map_err(|err| err.to_string()));
        let (body, compressed) = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                return SendOutcome::failed(
                    FailureKind::Encoding,
                    format!("failed to encode record: {}", err),
                )
                .with_timing(started.elapsed(), 0)
            }
        };

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt_no = 0;
        loop {
            attempt_no += 1;
            let request_started = Instant::now();
            self.state.stats.lock().total_requests += 1;

            let (retryable, failure) = match self.attempt(&body, compressed).await {
                Ok(Attempt::Response { status, body }) => {
                    self.state.stats.lock().record_response_code(status.as_u16());
                    let response_body = Some(body).filter(|b| !b.is_empty());
                    if status.is_success() {
                        self.on_success(request_started.elapsed());
                        return SendOutcome::delivered(
                            status.as_u16(),
                            response_body,
                            started.elapsed(),
                            attempt_no,
                        );
                    }
                    let outcome = SendOutcome::failed(
                        FailureKind::Rejected,
                        format!("endpoint answered {}", status),
                    )
                    .with_response(status.as_u16(), response_body);
                    (is_retryable_status(status), outcome)
                }
                Ok(Attempt::Transport { error }) => {
                    let kind = if error.is_timeout() {
                        FailureKind::Timeout
                    } else {
                        FailureKind::Transport
                    };
                    (true, SendOutcome::failed(kind, format!("request failed: {}", error)))
                }
                Err(err) => (
                    false,
                    SendOutcome::failed(FailureKind::Encoding, format!("{:#}", err)),
                ),
            };

            if !retryable || attempt_no >= max_attempts {
                let outcome = failure.with_timing(started.elapsed(), attempt_no);
                self.on_failure(&outcome);
                return outcome;
            }

            let delay = self.settings.retry.delay_for(attempt_no);
            self.state.stats.lock().retried_requests += 1;
            debug!(attempt = attempt_no, delay_ms = delay.as_millis() as u64, error = ?failure.error, "retrying send");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let outcome = SendOutcome {
                        failure: Some(FailureKind::Cancelled),
                        ..failure.with_timing(started.elapsed(), attempt_no)
                    };
                    self.on_failure(&outcome);
                    return outcome;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// GET the health endpoint with the shorter probe timeout.
    pub async fn probe_health(&self) -> SendOutcome {
        let started = Instant::now();
        let result = self
            .http
            .get(self.settings.health_url.clone())
            .timeout(self.settings.health_timeout)
            .send()
            .await;
        let outcome = match result {
            Ok(res) if res.status().is_success() => {
                let status = res.status().as_u16();
                *self.state.last_success.lock() = Some(Instant::now());
                self.set_status(ConnectivityStatus::Connected);
                SendOutcome::delivered(status, None, started.elapsed(), 1)
            }
            Ok(res) => {
                let status = res.status();
                self.set_status(ConnectivityStatus::Error);
                SendOutcome::failed(FailureKind::Rejected, format!("health answered {}", status))
                    .with_response(status.as_u16(), None)
                    .with_timing(started.elapsed(), 1)
            }
            Err(err) => {
                self.set_status(ConnectivityStatus::Disconnected);
                let kind = if err.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Transport
                };
                SendOutcome::failed(kind, format!("health probe failed: {}", err))
                    .with_timing(started.elapsed(), 1)
            }
        };
        debug!(success = outcome.success, status = ?self.connection_status(), "health probe");
        outcome
    }

    /// True when a send or probe succeeded within `spacing`.
    pub fn succeeded_within(&self, spacing: Duration) -> bool {
        self.state
            .last_success
            .lock()
            .map(|at| at.elapsed() < spacing)
            .unwrap_or(false)
    }

    pub fn connection_status(&self) -> ConnectivityStatus {
        *self.state.status.read()
    }

    pub fn statistics(&self) -> TransmissionStatistics {
        self.state.stats.lock().clone()
    }

    fn set_status(&self, status: ConnectivityStatus) {
        let previous = std::mem::replace(&mut *self.state.status.write(), status);
        if previous != status {
            info!(from = previous.as_str(), to = status.as_str(), "connectivity changed");
        }
    }

    fn on_success(&self, latency: Duration) {
        self.state.stats.lock().record_success(latency);
        *self.state.last_success.lock() = Some(Instant::now());
        self.set_status(ConnectivityStatus::Connected);
    }

    fn on_failure(&self, outcome: &SendOutcome) {
        let kind = outcome.failure.unwrap_or(FailureKind::Transport);
        self.state.stats.lock().record_failure(kind);
        match kind {
            FailureKind::Timeout | FailureKind::Transport => {
                self.set_status(ConnectivityStatus::Disconnected)
            }
            FailureKind::Rejected => self.set_status(ConnectivityStatus::Error),
            FailureKind::Cancelled if outcome.status_code.is_none() => {
                self.set_status(ConnectivityStatus::Disconnected)
            }
            FailureKind::Cancelled => self.set_status(ConnectivityStatus::Error),
            FailureKind::Encoding => {}
        }
    }
}

#[async_trait]
impl Transmitter for TransmissionClient {
    async fn send(&self, record: &DocumentRecord) -> SendOutcome {
        self.send_record(record).await
    }

    async fn health_check(&self) -> SendOutcome {
        self.probe_health().await
    }

    fn connection_status(&self) -> ConnectivityStatus {
        TransmissionClient::connection_status(self)
    }

    fn statistics(&self) -> TransmissionStatistics {
        TransmissionClient::statistics(self)
    }

    fn succeeded_within(&self, spacing: Duration) -> bool {
        TransmissionClient::succeeded_within(self, spacing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn client_with_threshold(threshold: usize) -> TransmissionClient {
        let mut settings = ClientSettings::new(
            Url::parse("http://127.0.0.1:9/api/documents").unwrap(),
            Url::parse("http://127.0.0.1:9/health").unwrap(),
        );
        settings.api_key = Some("secret".into());
        settings.compression_threshold = threshold;
        TransmissionClient::new(settings).unwrap()
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn small_bodies_are_left_alone() {
        let client = client_with_threshold(1024);
        let (body, compressed) = client.encode_body(vec![b'a'; 1024]).unwrap();
        assert!(!compressed);
        assert_eq!(body.len(), 1024);
    }

    #[test]
    fn large_bodies_are_gzipped() {
        let client = client_with_threshold(1024);
        let raw = vec![b'a'; 4096];
        let (body, compressed) = client.encode_body(raw.clone()).unwrap();
        assert!(compressed);
        assert!(body.len() < raw.len());
        let mut decoded = Vec::new();
        GzDecoder::new(&body[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn build_request_sets_headers() {
        let client = client_with_threshold(1024);
        let request = client.build_request(b"{}".to_vec(), true).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/api/documents");
        let headers = request.headers();
        assert_eq!(
            headers.get("Authorization").and_then(|h| h.to_str().ok()).unwrap(),
            "Bearer secret"
        );
        assert_eq!(
            headers.get("Content-Type").and_then(|h| h.to_str().ok()).unwrap(),
            "application/json"
        );
        assert_eq!(
            headers.get("Content-Encoding").and_then(|h| h.to_str().ok()).unwrap(),
            "gzip"
        );
        assert_eq!(request.timeout(), Some(&Duration::from_secs(30)));
    }

    #[test]
    fn starts_unknown_with_empty_statistics() {
        let client = client_with_threshold(1024);
        assert_eq!(client.connection_status(), ConnectivityStatus::Unknown);
        assert_eq!(client.statistics(), TransmissionStatistics::default());
        assert!(!client.succeeded_within(Duration::from_secs(60)));
        let debug = format!("{:?}", client);
        assert!(!debug.contains("secret"));
    }
}
