use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Why a send ended without a success response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The request hit its deadline.
    Timeout,
    /// Connection refused, reset, DNS, TLS and similar.
    Transport,
    /// The endpoint answered with a non-success status.
    Rejected,
    /// The record could not be serialised or compressed.
    Encoding,
    /// Shutdown interrupted the retry loop.
    Cancelled,
}

/// Result of one logical send (including its internal retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub duration: Duration,
    pub attempts: u32,
}

impl SendOutcome {
    pub fn delivered(
        status_code: u16,
        response_body: Option<String>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            response_body,
            error: None,
            failure: None,
            duration,
            attempts,
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            response_body: None,
            error: Some(error.into()),
            failure: Some(kind),
            duration: Duration::ZERO,
            attempts: 0,
        }
    }

    pub fn with_response(mut self, status_code: u16, body: Option<String>) -> Self {
        self.status_code = Some(status_code);
        self.response_body = body;
        self
    }

    pub fn with_timing(mut self, duration: Duration, attempts: u32) -> Self {
        self.duration = duration;
        self.attempts = attempts;
        self
    }
}

/// Process-lifetime counters for document traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransmissionStatistics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_requests: u64,
    pub retried_requests: u64,
    pub response_codes: BTreeMap<u16, u64>,
    pub average_latency_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl TransmissionStatistics {
    pub(crate) fn record_response_code(&mut self, code: u16) {
        *self.response_codes.entry(code).or_insert(0) += 1;
    }

    pub(crate) fn record_success(&mut self, latency: Duration) {
        self.successful_requests += 1;
        let sample = latency.as_secs_f64() * 1000.0;
        let n = self.successful_requests as f64;
        self.average_latency_ms += (sample - self.average_latency_ms) / n;
        self.last_success_at = Some(Utc::now());
    }

    pub(crate) fn record_failure(&mut self, kind: FailureKind) {
        self.failed_requests += 1;
        if kind == FailureKind::Timeout {
            self.timeout_requests += 1;
        }
        self.last_failure_at = Some(Utc::now());
    }
}
