use std::collections::VecDeque;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use edge_collector::model::{ConnectivityStatus, DocumentRecord};
use edge_collector::retry::RetrySchedule;
use edge_collector::transmit::{
    run_health_monitor, ClientSettings, FailureKind, SendOutcome, TransmissionClient,
    TransmissionStatistics, Transmitter,
};
use flate2::read::GzDecoder;
use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct SeenRequest {
    request_line: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SeenRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Replays canned `(status, body)` responses, one per connection, and records
/// every request it receives. Answers 200 once the script runs out.
#[derive(Clone, Default)]
struct CannedServer {
    responses: Arc<Mutex<VecDeque<(u16, String)>>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl CannedServer {
    async fn start(responses: Vec<(u16, &str)>) -> (Self, SocketAddr) {
        let server = Self {
            responses: Arc::new(Mutex::new(
                responses
                    .into_iter()
                    .map(|(code, body)| (code, body.to_string()))
                    .collect(),
            )),
            ..Default::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let _ = handle.serve(stream).await;
                });
            }
        });
        (server, addr)
    }

    async fn serve(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = buf[header_end..].to_vec();
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        self.seen.lock().await.push(SeenRequest {
            request_line,
            headers,
            body,
        });
        let (code, payload) = self
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or((200, "{\"ok\":true}".to_string()));
        let response = format!(
            "HTTP/1.1 {} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            code,
            payload.len(),
            payload
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().await.clone()
    }
}

/// Accepts connections and never answers.
async fn stalling_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// Counts health checks; reports a recent success while `recent` is set.
#[derive(Default)]
struct HealthCheckCounter {
    recent: AtomicBool,
    checks: AtomicUsize,
}

#[async_trait]
impl Transmitter for HealthCheckCounter {
    async fn send(&self, _record: &DocumentRecord) -> SendOutcome {
        SendOutcome::delivered(200, None, Duration::ZERO, 1)
    }

    async fn health_check(&self) -> SendOutcome {
        self.checks.fetch_add(1, Ordering::SeqCst);
        SendOutcome::delivered(200, None, Duration::ZERO, 1)
    }

    fn connection_status(&self) -> ConnectivityStatus {
        ConnectivityStatus::Connected
    }

    fn statistics(&self) -> TransmissionStatistics {
        TransmissionStatistics::default()
    }

    fn succeeded_within(&self, _spacing: Duration) -> bool {
        self.recent.load(Ordering::SeqCst)
    }
}

fn settings_for(addr: SocketAddr) -> ClientSettings {
    let mut settings = ClientSettings::new(
        Url::parse(&format!("http://{}/api/documents", addr)).unwrap(),
        Url::parse(&format!("http://{}/health", addr)).unwrap(),
    );
    settings.api_key = Some("test-key".into());
    settings.timeout = Duration::from_secs(5);
    settings.max_attempts = 3;
    settings.retry = RetrySchedule::new(vec![Duration::from_millis(10); 5]);
    settings
}

fn record(content: &str) -> DocumentRecord {
    DocumentRecord {
        document_key: "35240112345678000190550010000001231000001234".into(),
        file_name: "nfe.xml".into(),
        source_path: "/in/nfe.xml".into(),
        content_hash: "abc".into(),
        size: content.len() as u64,
        detected_at: Utc::now(),
        content: content.into(),
    }
}

#[tokio::test]
async fn transient_status_is_retried_until_success() {
    let (server, addr) = CannedServer::start(vec![(503, "busy"), (429, "slow down"), (201, "{\"id\":7}")]).await;
    let client = TransmissionClient::new(settings_for(addr)).unwrap();

    let outcome = client.send_record(&record("<small/>")).await;
    assert!(outcome.success);
    assert_eq!(outcome.status_code, Some(201));
    assert_eq!(outcome.response_body.as_deref(), Some("{\"id\":7}"));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(client.connection_status(), ConnectivityStatus::Connected);

    let stats = client.statistics();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.retried_requests, 2);
    assert_eq!(stats.failed_requests, 0);
    assert_eq!(stats.response_codes.get(&503), Some(&1));
    assert_eq!(stats.response_codes.get(&429), Some(&1));
    assert_eq!(stats.response_codes.get(&201), Some(&1));
    assert!(stats.last_success_at.is_some());

    let seen = server.seen().await;
    assert_eq!(seen.len(), 3);
    assert!(seen[0].request_line.starts_with("POST /api/documents"));
    assert_eq!(seen[0].header("authorization"), Some("Bearer test-key"));
    assert_eq!(seen[0].header("content-type"), Some("application/json"));
    assert!(seen[0].header("content-encoding").is_none());
    let sent: DocumentRecord = serde_json::from_slice(&seen[0].body).unwrap();
    assert_eq!(sent.content, "<small/>");
}

#[tokio::test]
async fn rejection_is_not_retried_and_marks_error() {
    let (server, addr) = CannedServer::start(vec![(400, "{\"error\":\"bad schema\"}")]).await;
    let client = TransmissionClient::new(settings_for(addr)).unwrap();

    let outcome = client.send_record(&record("<doc/>")).await;
    assert!(!outcome.success);
    assert_eq!(outcome.status_code, Some(400));
    assert_eq!(outcome.failure, Some(FailureKind::Rejected));
    assert_eq!(outcome.response_body.as_deref(), Some("{\"error\":\"bad schema\"}"));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(server.seen().await.len(), 1);
    assert_eq!(client.connection_status(), ConnectivityStatus::Error);
    assert_eq!(client.statistics().failed_requests, 1);
}

#[tokio::test]
async fn exhausted_retries_report_last_failure() {
    let (server, addr) = CannedServer::start(vec![(500, "a"), (502, "b"), (504, "c"), (200, "late")]).await;
    let client = TransmissionClient::new(settings_for(addr)).unwrap();

    let outcome = client.send_record(&record("<doc/>")).await;
    assert!(!outcome.success);
    assert_eq!(outcome.status_code, Some(504));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(server.seen().await.len(), 3);
    let stats = client.statistics();
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.retried_requests, 2);
}

#[tokio::test]
async fn large_bodies_are_sent_gzipped() {
    let (server, addr) = CannedServer::start(vec![(200, "{}")]).await;
    let client = TransmissionClient::new(settings_for(addr)).unwrap();
    let content = "<det>".repeat(600);

    let outcome = client.send_record(&record(&content)).await;
    assert!(outcome.success);

    let seen = server.seen().await;
    assert_eq!(seen[0].header("content-encoding"), Some("gzip"));
    let mut json = Vec::new();
    GzDecoder::new(&seen[0].body[..]).read_to_end(&mut json).unwrap();
    let sent: DocumentRecord = serde_json::from_slice(&json).unwrap();
    assert_eq!(sent.content, content);
}

#[tokio::test]
async fn refused_connection_marks_disconnected() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = TransmissionClient::new(settings_for(addr)).unwrap();

    let outcome = client.send_record(&record("<doc/>")).await;
    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::Transport));
    assert!(outcome.status_code.is_none());
    assert_eq!(outcome.attempts, 3);
    assert_eq!(client.connection_status(), ConnectivityStatus::Disconnected);

    let health = client.probe_health().await;
    assert!(!health.success);
    assert_eq!(client.connection_status(), ConnectivityStatus::Disconnected);
}

#[tokio::test]
async fn health_probe_updates_status_without_counting_requests() {
    let (server, addr) = CannedServer::start(vec![(200, "ok")]).await;
    let client = TransmissionClient::new(settings_for(addr)).unwrap();

    let outcome = client.probe_health().await;
    assert!(outcome.success);
    assert_eq!(client.connection_status(), ConnectivityStatus::Connected);
    assert_eq!(client.statistics().total_requests, 0);
    assert!(client.succeeded_within(Duration::from_secs(30)));

    let seen = server.seen().await;
    assert!(seen[0].request_line.starts_with("GET /health"));
}

#[tokio::test]
async fn stalled_endpoint_counts_as_timeout() {
    let addr = stalling_server().await;
    let mut settings = settings_for(addr);
    settings.timeout = Duration::from_millis(200);
    settings.max_attempts = 2;
    let client = TransmissionClient::new(settings).unwrap();

    let outcome = client.send_record(&record("<doc/>")).await;
    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::Timeout));
    assert!(outcome.status_code.is_none());
    assert_eq!(outcome.attempts, 2);
    assert_eq!(client.connection_status(), ConnectivityStatus::Disconnected);

    let stats = client.statistics();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.retried_requests, 1);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.timeout_requests, 1);
    assert!(stats.last_failure_at.is_some());
}

#[tokio::test]
async fn health_monitor_skips_checks_after_recent_success() {
    let counter = Arc::new(HealthCheckCounter::default());
    counter.recent.store(true, Ordering::SeqCst);
    let cancel = CancellationToken::new();
    let monitor = tokio::spawn(run_health_monitor(
        counter.clone() as Arc<dyn Transmitter>,
        Duration::from_millis(20),
        Duration::from_secs(30),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(counter.checks.load(Ordering::SeqCst), 0);

    counter.recent.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(counter.checks.load(Ordering::SeqCst) >= 2);

    cancel.cancel();
    monitor.await.unwrap();
}
