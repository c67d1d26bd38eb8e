// src/remote.rs
//! Remote fetcher: one peer, bounded attempts, typed failures.
//!
//! `PeerTransport` performs a single attempt; `RemoteFetcher` owns the retry
//! loop. Only transport failures (timeout, refused/reset) are retried. A peer
//! that answers with a non-2xx status or an undecodable body fails the whole
//! sequence immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;

use crate::error::FetchError;
use crate::registry::{Endpoint, SourceDescriptor};
use crate::types::EmployeeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Bound on each attempt, send to response headers.
    pub timeout: Duration,
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt up to `backoff_max`. Zero disables.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `next_attempt` (2-based; there is no delay before the first).
    pub fn backoff_before(&self, next_attempt: u32) -> Duration {
        if next_attempt < 2 || self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let shift = (next_attempt - 2).min(16);
        self.backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.backoff_max)
    }

    /// Longest a full attempt sequence can take: every attempt times out and
    /// reads its body to the limit, plus all backoff.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let per_attempt = self.timeout.saturating_mul(2);
        let backoff = (2..=attempts)
            .map(|n| self.backoff_before(n))
            .fold(Duration::ZERO, Duration::saturating_add);
        per_attempt.saturating_mul(attempts).saturating_add(backoff)
    }
}

/// One request to one peer. Implementations must not retry.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn get_records(
        &self,
        source: &SourceDescriptor,
        timeout: Duration,
    ) -> Result<Vec<EmployeeRecord>, FetchError>;

    fn name(&self) -> &'static str;
}

/// Final failure of an attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub error: FetchError,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSuccess {
    pub records: Vec<EmployeeRecord>,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct RemoteFetcher {
    transport: Arc<dyn PeerTransport>,
    policy: RetryPolicy,
}

impl RemoteFetcher {
    pub fn new(transport: Arc<dyn PeerTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch_remote(
        &self,
        source: &SourceDescriptor,
    ) -> Result<RemoteSuccess, RemoteFailure> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            counter!("directory_remote_attempts_total", "source" => source.id.clone())
                .increment(1);

            match self.transport.get_records(source, self.policy.timeout).await {
                Ok(records) => {
                    return Ok(RemoteSuccess {
                        records,
                        attempts: attempt,
                    })
                }
                Err(error) => {
                    tracing::warn!(
                        source = %source.id,
                        attempt,
                        max_attempts,
                        kind = error.category(),
                        error = %error,
                        "peer fetch attempt failed"
                    );
                    if !error.is_retryable() || attempt >= max_attempts {
                        return Err(RemoteFailure {
                            error,
                            attempts: attempt,
                        });
                    }
                    let delay = self.policy.backoff_before(attempt + 1);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// reqwest-backed transport. One client is shared; each call owns its request.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(
                "company-directory-aggregator/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn get_records(
        &self,
        source: &SourceDescriptor,
        timeout: Duration,
    ) -> Result<Vec<EmployeeRecord>, FetchError> {
        let url = match &source.endpoint {
            Endpoint::Remote(url) => url.clone(),
            Endpoint::Local => return Err(FetchError::NotRemote(source.id.clone())),
        };

        let request = self
            .client
            .get(url)
            .bearer_auth(source.credential.expose())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");

        let resp = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => return Err(FetchError::Timeout { after: timeout }),
            Ok(Err(e)) => return Err(classify_reqwest(e, timeout)),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = match tokio::time::timeout(timeout, resp.bytes()).await {
            Err(_) => return Err(FetchError::Timeout { after: timeout }),
            Ok(Err(e)) => return Err(classify_reqwest(e, timeout)),
            Ok(Ok(b)) => b,
        };

        decode_records(&body, &source.id)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn classify_reqwest(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout { after: timeout }
    } else if e.is_decode() {
        FetchError::Decode(e.to_string())
    } else {
        FetchError::Connection(e.to_string())
    }
}

#[derive(Deserialize)]
struct WireRecord {
    name: String,
    email: String,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    company: Option<String>,
}

/// Parse a peer body: a JSON array of record objects. Records without a
/// `company` are attributed to `source_id`.
pub fn decode_records(body: &[u8], source_id: &str) -> Result<Vec<EmployeeRecord>, FetchError> {
    let rows: Vec<WireRecord> =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    Ok(rows
        .into_iter()
        .map(|w| EmployeeRecord {
            name: w.name,
            email: w.email,
            department: w.department.unwrap_or_default(),
            company: w
                .company
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| source_id.to_string()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Credential;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed script of per-attempt results.
    struct Scripted {
        script: Mutex<VecDeque<Result<Vec<EmployeeRecord>, FetchError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: Vec<Result<Vec<EmployeeRecord>, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PeerTransport for Scripted {
        async fn get_records(
            &self,
            _source: &SourceDescriptor,
            _timeout: Duration,
        ) -> Result<Vec<EmployeeRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Connection("script exhausted".into())))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn peer() -> SourceDescriptor {
        SourceDescriptor {
            id: "B".into(),
            display_name: "Company B".into(),
            endpoint: Endpoint::Remote("http://b.test/api/users".parse().unwrap()),
            credential: Credential::new("kb"),
            is_local: false,
        }
    }

    fn no_backoff() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    fn refused() -> Result<Vec<EmployeeRecord>, FetchError> {
        Err(FetchError::Connection("connection refused".into()))
    }

    #[tokio::test]
    async fn http_error_status_is_not_retried() {
        let t = Arc::new(Scripted::new(vec![
            Err(FetchError::HttpStatus { status: 500 }),
            Ok(vec![]),
        ]));
        let f = RemoteFetcher::new(t.clone(), no_backoff());
        let err = f.fetch_remote(&peer()).await.unwrap_err();
        assert_eq!(err.error, FetchError::HttpStatus { status: 500 });
        assert_eq!(err.attempts, 1);
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn decode_error_is_terminal() {
        let t = Arc::new(Scripted::new(vec![Err(FetchError::Decode("eof".into()))]));
        let f = RemoteFetcher::new(t.clone(), no_backoff());
        let err = f.fetch_remote(&peer()).await.unwrap_err();
        assert!(matches!(err.error, FetchError::Decode(_)));
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_twice_then_success_on_third_attempt() {
        let rec = EmployeeRecord::new("Sarah Johnson", "sarah@b.test", "HR", "B");
        let t = Arc::new(Scripted::new(vec![refused(), refused(), Ok(vec![rec.clone()])]));
        let f = RemoteFetcher::new(t.clone(), no_backoff());
        let ok = f.fetch_remote(&peer()).await.unwrap();
        assert_eq!(ok.records, vec![rec]);
        assert_eq!(ok.attempts, 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_returns_last_error() {
        let t = Arc::new(Scripted::new(vec![
            refused(),
            refused(),
            Err(FetchError::Timeout {
                after: Duration::from_secs(30),
            }),
            Ok(vec![]),
        ]));
        let f = RemoteFetcher::new(t.clone(), no_backoff());
        let err = f.fetch_remote(&peer()).await.unwrap_err();
        assert!(matches!(err.error, FetchError::Timeout { .. }));
        assert_eq!(err.attempts, 3);
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_between_attempts() {
        let t = Arc::new(Scripted::new(vec![refused(), refused(), Ok(vec![])]));
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            ..no_backoff()
        };
        let f = RemoteFetcher::new(t, policy);
        let start = tokio::time::Instant::now();
        f.fetch_remote(&peer()).await.unwrap();
        // 100ms before attempt 2, 200ms before attempt 3
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(300), "waited {waited:?}");
        assert!(waited < Duration::from_millis(350), "waited {waited:?}");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = RetryPolicy {
            timeout: Duration::from_secs(1),
            max_attempts: 6,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(1),
        };
        assert_eq!(p.backoff_before(1), Duration::ZERO);
        assert_eq!(p.backoff_before(2), Duration::from_millis(250));
        assert_eq!(p.backoff_before(3), Duration::from_millis(500));
        assert_eq!(p.backoff_before(4), Duration::from_secs(1));
        assert_eq!(p.backoff_before(6), Duration::from_secs(1));
        // 6 attempts * 2s + (250 + 500 + 1000 + 1000 + 1000)ms
        assert_eq!(p.worst_case(), Duration::from_millis(12_000 + 3_750));
    }

    #[test]
    fn worst_case_saturates_instead_of_overflowing() {
        let p = RetryPolicy {
            timeout: Duration::from_secs(5_000_000_000_000_000_000),
            max_attempts: u32::MAX,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::MAX,
        };
        assert_eq!(p.worst_case(), Duration::MAX);
    }

    #[tokio::test]
    async fn local_descriptor_is_rejected_without_retry() {
        let local = SourceDescriptor {
            endpoint: Endpoint::Local,
            is_local: true,
            ..peer()
        };
        let transport = HttpTransport::new().unwrap();
        let err = transport
            .get_records(&local, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::NotRemote("B".into()));
        assert!(!err.is_retryable());

        let f = RemoteFetcher::new(Arc::new(transport), no_backoff());
        let failure = f.fetch_remote(&local).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
    }

    #[test]
    fn decode_fills_missing_company_and_rejects_non_arrays() {
        let body = br#"[
            {"name":"Mary Smith","email":"mary@b.test","department":"Engineering"},
            {"name":"John Wang","email":"john@b.test","department":"Marketing","company":"B"}
        ]"#;
        let rows = decode_records(body, "B").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.company == "B"));

        assert!(matches!(
            decode_records(br#"{"users":[]}"#, "B"),
            Err(FetchError::Decode(_))
        ));
        assert!(matches!(
            decode_records(br#"[{"name":"no email"}]"#, "B"),
            Err(FetchError::Decode(_))
        ));
    }
}
