// tests/aggregate_scenario.rs
//
// Aggregator behaviour against a scripted peer transport, on tokio's paused
// clock so timing assertions are exact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use directory_aggregator::config::DirectoryConfig;
use directory_aggregator::remote::{PeerTransport, RemoteFetcher, RetryPolicy};
use directory_aggregator::store::MemoryStore;
use directory_aggregator::{
    Aggregator, EmployeeRecord, FetchError, FetchStatus, SourceDescriptor, SourceRegistry,
};

#[derive(Clone)]
enum Behaviour {
    Refused,
    /// Sleep, then return `n` records.
    Slow(Duration, usize),
    /// Never answers within the per-attempt timeout.
    Hang,
    /// Fail with this status on the first call, succeed afterwards.
    StatusOnce(u16),
    /// Refuse the first `n` calls, then return one record.
    RefuseFirst(u32),
}

struct FakePeers {
    behaviour: HashMap<String, Behaviour>,
    calls: Mutex<HashMap<String, u32>>,
}

impl FakePeers {
    fn new(pairs: &[(&str, Behaviour)]) -> Self {
        Self {
            behaviour: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls(&self, id: &str) -> u32 {
        *self.calls.lock().unwrap().get(id).unwrap_or(&0)
    }
}

fn records(source: &str, n: usize) -> Vec<EmployeeRecord> {
    (0..n)
        .map(|i| {
            EmployeeRecord::new(
                &format!("Person {i}"),
                &format!("p{i}@{}.test", source.to_lowercase()),
                "Engineering",
                source,
            )
        })
        .collect()
}

#[async_trait]
impl PeerTransport for FakePeers {
    async fn get_records(
        &self,
        source: &SourceDescriptor,
        timeout: Duration,
    ) -> Result<Vec<EmployeeRecord>, FetchError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let c = calls.entry(source.id.clone()).or_insert(0);
            *c += 1;
            *c
        };
        match self.behaviour.get(&source.id).cloned() {
            Some(Behaviour::Refused) | None => Err(FetchError::Connection("connection refused".into())),
            Some(Behaviour::Slow(d, n)) => {
                tokio::time::sleep(d).await;
                Ok(records(&source.id, n))
            }
            Some(Behaviour::Hang) => {
                let _ = tokio::time::timeout(timeout, std::future::pending::<()>()).await;
                Err(FetchError::Timeout { after: timeout })
            }
            Some(Behaviour::StatusOnce(status)) if call == 1 => Err(FetchError::HttpStatus { status }),
            Some(Behaviour::StatusOnce(_)) => Ok(records(&source.id, 1)),
            Some(Behaviour::RefuseFirst(n)) if call <= n => {
                Err(FetchError::Connection("connection refused".into()))
            }
            Some(Behaviour::RefuseFirst(_)) => Ok(records(&source.id, 1)),
        }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Registry with `local` as the current company and every other id as a peer.
fn registry(local: &str, ids: &[&str]) -> Arc<SourceRegistry> {
    let mut toml = format!("current_company = \"{local}\"\n");
    for id in ids {
        let endpoint = if *id == local {
            "local".to_string()
        } else {
            format!("http://{}.example.test/api/users", id.to_lowercase())
        };
        toml.push_str(&format!(
            "\n[[companies]]\nid = \"{id}\"\nname = \"Company {id}\"\napi_endpoint = \"{endpoint}\"\napi_key = \"key-{id}\"\n"
        ));
    }
    let cfg = DirectoryConfig::from_toml_str_with_env(&toml, |_| None).expect("config");
    Arc::new(SourceRegistry::from_config(&cfg).expect("registry"))
}

fn policy(timeout: Duration, backoff_base: Duration) -> RetryPolicy {
    RetryPolicy {
        timeout,
        max_attempts: 3,
        backoff_base,
        backoff_max: Duration::from_secs(2),
    }
}

#[tokio::test(start_paused = true)]
async fn partial_failure_scenario_preserves_order_and_runs_concurrently() {
    let peers = Arc::new(FakePeers::new(&[
        ("B", Behaviour::Refused),
        ("C", Behaviour::Slow(Duration::from_millis(800), 3)),
    ]));
    let store = MemoryStore::with_records(records("A", 2));
    let agg = Aggregator::new(
        registry("A", &["A", "B", "C"]),
        Arc::new(store),
        RemoteFetcher::new(
            peers.clone(),
            policy(Duration::from_secs(30), Duration::from_millis(250)),
        ),
    );

    let start = Instant::now();
    let res = agg.aggregate("admin").await;
    let elapsed = start.elapsed();

    let summary: Vec<_> = res
        .outcomes
        .iter()
        .map(|o| (o.source.as_str(), o.status, o.records.len()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("A", FetchStatus::Ok, 2),
            ("B", FetchStatus::Error, 0),
            ("C", FetchStatus::Ok, 3),
        ]
    );
    assert_eq!(peers.calls("B"), 3, "connection errors are retried");

    // B spends 250ms + 500ms in backoff, C 800ms in flight: bounded by the
    // slower of the two, not their sum.
    assert!(elapsed >= Duration::from_millis(800), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(900), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn peer_timing_out_every_attempt_is_reported_as_timeout() {
    let peers = Arc::new(FakePeers::new(&[
        ("B", Behaviour::Hang),
        ("C", Behaviour::Slow(Duration::from_millis(10), 2)),
    ]));
    let agg = Aggregator::new(
        registry("A", &["A", "B", "C"]),
        Arc::new(MemoryStore::with_records(records("A", 1))),
        RemoteFetcher::new(peers.clone(), policy(Duration::from_secs(1), Duration::ZERO)),
    );

    let res = agg.aggregate("admin").await;
    let b = res.outcome("B").unwrap();
    assert_eq!(b.status, FetchStatus::Timeout);
    assert!(b.records.is_empty());
    assert_eq!(b.attempts, 3);
    assert_eq!(peers.calls("B"), 3);

    assert_eq!(res.outcome("A").unwrap().status, FetchStatus::Ok);
    let c = res.outcome("C").unwrap();
    assert_eq!(c.status, FetchStatus::Ok);
    assert_eq!(c.records.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn http_500_is_attempted_exactly_once() {
    let peers = Arc::new(FakePeers::new(&[("B", Behaviour::StatusOnce(500))]));
    let agg = Aggregator::new(
        registry("A", &["A", "B"]),
        Arc::new(MemoryStore::new()),
        RemoteFetcher::new(peers.clone(), policy(Duration::from_secs(30), Duration::ZERO)),
    );

    let res = agg.aggregate("admin").await;
    let b = res.outcome("B").unwrap();
    assert_eq!(b.status, FetchStatus::Error);
    assert_eq!(b.attempts, 1);
    assert!(b.error.as_deref().unwrap_or_default().contains("500"));
    assert_eq!(peers.calls("B"), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_twice_then_ok_within_three_attempts() {
    let peers = Arc::new(FakePeers::new(&[("B", Behaviour::RefuseFirst(2))]));
    let agg = Aggregator::new(
        registry("A", &["A", "B"]),
        Arc::new(MemoryStore::new()),
        RemoteFetcher::new(peers.clone(), policy(Duration::from_secs(30), Duration::ZERO)),
    );

    let res = agg.aggregate("admin").await;
    let b = res.outcome("B").unwrap();
    assert_eq!(b.status, FetchStatus::Ok);
    assert_eq!(b.attempts, 3);
    assert_eq!(b.records.len(), 1);
    assert!(b.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn one_outcome_per_source_whatever_fails() {
    let all = ["A", "B", "C", "D", "E", "F"];
    for n in 1..=all.len() {
        let ids = &all[..n];
        // Every peer fails, alternating between refusal and hanging.
        let behaviours: Vec<(&str, Behaviour)> = ids
            .iter()
            .skip(1)
            .enumerate()
            .map(|(i, id)| {
                let b = if i % 2 == 0 {
                    Behaviour::Refused
                } else {
                    Behaviour::Hang
                };
                (*id, b)
            })
            .collect();
        let peers = Arc::new(FakePeers::new(&behaviours));
        let agg = Aggregator::new(
            registry("A", ids),
            Arc::new(MemoryStore::new()),
            RemoteFetcher::new(peers, policy(Duration::from_secs(1), Duration::ZERO)),
        );

        let res = agg.aggregate("admin").await;
        assert_eq!(res.outcomes.len(), n);
        let order: Vec<_> = res.outcomes.iter().map(|o| o.source.as_str()).collect();
        assert_eq!(order, ids);
        assert_eq!(res.failed_sources().len(), n - 1);
        // The empty local partition is ok, distinct from the failed peers.
        assert_eq!(res.outcome("A").unwrap().status, FetchStatus::Ok);
    }
}
