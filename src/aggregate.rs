// src/aggregate.rs
//! Multi-source aggregation.
//!
//! One fetch per registered source, all in flight at once, reassembled in
//! registry order. A failing source only ever affects its own outcome, and
//! `aggregate` itself cannot fail.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::registry::{SourceDescriptor, SourceRegistry};
use crate::remote::RemoteFetcher;
use crate::store::{fetch_local, RecordStore};
use crate::types::{AggregatedResult, EmployeeRecord, FetchOutcome, FetchStatus};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "directory_aggregate_requests_total",
            "Aggregations started."
        );
        describe_counter!(
            "directory_source_fetch_total",
            "Per-source fetch outcomes by status."
        );
        describe_counter!(
            "directory_remote_attempts_total",
            "HTTP attempts made against peers."
        );
        describe_histogram!(
            "directory_source_fetch_ms",
            "Per-source fetch time in milliseconds."
        );
    });
}

/// Trigger for abandoning an in-progress aggregation from outside.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// When outstanding fetches should be given up: an instant, a cancel signal, both or neither.
#[derive(Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Deadline {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn at(at: Instant) -> Self {
        Self {
            at: Some(at),
            cancel: None,
        }
    }

    pub fn after(d: Duration) -> Self {
        Self::at(Instant::now() + d)
    }

    pub fn with_cancel(mut self, handle: &CancelHandle) -> Self {
        self.cancel = Some(handle.subscribe());
        self
    }

    /// Resolves once the instant passes or cancellation is signalled.
    async fn expired(self) {
        let Deadline { at, cancel } = self;

        let timer = async move {
            match at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async move {
            let Some(mut rx) = cancel else {
                return std::future::pending::<()>().await;
            };
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Handle dropped without cancelling.
                    return std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = timer => {}
            _ = cancelled => {}
        }
    }
}

pub struct Aggregator {
    registry: Arc<SourceRegistry>,
    store: Arc<dyn RecordStore>,
    fetcher: RemoteFetcher,
    default_deadline: Duration,
}

impl Aggregator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        store: Arc<dyn RecordStore>,
        fetcher: RemoteFetcher,
    ) -> Self {
        let default_deadline = fetcher.policy().worst_case();
        Self {
            registry,
            store,
            fetcher,
            default_deadline,
        }
    }

    pub fn with_default_deadline(mut self, d: Duration) -> Self {
        self.default_deadline = d;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Aggregate with the configured overall deadline.
    pub async fn aggregate(&self, requesting_user: &str) -> AggregatedResult {
        self.aggregate_with(requesting_user, Deadline::after(self.default_deadline))
            .await
    }

    /// Aggregate, abandoning whatever is still outstanding when `deadline`
    /// expires. Abandoned sources are reported as `timeout`.
    pub async fn aggregate_with(&self, requesting_user: &str, deadline: Deadline) -> AggregatedResult {
        ensure_metrics_described();
        counter!("directory_aggregate_requests_total").increment(1);

        let started = Instant::now();
        let fetches = self.registry.resolve_sources().iter().map(|src| {
            let deadline = deadline.clone();
            async move {
                let t0 = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    outcome = self.fetch_one(src, t0) => outcome,
                    _ = deadline.expired() => {
                        tracing::warn!(source = %src.id, "fetch abandoned at aggregate deadline");
                        outcome_for(
                            src,
                            FetchStatus::Timeout,
                            Vec::new(),
                            Some("abandoned: aggregate deadline reached".to_string()),
                            0,
                            t0,
                        )
                    }
                };
                record_outcome_metrics(&outcome);
                outcome
            }
        });

        // join_all keeps input order, so outcomes come back in registry order.
        let outcomes = join_all(fetches).await;

        let result = AggregatedResult {
            requested_by: requesting_user.to_string(),
            generated_at: chrono::Utc::now(),
            outcomes,
        };

        tracing::info!(
            target: "aggregate",
            requested_by = requesting_user,
            sources = result.outcomes.len(),
            failed = ?result.failed_sources(),
            records = result.total_records(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "directory aggregated"
        );
        result
    }

    async fn fetch_one(&self, src: &SourceDescriptor, t0: Instant) -> FetchOutcome {
        if src.is_local {
            return match fetch_local(self.store.as_ref(), &src.id).await {
                Ok(records) => outcome_for(src, FetchStatus::Ok, records, None, 1, t0),
                Err(e) => outcome_for(src, FetchStatus::Error, Vec::new(), Some(e.to_string()), 1, t0),
            };
        }

        match self.fetcher.fetch_remote(src).await {
            Ok(ok) => outcome_for(src, FetchStatus::Ok, ok.records, None, ok.attempts, t0),
            Err(fail) => outcome_for(
                src,
                fail.error.status(),
                Vec::new(),
                Some(fail.error.to_string()),
                fail.attempts,
                t0,
            ),
        }
    }
}

fn outcome_for(
    src: &SourceDescriptor,
    status: FetchStatus,
    records: Vec<EmployeeRecord>,
    error: Option<String>,
    attempts: u32,
    t0: Instant,
) -> FetchOutcome {
    FetchOutcome {
        source: src.id.clone(),
        display_name: src.display_name.clone(),
        status,
        records,
        error,
        attempts,
        elapsed_ms: t0.elapsed().as_millis() as u64,
    }
}

fn record_outcome_metrics(o: &FetchOutcome) {
    counter!(
        "directory_source_fetch_total",
        "source" => o.source.clone(),
        "status" => o.status.as_str()
    )
    .increment(1);
    histogram!("directory_source_fetch_ms").record(o.elapsed_ms as f64);
}
