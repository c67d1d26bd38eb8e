// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod remote;
pub mod store;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::aggregate::{Aggregator, CancelHandle, Deadline};
pub use crate::api::{router, AppState};
pub use crate::error::{ConfigError, FetchError, StorageError};
pub use crate::registry::{SourceDescriptor, SourceRegistry};
pub use crate::types::{AggregatedResult, EmployeeRecord, FetchOutcome, FetchStatus};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the tracing subscriber. `LOG_FORMAT=json` selects JSON lines,
/// anything else the compact formatter. Filter from `RUST_LOG`, defaulting to
/// `directory_aggregator=info,aggregate=info,warn`.
///
/// Safe to call when a subscriber is already installed (e.g. by the
/// deployment runtime); the second install is skipped.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("directory_aggregator=info,aggregate=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
