//! Company directory service: binary entrypoint.
//! Loads configuration once, builds the source registry and aggregator, and
//! serves the peer API plus the admin directory view.

use directory_aggregator::{api, config::DirectoryConfig, metrics::Metrics, AppState};
use shuttle_axum::ShuttleAxum;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    directory_aggregator::init_tracing();

    // Malformed configuration is fatal here, never per request.
    let cfg = DirectoryConfig::load_default().map_err(anyhow::Error::from)?;
    let state = AppState::from_config(&cfg)?;
    let metrics = Metrics::init(state.aggregator.registry())?;

    tracing::info!(
        current = %cfg.current_company,
        sources = state.aggregator.registry().len(),
        timeout_secs = cfg.api.timeout_secs,
        attempts = cfg.api.retry_attempts,
        "directory service configured"
    );

    let router = api::router(state).merge(metrics.router());
    Ok(router.into())
}
