use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

/// Set up logs. JSON output for production, pretty for local work.
pub fn setup_logs(json: bool) {
    let log_level = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "wayfinder_core=debug,wayfinder_router=debug,warn".into());

    let registry = tracing_subscriber::registry().with(log_level);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_target(false),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Install the Prometheus recorder. The handle renders the scrape text at
/// `/wayfinder/metrics`; installation is once-per-process.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::AppState {
            message: format!("failed to install Prometheus recorder: {e}"),
        })
}
