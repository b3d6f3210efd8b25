use clap::{Parser, ValueEnum};
use std::fmt::Display;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use std::sync::Arc;
use wayfinder_core::config::{Config, GatewaySource};
use wayfinder_core::http_client::HttpClientPool;
use wayfinder_core::observability;
use wayfinder_core::ping::PingService;
use wayfinder_core::registry::{NetworkRegistry, DEFAULT_REGISTRY_URL};
use wayfinder_core::router_util::{build_router, AppStateData};
use wayfinder_core::WAYFINDER_VERSION;

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Sets the log format used for all router logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,

    /// Validate the environment configuration and exit.
    #[arg(long)]
    check_config: bool,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    observability::setup_logs(matches!(args.log_format, LogFormat::Json));

    // The router must never run on after undefined state: any panic is
    // logged and the process exits so the orchestrator restarts it clean.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!("panic: {info}");
        std::process::exit(1);
    }));

    let config = Config::from_env().expect_pretty("Invalid configuration");
    if args.check_config {
        tracing::info!("configuration is valid");
        return;
    }

    tracing::info!("Starting Wayfinder Router {WAYFINDER_VERSION}");

    let metrics_handle =
        observability::setup_metrics().expect_pretty("Failed to set up metrics");
    let state = match config.gateway_source {
        GatewaySource::Static => AppStateData::new(config),
        GatewaySource::Network => {
            let registry_url = config
                .registry_url
                .clone()
                .unwrap_or_else(|| {
                    url::Url::parse(DEFAULT_REGISTRY_URL)
                        .expect_pretty("invalid default registry URL")
                });
            let pool = Arc::new(HttpClientPool::new(config.http.clone()));
            let registry = Arc::new(NetworkRegistry::new(pool, registry_url, &config));
            AppStateData::with_registry(config, registry)
        }
    }
    .expect_pretty("Failed to initialize application state")
    .with_metrics(metrics_handle);

    // Background services hang off one token so shutdown stops them all
    // without waiting for their next tick.
    let background = CancellationToken::new();
    if state.config.ping.enabled {
        let service = Arc::new(PingService::new(
            state.http_pool.clone(),
            state.registry.clone(),
            state.health.clone(),
            state.temperature.clone(),
            state.config.ping.clone(),
        ));
        service.spawn(background.clone());
    }

    let router = build_router(state.clone()).layer(
        TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)),
    );

    let bind_address = state.config.bind_address;
    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to {bind_address}: {e}. Tip: ensure no other process is using port {}.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    tracing::info!("Wayfinder Router is listening on {actual_bind_address}");
    tracing::info!("├ Mode: {}", state.config.mode);
    tracing::info!("├ Routing strategy: {}", state.config.routing_strategy);
    tracing::info!("├ Base domain: {}", state.config.base_domain);
    if state.config.verification_enabled {
        tracing::info!("├ Verification: enabled");
    } else {
        tracing::info!("├ Verification: DISABLED, content is served unverified");
    }
    match &state.config.cache.content_path {
        Some(path) => tracing::info!("└ Content cache: disk ({})", path.display()),
        None => tracing::info!("└ Content cache: memory only"),
    }

    let shutdown = {
        let state = state.clone();
        let background = background.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, draining in-flight requests");

            let shutdown_timeout_ms = state.config.shutdown_timeout_ms;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(shutdown_timeout_ms)).await;
                tracing::error!("shutdown timeout exceeded, forcing exit");
                std::process::exit(1);
            });

            let drain_timeout = Duration::from_millis(state.config.drain_timeout_ms);
            match tokio::time::timeout(drain_timeout, state.tracker.start_draining()).await {
                Ok(()) => tracing::info!("all in-flight requests drained"),
                Err(_) => tracing::warn!(
                    in_flight = state.tracker.in_flight(),
                    "drain timeout elapsed with requests still in flight"
                ),
            }
            background.cancel();
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .expect_pretty("Failed to start server");

    tracing::info!("Wayfinder Router stopped");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// We don't allow panic, escape, unwrap, or similar methods in the
/// codebase, except for this private helper used only in main.rs during
/// initialization. After initialization, all code handles errors
/// gracefully.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}
