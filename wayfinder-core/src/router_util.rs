use axum::routing::{any, get};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::arns::ArnsResolver;
use crate::cache::ContentCache;
use crate::config::Config;
use crate::endpoints;
use crate::error::Error;
use crate::fetcher::ContentFetcher;
use crate::health::HealthTracker;
use crate::http_client::HttpClientPool;
use crate::pipeline::ContentPipeline;
use crate::registry::{GatewayRegistry, StaticRegistry};
use crate::request_tracker::RequestTracker;
use crate::temperature::TemperatureTracker;
use crate::time_util::epoch_ms;
use crate::verifier::Verifier;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_pool: Arc<HttpClientPool>,
    pub registry: Arc<dyn GatewayRegistry>,
    pub health: Arc<HealthTracker>,
    pub temperature: Arc<TemperatureTracker>,
    pub resolver: Arc<ArnsResolver>,
    pub pipeline: Arc<ContentPipeline>,
    pub tracker: Arc<RequestTracker>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub started_at_ms: u64,
}

pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    /// Wire the full data plane from a validated config, using the static
    /// registry the config describes.
    pub fn new(config: Config) -> Result<Self, Error> {
        let registry: Arc<dyn GatewayRegistry> = Arc::new(StaticRegistry::from_config(&config));
        Self::with_registry(config, registry)
    }

    /// Same, with a caller-supplied registry provider (network registries,
    /// test doubles).
    pub fn with_registry(
        config: Config,
        registry: Arc<dyn GatewayRegistry>,
    ) -> Result<Self, Error> {
        let http_pool = Arc::new(HttpClientPool::new(config.http.clone()));
        let health = Arc::new(HealthTracker::new(config.health.clone()));
        let temperature = Arc::new(TemperatureTracker::new(config.temperature.clone()));

        let resolver = Arc::new(ArnsResolver::new(
            Arc::clone(&http_pool),
            Arc::clone(&registry),
            &config,
        ));
        let fetcher = ContentFetcher::new(
            Arc::clone(&http_pool),
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&temperature),
            &config,
        );
        let verifier = Verifier::new(Arc::clone(&http_pool), Arc::clone(&registry), &config);
        let content_cache = ContentCache::new(&config.cache)?;
        let pipeline = Arc::new(ContentPipeline::new(
            fetcher,
            verifier,
            content_cache,
            Arc::clone(&health),
            Arc::clone(&temperature),
            &config,
        ));

        Ok(Self {
            config: Arc::new(config),
            http_pool,
            registry,
            health,
            temperature,
            resolver,
            pipeline,
            tracker: Arc::new(RequestTracker::new()),
            metrics_handle: None,
            started_at_ms: epoch_ms(),
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Reserved paths get explicit routes; everything else falls through to
/// the content pipeline, which routes on host + path shape.
pub fn build_router(state: AppStateData) -> Router {
    let mut router = Router::new()
        .route("/favicon.ico", get(endpoints::fallback::favicon_handler))
        .route("/wayfinder/health", get(endpoints::status::health_handler))
        .route("/wayfinder/info", get(endpoints::status::info_handler))
        .route("/wayfinder/stats", get(endpoints::status::stats_handler))
        .route("/wayfinder/metrics", get(endpoints::status::metrics_handler));

    if state.config.graphql_gateway.is_some() {
        router = router.route("/graphql", any(endpoints::proxy::graphql_handler));
    }

    router
        .fallback(endpoints::proxy::request_handler)
        .with_state(state)
}
