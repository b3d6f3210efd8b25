use futures::future::join_all;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::address::{ArnsName, TxId};
use crate::cache::{LruCache, LruOptions};
use crate::config::Config;
use crate::error::Error;
use crate::http_client::{FetchRequest, HttpClientPool};
use crate::registry::{trusted_verification_set, GatewayRegistry};
use crate::single_flight::SingleFlight;
use crate::time_util::epoch_ms;

/// Headers a trusted gateway answers name queries with.
pub const RESOLVED_ID_HEADER: &str = "x-arns-resolved-id";
pub const TTL_SECONDS_HEADER: &str = "x-arns-ttl-seconds";
pub const PROCESS_ID_HEADER: &str = "x-arns-resolved-process-id";

/// One agreed-upon name binding.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub txid: TxId,
    pub ttl_ms: u64,
    pub resolved_at_ms: u64,
    pub process_id: Option<String>,
}

impl Resolution {
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.resolved_at_ms) >= self.ttl_ms
    }
}

/// Resolves names by asking *every* trusted gateway and accepting only a
/// unanimous answer from at least `consensus_threshold` of them. A split
/// between trusted sources is treated as evidence of compromise, never
/// arbitrated.
pub struct ArnsResolver {
    pool: Arc<HttpClientPool>,
    registry: Arc<dyn GatewayRegistry>,
    cache: Arc<LruCache<String, Resolution>>,
    flights: SingleFlight<Resolution>,
    static_verification: Vec<Url>,
    consensus_threshold: usize,
    timeout_ms: u64,
    default_ttl_ms: u64,
}

impl ArnsResolver {
    pub fn new(
        pool: Arc<HttpClientPool>,
        registry: Arc<dyn GatewayRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            registry,
            cache: Arc::new(LruCache::new(LruOptions {
                max_entries: config.cache.resolution_max_entries,
                ..LruOptions::default()
            })),
            flights: SingleFlight::new(),
            static_verification: config.verification_gateways.clone(),
            consensus_threshold: config.consensus_threshold,
            timeout_ms: config.arns_timeout_ms,
            default_ttl_ms: config.cache.resolution_default_ttl_ms,
        }
    }

    pub async fn resolve(&self, name: &ArnsName) -> Result<Resolution, Error> {
        let key = name.as_str().to_string();
        if let Some(hit) = self.cache.get(&key) {
            if !hit.is_stale(epoch_ms()) {
                return Ok(hit);
            }
            self.cache.remove(&key);
        }

        let pool = Arc::clone(&self.pool);
        let registry = Arc::clone(&self.registry);
        let cache = Arc::clone(&self.cache);
        let static_verification = self.static_verification.clone();
        let consensus_threshold = self.consensus_threshold;
        let timeout_ms = self.timeout_ms;
        let default_ttl_ms = self.default_ttl_ms;
        let owned_name = key.clone();

        self.flights
            .dedupe(&key, move || {
                run_consensus(
                    pool,
                    registry,
                    cache,
                    static_verification,
                    owned_name,
                    consensus_threshold,
                    timeout_ms,
                    default_ttl_ms,
                )
            })
            .await
    }

    /// Drop a cached resolution before its TTL (e.g. on operator request).
    pub fn invalidate(&self, name: &ArnsName) {
        self.cache.remove(&name.as_str().to_string());
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_consensus(
    pool: Arc<HttpClientPool>,
    registry: Arc<dyn GatewayRegistry>,
    cache: Arc<LruCache<String, Resolution>>,
    static_verification: Vec<Url>,
    name: String,
    consensus_threshold: usize,
    timeout_ms: u64,
    default_ttl_ms: u64,
) -> Result<Resolution, Error> {
    // Another waiter may have filled the cache while we queued.
    if let Some(hit) = cache.get(&name) {
        if !hit.is_stale(epoch_ms()) {
            return Ok(hit);
        }
    }

    let trusted = trusted_verification_set(registry.as_ref(), &static_verification).await;
    if trusted.is_empty() {
        return Err(Error::ArnsResolutionFailed {
            name,
            message: "no verification gateways available".to_string(),
        });
    }

    let queries = trusted.iter().map(|gateway| {
        let pool = &pool;
        let name = &name;
        async move { query_gateway(pool, gateway, name, timeout_ms).await }
    });
    let answers: Vec<GatewayAnswer> = join_all(queries).await.into_iter().flatten().collect();

    if answers.is_empty() || answers.len() < consensus_threshold {
        return Err(Error::ArnsResolutionFailed {
            name,
            message: format!(
                "only {} of {} trusted gateways answered (threshold {})",
                answers.len(),
                trusted.len(),
                consensus_threshold
            ),
        });
    }

    let mut resolved_ids: Vec<String> =
        answers.iter().map(|a| a.txid.as_str().to_string()).collect();
    resolved_ids.sort();
    resolved_ids.dedup();
    if resolved_ids.len() > 1 {
        return Err(Error::ArnsConsensusMismatch { name, resolved_ids });
    }

    let ttl_ms = answers
        .iter()
        .filter_map(|a| a.ttl_seconds)
        .min()
        .map(|seconds| seconds * 1000)
        .unwrap_or(default_ttl_ms);
    let resolution = Resolution {
        txid: answers[0].txid.clone(),
        ttl_ms,
        resolved_at_ms: epoch_ms(),
        process_id: answers.iter().find_map(|a| a.process_id.clone()),
    };
    cache.insert(
        name.clone(),
        resolution.clone(),
        Some(Duration::from_millis(ttl_ms)),
    );
    tracing::debug!(
        name = %name,
        txid = %resolution.txid,
        ttl_ms,
        agreed = answers.len(),
        "ArNS consensus reached"
    );
    Ok(resolution)
}

struct GatewayAnswer {
    txid: TxId,
    ttl_seconds: Option<u64>,
    process_id: Option<String>,
}

async fn query_gateway(
    pool: &HttpClientPool,
    gateway: &Url,
    name: &str,
    timeout_ms: u64,
) -> Option<GatewayAnswer> {
    let url = name_url(gateway, name).ok()?;
    let response = pool
        .fetch(FetchRequest::head(url, Duration::from_millis(timeout_ms)))
        .await
        .ok()?;

    let headers = response.headers();
    let resolved_id = headers.get(RESOLVED_ID_HEADER)?.to_str().ok()?;
    let txid = TxId::from_str(resolved_id).ok()?;
    let ttl_seconds = headers
        .get(TTL_SECONDS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let process_id = headers
        .get(PROCESS_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Some(GatewayAnswer {
        txid,
        ttl_seconds,
        process_id,
    })
}

/// `https://<name>.<gateway-host>/`, preserving scheme and port.
fn name_url(gateway: &Url, name: &str) -> Result<Url, Error> {
    let host = gateway.host_str().ok_or_else(|| Error::Internal {
        message: format!("gateway `{gateway}` has no host"),
    })?;
    let raw = match gateway.port() {
        Some(port) => format!("{}://{name}.{host}:{port}/", gateway.scheme()),
        None => format!("{}://{name}.{host}/", gateway.scheme()),
    };
    Url::parse(&raw).map_err(|e| Error::Internal {
        message: format!("failed to build name URL for `{name}` on `{gateway}`: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpClientSettings;
    use crate::registry::StaticRegistry;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;

    const TX1: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const TX2: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBA";

    fn answer(txid: &'static str, ttl: Option<&'static str>) -> Router {
        Router::new().route(
            "/",
            get(move || async move {
                let mut headers = HeaderMap::new();
                headers.insert(RESOLVED_ID_HEADER, txid.parse().unwrap());
                if let Some(ttl) = ttl {
                    headers.insert(TTL_SECONDS_HEADER, ttl.parse().unwrap());
                }
                (headers, "")
            }),
        )
    }

    fn silent() -> Router {
        Router::new().route("/", get(|| async { "" }))
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    /// Builds a resolver whose trusted gateways are local mocks, reachable
    /// through subdomain-style hosts via DNS overrides.
    async fn resolver_with(mocks: Vec<Router>) -> ArnsResolver {
        let mut gateways = Vec::new();
        let mut overrides = Vec::new();
        for (i, router) in mocks.into_iter().enumerate() {
            let addr = serve(router).await;
            let host = format!("gw{i}.wayfinder.test");
            overrides.push((host.clone(), addr));
            overrides.push((format!("ardrive.{host}"), addr));
            gateways.push(Url::parse(&format!("http://{host}:{}", addr.port())).unwrap());
        }
        let pool = Arc::new(HttpClientPool::new(HttpClientSettings {
            resolve_overrides: overrides,
            ..HttpClientSettings::default()
        }));
        let registry = Arc::new(StaticRegistry::new(vec![], gateways.clone()));
        let config = Config {
            verification_gateways: gateways,
            consensus_threshold: 2,
            arns_timeout_ms: 2_000,
            ..Config::default()
        };
        ArnsResolver::new(pool, registry, &config)
    }

    #[tokio::test]
    async fn unanimous_answers_resolve_with_min_ttl() {
        let resolver = resolver_with(vec![
            answer(TX1, Some("60")),
            answer(TX1, Some("30")),
            answer(TX1, None),
        ])
        .await;
        let name = ArnsName::from_str("ardrive").unwrap();
        let resolution = resolver.resolve(&name).await.unwrap();
        assert_eq!(resolution.txid.as_str(), TX1);
        assert_eq!(resolution.ttl_ms, 30_000);
        assert_eq!(resolver.cached_count(), 1);
    }

    #[tokio::test]
    async fn split_answers_are_a_consensus_mismatch() {
        let resolver = resolver_with(vec![
            answer(TX1, Some("60")),
            answer(TX1, Some("60")),
            answer(TX2, Some("60")),
        ])
        .await;
        let name = ArnsName::from_str("ardrive").unwrap();
        let result = resolver.resolve(&name).await;
        assert!(matches!(result, Err(Error::ArnsConsensusMismatch { .. })));
        assert_eq!(resolver.cached_count(), 0, "nothing may be cached");
    }

    #[tokio::test]
    async fn too_few_answers_fail_resolution() {
        let resolver = resolver_with(vec![answer(TX1, Some("60")), silent(), silent()]).await;
        let name = ArnsName::from_str("ardrive").unwrap();
        let result = resolver.resolve(&name).await;
        assert!(matches!(result, Err(Error::ArnsResolutionFailed { .. })));
    }

    #[tokio::test]
    async fn absent_ttls_fall_back_to_the_default() {
        let resolver = resolver_with(vec![answer(TX1, None), answer(TX1, None)]).await;
        let name = ArnsName::from_str("ardrive").unwrap();
        let resolution = resolver.resolve(&name).await.unwrap();
        assert_eq!(resolution.ttl_ms, 5 * 60 * 1000);
    }

    #[tokio::test]
    async fn second_lookup_hits_the_cache() {
        let resolver = resolver_with(vec![answer(TX1, Some("60")), answer(TX1, Some("60"))]).await;
        let name = ArnsName::from_str("ardrive").unwrap();
        let first = resolver.resolve(&name).await.unwrap();
        let second = resolver.resolve(&name).await.unwrap();
        assert_eq!(first.resolved_at_ms, second.resolved_at_ms);

        resolver.invalidate(&name);
        assert_eq!(resolver.cached_count(), 0);
    }

    #[test]
    fn name_urls_keep_scheme_and_port() {
        let gateway = Url::parse("http://gw.example:8080").unwrap();
        let url = name_url(&gateway, "ardrive").unwrap();
        assert_eq!(url.as_str(), "http://ardrive.gw.example:8080/");

        let gateway = Url::parse("https://gw.example").unwrap();
        let url = name_url(&gateway, "ardrive").unwrap();
        assert_eq!(url.as_str(), "https://ardrive.gw.example/");
    }

    #[test]
    fn staleness_follows_ttl() {
        let resolution = Resolution {
            txid: TxId::from_str(TX1).unwrap(),
            ttl_ms: 1_000,
            resolved_at_ms: 10_000,
            process_id: None,
        };
        assert!(!resolution.is_stale(10_500));
        assert!(resolution.is_stale(11_000));
    }
}
