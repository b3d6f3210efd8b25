use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::error::Error;
use crate::http_client::{FetchRequest, HttpClientPool};
use crate::time_util::epoch_ms;

/// The on-chain gateway registry, served over HTTP by the ArNS service.
pub const DEFAULT_REGISTRY_URL: &str =
    "https://api.arns.app/v1/contract/bLAgYxAdX2Ry-nt6aH2ixgvJXbpsEYm28NgJgyqfs-U/gateways";

/// Well-known gateways used for digest and ArNS cross-checks when neither
/// the provider nor the configuration supplies a verification set.
pub const FALLBACK_VERIFICATION_GATEWAYS: &[&str] = &[
    "https://arweave.net",
    "https://permagate.io",
    "https://vilenarios.com",
];

/// Routing gateways of last resort.
pub const FALLBACK_ROUTING_GATEWAYS: &[&str] = &[
    "https://arweave.net",
    "https://ar-io.dev",
    "https://permagate.io",
];

/// Abstract supplier of the two gateway sets. Routing gateways serve user
/// bytes; verification gateways only supply digests and name resolutions
/// for cross-checking. Refresh cadence and ordering are provider details.
#[async_trait]
pub trait GatewayRegistry: Send + Sync {
    async fn routing_gateways(&self) -> Result<Vec<Url>, Error>;
    async fn verification_gateways(&self) -> Result<Vec<Url>, Error>;
}

/// Registry backed by the configured static lists, falling back to the
/// network defaults when a list is empty.
pub struct StaticRegistry {
    routing: Vec<Url>,
    verification: Vec<Url>,
}

impl StaticRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            routing: with_fallback(&config.routing_gateways, FALLBACK_ROUTING_GATEWAYS),
            verification: with_fallback(
                &config.verification_gateways,
                FALLBACK_VERIFICATION_GATEWAYS,
            ),
        }
    }

    pub fn new(routing: Vec<Url>, verification: Vec<Url>) -> Self {
        Self {
            routing,
            verification,
        }
    }
}

#[async_trait]
impl GatewayRegistry for StaticRegistry {
    async fn routing_gateways(&self) -> Result<Vec<Url>, Error> {
        Ok(self.routing.clone())
    }

    async fn verification_gateways(&self) -> Result<Vec<Url>, Error> {
        Ok(self.verification.clone())
    }
}

#[derive(Debug, Deserialize)]
struct GatewayRecord {
    #[serde(default)]
    settings: GatewaySettings,
    /// Winston stake backing the gateway; higher-staked gateways are
    /// offered to the selector first.
    #[serde(default, rename = "operatorStake")]
    operator_stake: u64,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewaySettings {
    fqdn: Option<String>,
    port: Option<u16>,
    protocol: Option<String>,
}

impl GatewayRecord {
    fn to_url(&self) -> Option<Url> {
        let fqdn = self.settings.fqdn.as_deref()?;
        let protocol = self.settings.protocol.as_deref().unwrap_or("https");
        let raw = match self.settings.port {
            Some(443) if protocol == "https" => format!("{protocol}://{fqdn}"),
            Some(80) if protocol == "http" => format!("{protocol}://{fqdn}"),
            Some(port) => format!("{protocol}://{fqdn}:{port}"),
            None => format!("{protocol}://{fqdn}"),
        };
        Url::parse(&raw).ok()
    }
}

struct RegistrySnapshot {
    routing: Vec<Url>,
    fetched_at_ms: u64,
}

/// Registry that pulls the gateway set from the network's registry
/// endpoint, ordered by stake, cached between refreshes. Verification
/// gateways stay pinned to the configured/static trusted set; trust is
/// never delegated to an on-chain listing.
pub struct NetworkRegistry {
    pool: Arc<HttpClientPool>,
    registry_url: Url,
    refresh_ms: u64,
    timeout_ms: u64,
    fallback: StaticRegistry,
    snapshot: Mutex<Option<RegistrySnapshot>>,
}

impl NetworkRegistry {
    pub fn new(pool: Arc<HttpClientPool>, registry_url: Url, config: &Config) -> Self {
        Self {
            pool,
            registry_url,
            refresh_ms: 10 * 60 * 1000,
            timeout_ms: config.request_timeout_ms,
            fallback: StaticRegistry::from_config(config),
            snapshot: Mutex::new(None),
        }
    }

    async fn refresh(&self) -> Result<Vec<Url>, Error> {
        let response = self
            .pool
            .fetch(FetchRequest::get(
                self.registry_url.clone(),
                Duration::from_millis(self.timeout_ms),
            ))
            .await?;
        if !response.status().is_success() {
            return Err(Error::GatewayRequest {
                message: format!(
                    "registry endpoint {} returned {}",
                    self.registry_url,
                    response.status()
                ),
                status_code: Some(response.status()),
            });
        }
        let records: HashMap<String, GatewayRecord> =
            response.json().await.map_err(|e| Error::GatewayRequest {
                message: format!("unparsable registry response: {e}"),
                status_code: None,
            })?;

        let mut ranked: Vec<(u64, Url)> = records
            .values()
            .filter(|record| {
                record
                    .status
                    .as_deref()
                    .map(|s| s == "joined")
                    .unwrap_or(true)
            })
            .filter_map(|record| record.to_url().map(|url| (record.operator_stake, url)))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(ranked.into_iter().map(|(_, url)| url).collect())
    }
}

#[async_trait]
impl GatewayRegistry for NetworkRegistry {
    async fn routing_gateways(&self) -> Result<Vec<Url>, Error> {
        let now = epoch_ms();
        if let Ok(guard) = self.snapshot.lock() {
            if let Some(snapshot) = guard.as_ref() {
                if now.saturating_sub(snapshot.fetched_at_ms) < self.refresh_ms {
                    return Ok(snapshot.routing.clone());
                }
            }
        }

        match self.refresh().await {
            Ok(routing) if !routing.is_empty() => {
                if let Ok(mut guard) = self.snapshot.lock() {
                    *guard = Some(RegistrySnapshot {
                        routing: routing.clone(),
                        fetched_at_ms: now,
                    });
                }
                Ok(routing)
            }
            Ok(_) => {
                tracing::warn!("network registry returned no gateways, using fallback set");
                self.fallback.routing_gateways().await
            }
            Err(e) => {
                // A stale snapshot beats an empty one.
                if let Ok(guard) = self.snapshot.lock() {
                    if let Some(snapshot) = guard.as_ref() {
                        tracing::warn!("registry refresh failed ({e}), serving stale set");
                        return Ok(snapshot.routing.clone());
                    }
                }
                tracing::warn!("registry refresh failed ({e}), using fallback set");
                self.fallback.routing_gateways().await
            }
        }
    }

    async fn verification_gateways(&self) -> Result<Vec<Url>, Error> {
        self.fallback.verification_gateways().await
    }
}

/// The trusted set used for digests and name resolutions. Fallback order:
/// provider, then the configured static list, then the network constants.
pub async fn trusted_verification_set(
    registry: &dyn GatewayRegistry,
    static_verification: &[Url],
) -> Vec<Url> {
    match registry.verification_gateways().await {
        Ok(list) if !list.is_empty() => list,
        other => {
            if let Err(e) = other {
                tracing::warn!("verification gateway provider failed: {e}");
            }
            if !static_verification.is_empty() {
                static_verification.to_vec()
            } else {
                FALLBACK_VERIFICATION_GATEWAYS
                    .iter()
                    .filter_map(|raw| Url::parse(raw).ok())
                    .collect()
            }
        }
    }
}

/// Canonical identity of a gateway: its origin. Health and temperature
/// records key on this so `https://g.example/` and `https://g.example`
/// share one record.
pub fn gateway_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    }
}

fn with_fallback(configured: &[Url], fallback: &[&str]) -> Vec<Url> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    fallback
        .iter()
        .filter_map(|raw| match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::error!("invalid fallback gateway `{raw}`: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configured_lists_win_over_fallbacks() {
        let config = Config {
            routing_gateways: vec![Url::parse("https://only.example").unwrap()],
            ..Config::default()
        };
        let registry = StaticRegistry::from_config(&config);
        let routing = registry.routing_gateways().await.unwrap();
        assert_eq!(routing.len(), 1);
        assert_eq!(routing[0].as_str(), "https://only.example/");
    }

    #[tokio::test]
    async fn empty_lists_fall_back_to_network_defaults() {
        let registry = StaticRegistry::from_config(&Config::default());
        let verification = registry.verification_gateways().await.unwrap();
        assert_eq!(verification.len(), FALLBACK_VERIFICATION_GATEWAYS.len());
    }

    #[test]
    fn fallback_constants_parse_as_urls() {
        for raw in FALLBACK_VERIFICATION_GATEWAYS
            .iter()
            .chain(FALLBACK_ROUTING_GATEWAYS)
        {
            Url::parse(raw).unwrap();
        }
        Url::parse(DEFAULT_REGISTRY_URL).unwrap();
    }

    #[test]
    fn gateway_records_build_urls_with_conventional_ports_elided() {
        let record: GatewayRecord = serde_json::from_value(serde_json::json!({
            "settings": { "fqdn": "gw.example", "port": 443, "protocol": "https" },
            "operatorStake": 1
        }))
        .unwrap();
        assert_eq!(record.to_url().unwrap().as_str(), "https://gw.example/");

        let record: GatewayRecord = serde_json::from_value(serde_json::json!({
            "settings": { "fqdn": "gw.example", "port": 8080, "protocol": "http" },
        }))
        .unwrap();
        assert_eq!(record.to_url().unwrap().as_str(), "http://gw.example:8080/");
    }

    mod network {
        use super::*;
        use crate::config::HttpClientSettings;
        use crate::http_client::HttpClientPool;
        use axum::routing::get;
        use axum::Json;
        use axum::Router;
        use std::net::SocketAddr;
        use std::sync::Arc;

        async fn serve(router: Router) -> SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            addr
        }

        fn registry_for(addr: SocketAddr) -> NetworkRegistry {
            let pool = Arc::new(HttpClientPool::new(HttpClientSettings::default()));
            let url = Url::parse(&format!("http://{addr}/gateways")).unwrap();
            NetworkRegistry::new(pool, url, &Config::default())
        }

        #[tokio::test]
        async fn gateways_are_ranked_by_stake_and_filtered_by_status() {
            let addr = serve(Router::new().route(
                "/gateways",
                get(|| async {
                    Json(serde_json::json!({
                        "a": { "settings": { "fqdn": "small.example" }, "operatorStake": 10, "status": "joined" },
                        "b": { "settings": { "fqdn": "big.example" }, "operatorStake": 500, "status": "joined" },
                        "c": { "settings": { "fqdn": "gone.example" }, "operatorStake": 900, "status": "leaving" },
                    }))
                }),
            ))
            .await;

            let registry = registry_for(addr);
            let gateways = registry.routing_gateways().await.unwrap();
            assert_eq!(gateways.len(), 2);
            assert_eq!(gateways[0].as_str(), "https://big.example/");
            assert_eq!(gateways[1].as_str(), "https://small.example/");
        }

        #[tokio::test]
        async fn snapshot_is_reused_between_refreshes() {
            let addr = serve(Router::new().route(
                "/gateways",
                get(|| async {
                    Json(serde_json::json!({
                        "a": { "settings": { "fqdn": "gw.example" }, "operatorStake": 1, "status": "joined" },
                    }))
                }),
            ))
            .await;

            let registry = registry_for(addr);
            let first = registry.routing_gateways().await.unwrap();
            let second = registry.routing_gateways().await.unwrap();
            assert_eq!(first, second);
            assert!(registry.snapshot.lock().unwrap().is_some());
        }

        #[tokio::test]
        async fn unreachable_registry_falls_back_to_the_static_set() {
            let pool = Arc::new(HttpClientPool::new(HttpClientSettings {
                connect_timeout_ms: 100,
                ..HttpClientSettings::default()
            }));
            // TEST-NET-1: unroutable.
            let url = Url::parse("http://192.0.2.1:9/gateways").unwrap();
            let registry = NetworkRegistry::new(pool, url, &Config::default());
            let gateways = registry.routing_gateways().await.unwrap();
            assert_eq!(gateways.len(), FALLBACK_ROUTING_GATEWAYS.len());
        }
    }
}
