use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::address::{sandbox_subdomain, ArnsName, TxId};
use crate::config::Config;
use crate::error::Error;
use crate::health::HealthTracker;
use crate::http_client::{FetchRequest, HttpClientPool, RedirectPolicy};
use crate::registry::{gateway_key, GatewayRegistry};
use crate::routing::RoutingStrategy;
use crate::temperature::TemperatureTracker;
use crate::COMPONENT_NAME;

/// Request headers forwarded to the chosen gateway. Everything else from
/// the client is dropped.
const FORWARDED_REQUEST_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "range",
    "if-none-match",
    "if-modified-since",
];

pub const COMPONENT_HEADER: &str = "x-ar-io-component";
pub const TRACE_ID_HEADER: &str = "x-ar-io-trace-id";

/// A gateway response plus how it was obtained.
pub struct FetchedResponse {
    pub response: reqwest::Response,
    pub gateway: Url,
    pub latency_ms: u32,
}

/// Fan-out-with-failover GETs: each attempt selects a fresh gateway via
/// the routing strategy (excluding ones that already failed this burst),
/// and failures feed both the circuit breaker and the temperature
/// tracker.
pub struct ContentFetcher {
    pool: Arc<HttpClientPool>,
    registry: Arc<dyn GatewayRegistry>,
    health: Arc<HealthTracker>,
    temperature: Arc<TemperatureTracker>,
    strategy: RoutingStrategy,
    retry_attempts: usize,
    request_timeout_ms: u64,
}

impl ContentFetcher {
    pub fn new(
        pool: Arc<HttpClientPool>,
        registry: Arc<dyn GatewayRegistry>,
        health: Arc<HealthTracker>,
        temperature: Arc<TemperatureTracker>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            registry,
            health,
            temperature,
            strategy: config.routing_strategy,
            retry_attempts: config.retry_attempts,
            request_timeout_ms: config.request_timeout_ms,
        }
    }

    pub async fn fetch_by_txid(
        &self,
        txid: &TxId,
        path: &str,
        original_headers: &HeaderMap,
        trace_id: &str,
    ) -> Result<FetchedResponse, Error> {
        let sandbox = sandbox_subdomain(txid)?;
        let txid = txid.clone();
        self.fetch_with_failover(original_headers, trace_id, move |gateway| {
            content_url(gateway, &txid, &sandbox, path)
        })
        .await
    }

    pub async fn fetch_by_arns(
        &self,
        name: &ArnsName,
        path: &str,
        original_headers: &HeaderMap,
        trace_id: &str,
    ) -> Result<FetchedResponse, Error> {
        let name = name.clone();
        self.fetch_with_failover(original_headers, trace_id, move |gateway| {
            arns_url(gateway, &name, path)
        })
        .await
    }

    /// Raw transaction bytes (`/raw/<txid>`), used for manifest bodies.
    pub async fn fetch_raw(&self, txid: &TxId, trace_id: &str) -> Result<FetchedResponse, Error> {
        let txid = txid.clone();
        self.fetch_with_failover(&HeaderMap::new(), trace_id, move |gateway| {
            gateway
                .join(&format!("raw/{txid}"))
                .map_err(|e| Error::Internal {
                    message: format!("bad raw URL on {gateway}: {e}"),
                })
        })
        .await
    }

    /// Select a gateway for route mode without issuing any request.
    pub async fn select_gateway(&self) -> Result<Url, Error> {
        let gateways = self.registry.routing_gateways().await?;
        self.strategy
            .select(&gateways, &self.health, &self.temperature)
    }

    async fn fetch_with_failover<B>(
        &self,
        original_headers: &HeaderMap,
        trace_id: &str,
        build_url: B,
    ) -> Result<FetchedResponse, Error>
    where
        B: Fn(&Url) -> Result<Url, Error>,
    {
        let gateways = self.registry.routing_gateways().await?;
        let headers = forwarded_headers(original_headers, trace_id);
        let mut failed_this_burst: HashSet<String> = HashSet::new();
        let mut last_error: Option<Error> = None;

        for attempt in 0..self.retry_attempts {
            let candidates: Vec<Url> = gateways
                .iter()
                .filter(|g| !failed_this_burst.contains(&gateway_key(g)))
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            let gateway = match self
                .strategy
                .select(&candidates, &self.health, &self.temperature)
            {
                Ok(gateway) => gateway,
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            };
            let url = build_url(&gateway)?;

            let started = Instant::now();
            let result = self
                .pool
                .fetch(FetchRequest {
                    url: url.clone(),
                    method: reqwest::Method::GET,
                    headers: headers.clone(),
                    body: None,
                    timeout: Duration::from_millis(self.request_timeout_ms),
                    redirect: RedirectPolicy::Follow,
                })
                .await;
            let latency_ms = started.elapsed().as_millis() as u32;

            match result {
                Ok(response) if response.status().is_server_error() => {
                    tracing::debug!(
                        gateway = %gateway,
                        status = %response.status(),
                        attempt,
                        "gateway returned server error, failing over"
                    );
                    self.record_failure(&gateway);
                    last_error = Some(Error::GatewayRequest {
                        message: format!("{url} returned {}", response.status()),
                        status_code: Some(response.status()),
                    });
                    failed_this_burst.insert(gateway_key(&gateway));
                }
                Ok(response) => {
                    // 2xx, 3xx, and 4xx all mean the gateway itself is
                    // working.
                    self.health.mark_healthy(&gateway);
                    self.temperature.record_success(&gateway, latency_ms);
                    return Ok(FetchedResponse {
                        response,
                        gateway,
                        latency_ms,
                    });
                }
                Err(e) => {
                    tracing::debug!(gateway = %gateway, attempt, "gateway fetch failed: {e}");
                    self.record_failure(&gateway);
                    last_error = Some(e);
                    failed_this_burst.insert(gateway_key(&gateway));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::NoHealthyGateways {
            message: "no routing gateways available".to_string(),
        }))
    }

    fn record_failure(&self, gateway: &Url) {
        self.health.record_failure(gateway);
        self.temperature.record_failure(gateway);
    }
}

fn forwarded_headers(original: &HeaderMap, trace_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = original.get(*name) {
            if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.insert(header_name, value.clone());
            }
        }
    }
    headers.insert(
        HeaderName::from_static(COMPONENT_HEADER),
        HeaderValue::from_static(COMPONENT_NAME),
    );
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        headers.insert(HeaderName::from_static(TRACE_ID_HEADER), value);
    }
    headers
}

fn is_local_gateway(gateway: &Url) -> bool {
    matches!(gateway.host_str(), Some("localhost") | Some("127.0.0.1"))
}

/// `<gateway>/<txid><path>` for local gateways; the sandbox subdomain
/// (`<sandbox>.<host>/<txid><path>`) for remote ones, so every content
/// address gets its own browser origin.
pub(crate) fn content_url(gateway: &Url, txid: &TxId, sandbox: &str, path: &str) -> Result<Url, Error> {
    let suffix = join_path(path);
    let raw = if is_local_gateway(gateway) {
        format!("{}{txid}{suffix}", base(gateway)?)
    } else {
        let host = gateway.host_str().ok_or_else(|| Error::Internal {
            message: format!("gateway `{gateway}` has no host"),
        })?;
        match gateway.port() {
            Some(port) => {
                format!("{}://{sandbox}.{host}:{port}/{txid}{suffix}", gateway.scheme())
            }
            None => format!("{}://{sandbox}.{host}/{txid}{suffix}", gateway.scheme()),
        }
    };
    Url::parse(&raw).map_err(|e| Error::Internal {
        message: format!("failed to build content URL: {e}"),
    })
}

/// `<gateway>/<name><path>` locally, `<name>.<host><path>` remotely.
pub(crate) fn arns_url(gateway: &Url, name: &ArnsName, path: &str) -> Result<Url, Error> {
    let suffix = join_path(path);
    let raw = if is_local_gateway(gateway) {
        format!("{}{name}{suffix}", base(gateway)?)
    } else {
        let host = gateway.host_str().ok_or_else(|| Error::Internal {
            message: format!("gateway `{gateway}` has no host"),
        })?;
        let path_part = if suffix.is_empty() { "/" } else { &suffix };
        match gateway.port() {
            Some(port) => {
                format!("{}://{name}.{host}:{port}{path_part}", gateway.scheme())
            }
            None => format!("{}://{name}.{host}{path_part}", gateway.scheme()),
        }
    };
    Url::parse(&raw).map_err(|e| Error::Internal {
        message: format!("failed to build ArNS URL: {e}"),
    })
}

fn base(gateway: &Url) -> Result<String, Error> {
    let host = gateway.host_str().ok_or_else(|| Error::Internal {
        message: format!("gateway `{gateway}` has no host"),
    })?;
    Ok(match gateway.port() {
        Some(port) => format!("{}://{host}:{port}/", gateway.scheme()),
        None => format!("{}://{host}/", gateway.scheme()),
    })
}

fn join_path(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
