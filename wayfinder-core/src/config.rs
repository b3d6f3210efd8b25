use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::error::Error;
use crate::routing::RoutingStrategy;

/// How the router answers content requests: proxy (fetch, verify, stream)
/// or route (302 to a chosen gateway).
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    #[default]
    Proxy,
    Route,
}

impl FromStr for RequestMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxy" => Ok(RequestMode::Proxy),
            "route" => Ok(RequestMode::Route),
            _ => Err(Error::Config {
                message: format!("`{s}` is not a valid mode (expected `proxy` or `route`)"),
            }),
        }
    }
}

impl std::fmt::Display for RequestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestMode::Proxy => f.write_str("proxy"),
            RequestMode::Route => f.write_str("route"),
        }
    }
}

/// Where the gateway registry comes from.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewaySource {
    /// The configured static lists.
    #[default]
    Static,
    /// A network registry provider (resolved at boot by the binary).
    Network,
}

impl FromStr for GatewaySource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(GatewaySource::Static),
            "network" => Ok(GatewaySource::Network),
            _ => Err(Error::Config {
                message: format!(
                    "`{s}` is not a valid gateway source (expected `static` or `network`)"
                ),
            }),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpClientSettings {
    pub max_connections_per_host: usize,
    pub connect_timeout_ms: u64,
    pub pool_idle_timeout_ms: u64,
    pub max_redirects: usize,
    /// Host → socket overrides, applied to every pooled client. Used by the
    /// test harness to point subdomain-addressed hosts at loopback mocks.
    #[serde(skip)]
    pub resolve_overrides: Vec<(String, SocketAddr)>,
}

impl Default for HttpClientSettings {
    fn default() -> Self {
        Self {
            max_connections_per_host: 32,
            connect_timeout_ms: 5_000,
            pool_idle_timeout_ms: 90_000,
            max_redirects: 5,
            resolve_overrides: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TemperatureSettings {
    pub window_ms: u64,
    pub max_gateways: usize,
    pub max_latency_samples: usize,
}

impl Default for TemperatureSettings {
    fn default() -> Self {
        Self {
            window_ms: 5 * 60 * 1000,
            max_gateways: 500,
            max_latency_samples: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PingSettings {
    pub enabled: bool,
    pub interval_hours: u64,
    pub gateway_count: usize,
    pub concurrency: usize,
    pub timeout_ms: u64,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 1,
            gateway_count: 10,
            concurrency: 5,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_item_bytes: u64,
    pub max_total_bytes: u64,
    pub max_entries: usize,
    /// When set, verified content is persisted under this directory.
    pub content_path: Option<PathBuf>,
    pub resolution_max_entries: usize,
    /// Applied when no responder reported a TTL.
    pub resolution_default_ttl_ms: u64,
    pub manifest_max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_item_bytes: 10 * 1024 * 1024,
            max_total_bytes: 256 * 1024 * 1024,
            max_entries: 1_000,
            content_path: None,
            resolution_max_entries: 10_000,
            resolution_default_ttl_ms: 5 * 60 * 1000,
            manifest_max_entries: 500,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub failure_threshold: u32,
    pub circuit_reset_ms: u64,
    pub max_entries: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            circuit_reset_ms: 30_000,
            max_entries: 1_000,
        }
    }
}

/// Router configuration, read from the environment at startup. Every field
/// has a default so tests can start from `Config::default()` and override.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub base_domain: String,
    pub mode: RequestMode,
    pub allow_mode_override: bool,
    pub routing_strategy: RoutingStrategy,
    pub gateway_source: GatewaySource,
    /// Gateway registry endpoint used when `gateway_source` is `network`.
    pub registry_url: Option<Url>,
    pub routing_gateways: Vec<Url>,
    pub verification_gateways: Vec<Url>,
    pub verification_enabled: bool,
    pub consensus_threshold: usize,
    pub retry_attempts: usize,
    pub request_timeout_ms: u64,
    pub arns_timeout_ms: u64,
    pub root_host_content: Option<String>,
    pub restrict_to_root_host: bool,
    pub graphql_gateway: Option<Url>,
    pub drain_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub stats_auth_token: Option<String>,
    pub http: HttpClientSettings,
    pub temperature: TemperatureSettings,
    pub ping: PingSettings,
    pub cache: CacheSettings,
    pub health: HealthSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            base_domain: "localhost".to_string(),
            mode: RequestMode::Proxy,
            allow_mode_override: true,
            routing_strategy: RoutingStrategy::default(),
            gateway_source: GatewaySource::Static,
            registry_url: None,
            routing_gateways: Vec::new(),
            verification_gateways: Vec::new(),
            verification_enabled: true,
            consensus_threshold: 2,
            retry_attempts: 3,
            request_timeout_ms: 30_000,
            arns_timeout_ms: 5_000,
            root_host_content: None,
            restrict_to_root_host: false,
            graphql_gateway: None,
            drain_timeout_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            stats_auth_token: None,
            http: HttpClientSettings::default(),
            temperature: TemperatureSettings::default(),
            ping: PingSettings::default(),
            cache: CacheSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

impl Config {
    /// Load from `WAYFINDER_*` environment variables, then validate.
    pub fn from_env() -> Result<Config, Error> {
        let mut config = Config::default();

        if let Some(value) = read_env("WAYFINDER_BIND_ADDRESS")? {
            config.bind_address = value.parse().map_err(|e| Error::Config {
                message: format!("WAYFINDER_BIND_ADDRESS: {e}"),
            })?;
        }
        if let Some(value) = read_env("WAYFINDER_BASE_DOMAIN")? {
            config.base_domain = value;
        }
        if let Some(value) = read_env("WAYFINDER_MODE")? {
            config.mode = value.parse()?;
        }
        if let Some(value) = read_env("WAYFINDER_ALLOW_MODE_OVERRIDE")? {
            config.allow_mode_override = parse_bool("WAYFINDER_ALLOW_MODE_OVERRIDE", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_ROUTING_STRATEGY")? {
            config.routing_strategy = value.parse()?;
        }
        if let Some(value) = read_env("WAYFINDER_GATEWAY_SOURCE")? {
            config.gateway_source = value.parse()?;
        }
        if let Some(value) = read_env("WAYFINDER_REGISTRY_URL")? {
            config.registry_url = Some(parse_url("WAYFINDER_REGISTRY_URL", &value)?);
        }
        if let Some(value) = read_env("WAYFINDER_ROUTING_GATEWAYS")? {
            config.routing_gateways = parse_url_list("WAYFINDER_ROUTING_GATEWAYS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_VERIFICATION_GATEWAYS")? {
            config.verification_gateways =
                parse_url_list("WAYFINDER_VERIFICATION_GATEWAYS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_VERIFICATION_ENABLED")? {
            config.verification_enabled = parse_bool("WAYFINDER_VERIFICATION_ENABLED", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_CONSENSUS_THRESHOLD")? {
            config.consensus_threshold = parse_number("WAYFINDER_CONSENSUS_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_RETRY_ATTEMPTS")? {
            config.retry_attempts = parse_number("WAYFINDER_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = parse_number("WAYFINDER_REQUEST_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_ARNS_TIMEOUT_MS")? {
            config.arns_timeout_ms = parse_number("WAYFINDER_ARNS_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_ROOT_HOST_CONTENT")? {
            config.root_host_content = Some(value);
        }
        if let Some(value) = read_env("WAYFINDER_RESTRICT_TO_ROOT_HOST")? {
            config.restrict_to_root_host = parse_bool("WAYFINDER_RESTRICT_TO_ROOT_HOST", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_GRAPHQL_GATEWAY")? {
            config.graphql_gateway = Some(parse_url("WAYFINDER_GRAPHQL_GATEWAY", &value)?);
        }
        if let Some(value) = read_env("WAYFINDER_DRAIN_TIMEOUT_MS")? {
            config.drain_timeout_ms = parse_number("WAYFINDER_DRAIN_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout_ms = parse_number("WAYFINDER_SHUTDOWN_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_STATS_AUTH_TOKEN")? {
            config.stats_auth_token = Some(value);
        }
        if let Some(value) = read_env("WAYFINDER_CONTENT_PATH")? {
            config.cache.content_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("WAYFINDER_CACHE_MAX_ITEM_BYTES")? {
            config.cache.max_item_bytes = parse_number("WAYFINDER_CACHE_MAX_ITEM_BYTES", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_CACHE_MAX_TOTAL_BYTES")? {
            config.cache.max_total_bytes = parse_number("WAYFINDER_CACHE_MAX_TOTAL_BYTES", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = parse_number("WAYFINDER_CACHE_MAX_ENTRIES", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_HEALTH_FAILURE_THRESHOLD")? {
            config.health.failure_threshold =
                parse_number("WAYFINDER_HEALTH_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_HEALTH_CIRCUIT_RESET_MS")? {
            config.health.circuit_reset_ms =
                parse_number("WAYFINDER_HEALTH_CIRCUIT_RESET_MS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_PING_ENABLED")? {
            config.ping.enabled = parse_bool("WAYFINDER_PING_ENABLED", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_PING_INTERVAL_HOURS")? {
            config.ping.interval_hours = parse_number("WAYFINDER_PING_INTERVAL_HOURS", &value)?;
        }
        if let Some(value) = read_env("WAYFINDER_PING_GATEWAY_COUNT")? {
            config.ping.gateway_count = parse_number("WAYFINDER_PING_GATEWAY_COUNT", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Boot-time invariants. A config that fails here never serves traffic.
    pub fn validate(&self) -> Result<(), Error> {
        if self.verification_enabled {
            if self.consensus_threshold < 2 {
                return Err(Error::Config {
                    message: format!(
                        "consensus_threshold must be at least 2, got {}",
                        self.consensus_threshold
                    ),
                });
            }
            let verification_count = if self.verification_gateways.is_empty() {
                crate::registry::FALLBACK_VERIFICATION_GATEWAYS.len()
            } else {
                self.verification_gateways.len()
            };
            if self.consensus_threshold > verification_count {
                return Err(Error::Config {
                    message: format!(
                        "consensus_threshold ({}) exceeds the number of verification gateways ({verification_count})",
                        self.consensus_threshold
                    ),
                });
            }
        }
        if self.shutdown_timeout_ms <= self.drain_timeout_ms {
            return Err(Error::Config {
                message: format!(
                    "shutdown_timeout_ms ({}) must exceed drain_timeout_ms ({})",
                    self.shutdown_timeout_ms, self.drain_timeout_ms
                ),
            });
        }
        if self.retry_attempts == 0 {
            return Err(Error::Config {
                message: "retry_attempts must be at least 1".to_string(),
            });
        }
        if self.cache.max_item_bytes > self.cache.max_total_bytes {
            return Err(Error::Config {
                message: format!(
                    "cache.max_item_bytes ({}) exceeds cache.max_total_bytes ({})",
                    self.cache.max_item_bytes, self.cache.max_total_bytes
                ),
            });
        }
        if !self.bind_address.ip().is_loopback() && self.stats_auth_token.is_none() {
            // The stats surface exposes gateway health and cache contents.
            return Err(Error::Config {
                message: "binding to a non-loopback address requires WAYFINDER_STATS_AUTH_TOKEN"
                    .to_string(),
            });
        }
        Ok(())
    }
}

fn read_env(name: &str) -> Result<Option<String>, Error> {
    match std::env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config {
            message: format!("{name}: {e}"),
        }),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::Config {
            message: format!("{name}: expected `true` or `false`, got `{value}`"),
        }),
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| Error::Config {
        message: format!("{name}: {e}"),
    })
}

fn parse_url(name: &str, value: &str) -> Result<Url, Error> {
    Url::parse(value).map_err(|e| Error::Config {
        message: format!("{name}: `{value}` is not a valid URL: {e}"),
    })
}

fn parse_url_list(name: &str, value: &str) -> Result<Vec<Url>, Error> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_url(name, s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn consensus_threshold_below_two_is_rejected() {
        let config = Config {
            consensus_threshold: 1,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn consensus_threshold_above_gateway_count_is_rejected() {
        let config = Config {
            consensus_threshold: 4,
            verification_gateways: vec![
                Url::parse("https://a.example").unwrap(),
                Url::parse("https://b.example").unwrap(),
            ],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabling_verification_relaxes_the_threshold_invariants() {
        let config = Config {
            consensus_threshold: 0,
            verification_enabled: false,
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn shutdown_must_outlast_drain() {
        let config = Config {
            drain_timeout_ms: 30_000,
            shutdown_timeout_ms: 30_000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_loopback_bind_requires_stats_token() {
        let config = Config {
            bind_address: "0.0.0.0:3000".parse().unwrap(),
            stats_auth_token: None,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            bind_address: "0.0.0.0:3000".parse().unwrap(),
            stats_auth_token: Some("secret".to_string()),
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn mode_and_source_parse_from_strings() {
        assert_eq!(RequestMode::from_str("proxy").unwrap(), RequestMode::Proxy);
        assert_eq!(RequestMode::from_str("route").unwrap(), RequestMode::Route);
        assert!(RequestMode::from_str("tunnel").is_err());
        assert_eq!(
            GatewaySource::from_str("static").unwrap(),
            GatewaySource::Static
        );
        assert!(GatewaySource::from_str("dns").is_err());
    }

    #[test]
    fn url_lists_split_on_commas() {
        let urls = parse_url_list("TEST", "https://a.example, https://b.example ,").unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[1].as_str(), "https://b.example/");
    }
}
