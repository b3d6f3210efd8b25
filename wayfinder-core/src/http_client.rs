use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response};
use std::time::Duration;
use url::Url;

use crate::config::HttpClientSettings;
use crate::error::Error;

/// How a pooled client treats redirects. `Follow` is standard fetch
/// semantics: 301/302 rewrite POST to GET, 303 always rewrites, 307/308
/// preserve the method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RedirectPolicy {
    Follow,
    Manual,
    Error,
}

/// One `reqwest::Client` per `(scheme://authority, redirect policy)`.
/// Each client keeps its own connection pool, so distinct origins never
/// contend for sockets and redirect behaviour never leaks across calls.
pub struct HttpClientPool {
    settings: HttpClientSettings,
    clients: DashMap<(String, RedirectPolicy), Client>,
}

pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub redirect: RedirectPolicy,
}

impl FetchRequest {
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout,
            redirect: RedirectPolicy::Follow,
        }
    }

    pub fn head(url: Url, timeout: Duration) -> Self {
        Self {
            method: Method::HEAD,
            ..Self::get(url, timeout)
        }
    }
}

impl HttpClientPool {
    pub fn new(settings: HttpClientSettings) -> Self {
        Self {
            settings,
            clients: DashMap::new(),
        }
    }

    /// Issue a request through the pooled client for the URL's origin,
    /// bounded by the request's deadline.
    pub async fn fetch(&self, request: FetchRequest) -> Result<Response, Error> {
        let client = self.client_for(&request.url, request.redirect)?;
        let mut builder = client
            .request(request.method, request.url.clone())
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = tokio::time::timeout(request.timeout, builder.send())
            .await
            .map_err(|_| Error::Timeout {
                message: format!("no response from {} within {:?}", request.url, request.timeout),
            })?
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        message: format!("{} ({e})", request.url),
                    }
                } else {
                    Error::GatewayRequest {
                        message: format!("request to {} failed: {e}", request.url),
                        status_code: None,
                    }
                }
            })?;
        Ok(response)
    }

    fn client_for(&self, url: &Url, redirect: RedirectPolicy) -> Result<Client, Error> {
        let origin = origin_of(url)?;
        let key = (origin, redirect);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let policy = match redirect {
            RedirectPolicy::Follow => reqwest::redirect::Policy::limited(self.settings.max_redirects),
            RedirectPolicy::Manual => reqwest::redirect::Policy::none(),
            RedirectPolicy::Error => {
                reqwest::redirect::Policy::custom(|attempt| attempt.error("redirects not permitted"))
            }
        };

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(self.settings.connect_timeout_ms))
            .pool_idle_timeout(Duration::from_millis(self.settings.pool_idle_timeout_ms))
            .pool_max_idle_per_host(self.settings.max_connections_per_host)
            .redirect(policy);
        for (host, addr) in &self.settings.resolve_overrides {
            builder = builder.resolve(host, *addr);
        }
        let client = builder.build().map_err(|e| Error::AppState {
            message: format!("failed to build HTTP client: {e}"),
        })?;

        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Number of live per-origin pools.
    pub fn pool_count(&self) -> usize {
        self.clients.len()
    }
}

fn origin_of(url: &Url) -> Result<String, Error> {
    let host = url.host_str().ok_or_else(|| Error::InvalidRequest {
        message: format!("URL `{url}` has no host"),
    })?;
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_includes_scheme_host_and_explicit_port() {
        let url = Url::parse("https://gateway.example:8443/path?q=1").unwrap();
        assert_eq!(origin_of(&url).unwrap(), "https://gateway.example:8443");

        let url = Url::parse("https://gateway.example/path").unwrap();
        assert_eq!(origin_of(&url).unwrap(), "https://gateway.example");
    }

    #[test]
    fn clients_are_pooled_per_origin_and_policy() {
        let pool = HttpClientPool::new(HttpClientSettings::default());
        let a = Url::parse("https://a.example/x").unwrap();
        let b = Url::parse("https://b.example/y").unwrap();

        pool.client_for(&a, RedirectPolicy::Follow).unwrap();
        pool.client_for(&a, RedirectPolicy::Follow).unwrap();
        assert_eq!(pool.pool_count(), 1);

        pool.client_for(&a, RedirectPolicy::Manual).unwrap();
        pool.client_for(&b, RedirectPolicy::Follow).unwrap();
        assert_eq!(pool.pool_count(), 3);
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_gateway_error() {
        let pool = HttpClientPool::new(HttpClientSettings {
            connect_timeout_ms: 100,
            ..HttpClientSettings::default()
        });
        // TEST-NET-1 is guaranteed unroutable.
        let url = Url::parse("http://192.0.2.1:9/").unwrap();
        let result = pool
            .fetch(FetchRequest::get(url, Duration::from_millis(300)))
            .await;
        assert!(matches!(
            result,
            Err(Error::GatewayRequest { .. }) | Err(Error::Timeout { .. })
        ));
    }
}
