use bytes::{Bytes, BytesMut};
use metrics::counter;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use url::Url;

use crate::address::{ArnsName, TxId};
use crate::cache::{cache_key, CachedContent, ContentCache};
use crate::config::Config;
use crate::error::Error;
use crate::fetcher::{ContentFetcher, FetchedResponse};
use crate::health::HealthTracker;
use crate::manifest::{normalize_path, ManifestCache, PathManifest};
use crate::single_flight::SingleFlight;
use crate::temperature::TemperatureTracker;
use crate::verifier::{Verifier, DATA_ID_HEADER};

/// Upstream response headers forwarded to the client. `set-cookie`,
/// `x-powered-by`, and transport headers are stripped; `x-ar-io-*` and
/// `x-arns-*` always pass.
const FORWARDED_RESPONSE_HEADERS: &[&str] = &[
    "cache-control",
    "content-disposition",
    "content-language",
    "etag",
    "expires",
    "last-modified",
    "vary",
];

/// A fully verified body ready to serve and cache. Cheap to clone so the
/// single-flight can fan it out to coalesced waiters.
#[derive(Clone, Debug)]
pub struct VerifiedContent {
    pub data: Bytes,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub content_txid: String,
    pub manifest_txid: Option<String>,
    pub verified: bool,
    pub verified_by: Vec<String>,
    pub verification_ms: u64,
    pub gateway: Option<String>,
    pub cached: bool,
}

/// A response the router passes through without verifying or caching:
/// non-200 statuses, bodies beyond the buffering budget, or a router
/// running with verification disabled.
pub struct PassthroughResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: reqwest::Response,
    pub prefix: Option<Bytes>,
    pub gateway: Url,
}

pub enum PipelineOutput {
    Complete(Box<VerifiedContent>),
    Passthrough(Box<PassthroughResponse>),
}

struct PipelineInner {
    fetcher: ContentFetcher,
    verifier: Verifier,
    manifests: ManifestCache,
    content_cache: ContentCache,
    health: Arc<HealthTracker>,
    temperature: Arc<TemperatureTracker>,
    verification_enabled: bool,
    max_buffer_bytes: u64,
}

/// The verified content pipeline: fetch from one untrusted gateway,
/// resolve manifests through the trusted quorum, verify the digest, fill
/// the cache, serve. At most one verification-and-fill runs per
/// `(txid, path)`; coalesced callers observe the single result.
pub struct ContentPipeline {
    inner: Arc<PipelineInner>,
    flights: SingleFlight<VerifiedContent>,
    manifest_flights: SingleFlight<Arc<PathManifest>>,
}

impl ContentPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: ContentFetcher,
        verifier: Verifier,
        content_cache: ContentCache,
        health: Arc<HealthTracker>,
        temperature: Arc<TemperatureTracker>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                fetcher,
                verifier,
                manifests: ManifestCache::new(config.cache.manifest_max_entries),
                content_cache,
                health,
                temperature,
                verification_enabled: config.verification_enabled,
                max_buffer_bytes: config.cache.max_item_bytes,
            }),
            flights: SingleFlight::new(),
            manifest_flights: SingleFlight::new(),
        }
    }

    pub async fn get_by_txid(
        &self,
        txid: &TxId,
        path: &str,
        original_headers: &HeaderMap,
        trace_id: &str,
    ) -> Result<PipelineOutput, Error> {
        let path = normalize_path(path);
        if let Some(hit) = self.cached_lookup(txid, &path).await? {
            return Ok(PipelineOutput::Complete(Box::new(hit)));
        }

        let fetched = self
            .inner
            .fetcher
            .fetch_by_txid(txid, &join_path(&path), original_headers, trace_id)
            .await?;
        self.finish(txid, &path, fetched, trace_id).await
    }

    pub async fn get_by_arns(
        &self,
        name: &ArnsName,
        resolved_txid: &TxId,
        path: &str,
        original_headers: &HeaderMap,
        trace_id: &str,
    ) -> Result<PipelineOutput, Error> {
        let path = normalize_path(path);
        if let Some(hit) = self.cached_lookup(resolved_txid, &path).await? {
            return Ok(PipelineOutput::Complete(Box::new(hit)));
        }

        let fetched = self
            .inner
            .fetcher
            .fetch_by_arns(name, &join_path(&path), original_headers, trace_id)
            .await?;
        self.finish(resolved_txid, &path, fetched, trace_id).await
    }

    /// Route-mode support: pick a gateway without touching it.
    pub async fn select_gateway(&self) -> Result<Url, Error> {
        self.inner.fetcher.select_gateway().await
    }

    pub fn cache_stats(&self) -> crate::cache::ContentCacheStats {
        self.inner.content_cache.stats()
    }

    pub async fn invalidate(&self, txid: &TxId) {
        self.inner.content_cache.invalidate(txid.as_str()).await;
    }

    /// Serve from cache when the `(txid, path)` pair can be resolved to a
    /// verified entry without any network traffic.
    async fn cached_lookup(
        &self,
        txid: &TxId,
        path: &str,
    ) -> Result<Option<VerifiedContent>, Error> {
        let (content_txid, manifest_txid) = match self.inner.manifests.get(txid) {
            Some(manifest) => {
                // A known manifest is authoritative: a path it cannot
                // resolve does not exist.
                let resolution = manifest.resolve(txid, path)?;
                (resolution.content_txid, Some(txid.clone()))
            }
            None if path.is_empty() => (txid.clone(), None),
            None => return Ok(None),
        };

        match self.inner.content_cache.get(content_txid.as_str(), "").await {
            Some(entry) => {
                counter!("wayfinder_cache_hits_total").increment(1);
                Ok(Some(VerifiedContent {
                    data: entry.data.clone(),
                    content_type: entry.content_type.clone(),
                    headers: entry.headers.clone(),
                    content_txid: entry.txid.clone(),
                    manifest_txid: manifest_txid.map(|m| m.as_str().to_string()),
                    verified: true,
                    verified_by: Vec::new(),
                    verification_ms: 0,
                    gateway: None,
                    cached: true,
                }))
            }
            None => Ok(None),
        }
    }

    /// Decide what to do with a gateway response: verify-and-cache a
    /// buffered 200, or pass everything else through untouched.
    async fn finish(
        &self,
        expected_txid: &TxId,
        path: &str,
        fetched: FetchedResponse,
        trace_id: &str,
    ) -> Result<PipelineOutput, Error> {
        let FetchedResponse {
            response, gateway, ..
        } = fetched;
        let status = response.status();

        let too_large = response
            .content_length()
            .is_some_and(|len| len > self.inner.max_buffer_bytes);
        if status != reqwest::StatusCode::OK || too_large || !self.inner.verification_enabled {
            return Ok(PipelineOutput::Passthrough(Box::new(passthrough(
                response, gateway, None,
            ))));
        }

        let data_id = header_string(response.headers(), DATA_ID_HEADER);
        let content_type = header_string(response.headers(), "content-type")
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let forwarded = filter_response_headers(response.headers());

        // Buffer the (decoded) body, bailing out to a streamed
        // passthrough if it outgrows the per-item budget mid-read.
        let mut response = response;
        let mut buffer = BytesMut::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if buffer.len() as u64 + chunk.len() as u64 > self.inner.max_buffer_bytes {
                        let mut prefixed = buffer.freeze();
                        let mut joined = BytesMut::with_capacity(prefixed.len() + chunk.len());
                        joined.extend_from_slice(&prefixed);
                        joined.extend_from_slice(&chunk);
                        prefixed = joined.freeze();
                        tracing::debug!(
                            txid = %expected_txid,
                            "body exceeds buffering budget, serving unverified"
                        );
                        return Ok(PipelineOutput::Passthrough(Box::new(passthrough(
                            response,
                            gateway,
                            Some(prefixed),
                        ))));
                    }
                    buffer.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    self.inner.health.record_failure(&gateway);
                    self.inner.temperature.record_failure(&gateway);
                    return Err(Error::GatewayRequest {
                        message: format!("error reading body from {gateway}: {e}"),
                        status_code: None,
                    });
                }
            }
        }
        let data = buffer.freeze();

        let inner = Arc::clone(&self.inner);
        let manifest_flights = self.manifest_flights.clone();
        let flight_key = cache_key(expected_txid.as_str(), path);
        let expected = expected_txid.clone();
        let owned_path = path.to_string();
        let owned_trace = trace_id.to_string();
        let verified = self
            .flights
            .dedupe(&flight_key, move || {
                verify_and_fill(
                    inner,
                    manifest_flights,
                    expected,
                    owned_path,
                    data,
                    data_id,
                    content_type,
                    forwarded,
                    gateway,
                    owned_trace,
                )
            })
            .await?;
        Ok(PipelineOutput::Complete(Box::new(verified)))
    }
}

/// The single-flighted tail of the pipeline: manifest resolution, digest
/// quorum, cache fill.
#[allow(clippy::too_many_arguments)]
async fn verify_and_fill(
    inner: Arc<PipelineInner>,
    manifest_flights: SingleFlight<Arc<PathManifest>>,
    requested_txid: TxId,
    path: String,
    data: Bytes,
    data_id: Option<String>,
    content_type: String,
    headers: Vec<(String, String)>,
    gateway: Url,
    trace_id: String,
) -> Result<VerifiedContent, Error> {
    // A coalesced waiter may find the fill already done.
    if path.is_empty() {
        if let Some(entry) = inner.content_cache.get(requested_txid.as_str(), "").await {
            return Ok(cached_to_verified(entry, None));
        }
    }

    let mut expected = requested_txid.clone();
    let mut manifest_txid = None;

    let is_manifest_subpath = data_id
        .as_deref()
        .is_some_and(|id| id != requested_txid.as_str());
    if is_manifest_subpath {
        let reported = data_id.unwrap_or_default();
        let manifest = fetch_manifest(
            Arc::clone(&inner),
            &manifest_flights,
            &requested_txid,
            &trace_id,
        )
        .await?;
        let resolution = manifest.resolve(&requested_txid, &path)?;
        if resolution.content_txid.as_str() != reported {
            // The gateway served bytes for a txid the verified manifest
            // does not map this path to. Treat it as hostile.
            inner.health.record_failure(&gateway);
            inner.temperature.record_failure(&gateway);
            return Err(Error::ManifestPathMismatch {
                manifest_txid: requested_txid.as_str().to_string(),
                expected: resolution.content_txid.as_str().to_string(),
                reported,
            });
        }
        expected = resolution.content_txid;
        manifest_txid = Some(requested_txid.as_str().to_string());
    }

    // Deduplicated by content address: two manifest paths mapping to one
    // txid share a cache entry.
    if let Some(entry) = inner.content_cache.get(expected.as_str(), "").await {
        return Ok(cached_to_verified(entry, manifest_txid));
    }

    let outcome = match inner.verifier.verify_bytes(&data, &expected).await {
        Ok(outcome) => outcome,
        Err(e) => {
            counter!("wayfinder_verification_failures_total").increment(1);
            inner.health.record_failure(&gateway);
            inner.temperature.record_failure(&gateway);
            return Err(e);
        }
    };
    counter!("wayfinder_verified_total").increment(1);

    let entry = CachedContent::new(
        data.clone(),
        content_type.clone(),
        headers.clone(),
        expected.as_str().to_string(),
        outcome.digest.clone(),
    );
    inner.content_cache.set(expected.as_str(), "", entry).await;

    Ok(VerifiedContent {
        data,
        content_type,
        headers,
        content_txid: expected.as_str().to_string(),
        manifest_txid,
        verified: true,
        verified_by: outcome.verified_by,
        verification_ms: outcome.duration_ms,
        gateway: Some(gateway.to_string()),
        cached: false,
    })
}

/// Fetch, verify, parse, and cache a manifest body. Manifests are content
/// too, so the digest-quorum check applies. The recursion stops here
/// because manifests never reference other manifests.
async fn fetch_manifest(
    inner: Arc<PipelineInner>,
    flights: &SingleFlight<Arc<PathManifest>>,
    manifest_txid: &TxId,
    trace_id: &str,
) -> Result<Arc<PathManifest>, Error> {
    if let Some(manifest) = inner.manifests.get(manifest_txid) {
        return Ok(manifest);
    }

    let txid = manifest_txid.clone();
    let trace = trace_id.to_string();
    flights
        .dedupe(manifest_txid.as_str(), move || async move {
            if let Some(manifest) = inner.manifests.get(&txid) {
                return Ok(manifest);
            }
            let fetched = inner.fetcher.fetch_raw(&txid, &trace).await?;
            let gateway = fetched.gateway.clone();
            if fetched.response.status() != reqwest::StatusCode::OK {
                return Err(Error::ManifestInvalid {
                    txid: txid.as_str().to_string(),
                    message: format!(
                        "gateway returned {} for the manifest body",
                        fetched.response.status()
                    ),
                });
            }
            let body = fetched
                .response
                .bytes()
                .await
                .map_err(|e| Error::GatewayRequest {
                    message: format!("error reading manifest body: {e}"),
                    status_code: None,
                })?;
            if body.len() as u64 > inner.max_buffer_bytes {
                return Err(Error::ManifestInvalid {
                    txid: txid.as_str().to_string(),
                    message: format!("manifest body of {} bytes is too large", body.len()),
                });
            }
            if inner.verification_enabled {
                if let Err(e) = inner.verifier.verify_bytes(&body, &txid).await {
                    inner.health.record_failure(&gateway);
                    inner.temperature.record_failure(&gateway);
                    return Err(e);
                }
            }
            let manifest = Arc::new(PathManifest::parse(&txid, &body)?);
            inner.manifests.insert(&txid, Arc::clone(&manifest));
            Ok(manifest)
        })
        .await
}

fn cached_to_verified(entry: CachedContent, manifest_txid: Option<String>) -> VerifiedContent {
    VerifiedContent {
        data: entry.data.clone(),
        content_type: entry.content_type.clone(),
        headers: entry.headers.clone(),
        content_txid: entry.txid.clone(),
        manifest_txid,
        verified: true,
        verified_by: Vec::new(),
        verification_ms: 0,
        gateway: None,
        cached: true,
    }
}

fn passthrough(
    response: reqwest::Response,
    gateway: Url,
    prefix: Option<Bytes>,
) -> PassthroughResponse {
    PassthroughResponse {
        status: response.status().as_u16(),
        content_type: header_string(response.headers(), "content-type"),
        headers: filter_response_headers(response.headers()),
        body: response,
        prefix,
        gateway,
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Whitelist standard content/caching headers, forward all
/// `x-ar-io-*`/`x-arns-*`, and drop the rest (`set-cookie` and
/// `x-powered-by` included).
pub fn filter_response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            let keep = FORWARDED_RESPONSE_HEADERS.contains(&name.as_str())
                || name.starts_with("x-ar-io-")
                || name.starts_with("x-arns-");
            if keep {
                value.to_str().ok().map(|v| (name, v.to_string()))
            } else {
                None
            }
        })
        .collect()
}

fn join_path(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("/{path}")
    }
}
