use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use metrics::counter;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::address::{
    looks_like_sandbox, sandbox_subdomain, validate_sandbox, ArnsName, TxId,
};
use crate::config::RequestMode;
use crate::error::Error;
use crate::fetcher::{arns_url, content_url};
use crate::http_client::{FetchRequest, RedirectPolicy};
use crate::pipeline::{PassthroughResponse, PipelineOutput, VerifiedContent};
use crate::router_util::{AppState, AppStateData};

pub const MODE_HEADER: &str = "x-wayfinder-mode";
pub const VERIFIED_HEADER: &str = "x-wayfinder-verified";
pub const ROUTED_VIA_HEADER: &str = "x-wayfinder-routed-via";
pub const TXID_HEADER: &str = "x-wayfinder-txid";
pub const VERIFIED_BY_HEADER: &str = "x-wayfinder-verified-by";
pub const VERIFICATION_TIME_HEADER: &str = "x-wayfinder-verification-time-ms";
pub const CACHED_HEADER: &str = "x-wayfinder-cached";
pub const MANIFEST_TXID_HEADER: &str = "x-wayfinder-manifest-txid";
pub const TRACE_ID_HEADER: &str = "x-wayfinder-trace-id";

/// The shapes a content request can take, derived from host + path.
#[derive(Debug)]
enum RequestShape {
    /// `GET /` on the base domain.
    Root,
    /// `GET /<txid>[/...]` on the base domain.
    BaseTxid { txid: TxId, rest: String },
    /// `GET /<txid>[/...]` on a sandbox subdomain.
    Sandbox {
        label: String,
        txid: TxId,
        rest: String,
    },
    /// Any path on an ArNS-name subdomain.
    Arns { name: ArnsName, rest: String },
}

/// Fallback handler for everything that is not a reserved path: the
/// content data plane.
pub async fn request_handler(State(state): AppState, request: Request<Body>) -> Response {
    match handle_request(state, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn handle_request(state: AppStateData, request: Request<Body>) -> Result<Response, Error> {
    let Some(_guard) = state.tracker.guard() else {
        return Err(Error::ServiceUnavailable {
            message: "router is draining".to_string(),
        });
    };
    counter!("wayfinder_requests_total").increment(1);

    if !matches!(*request.method(), Method::GET | Method::HEAD) {
        return Err(Error::InvalidRequest {
            message: format!("method {} is not supported", request.method()),
        });
    }

    let host = request_host(&request)?;
    let path = request.uri().path().to_string();
    let mode = effective_mode(&state, request.uri().query());
    let trace_id = Uuid::new_v4().to_string();
    let headers = request.headers().clone();

    let shape = classify(&state.config.base_domain, &host, &path)?;

    if state.config.restrict_to_root_host && !matches!(shape, RequestShape::Root) {
        return Err(Error::NotFound {
            message: "this host only serves its configured root content".to_string(),
        });
    }

    match shape {
        RequestShape::Root => serve_root(&state, mode, &headers, &trace_id).await,
        RequestShape::BaseTxid { txid, rest } => match mode {
            RequestMode::Proxy => sandbox_redirect(&state, &txid, &rest, &trace_id),
            RequestMode::Route => route_txid(&state, &txid, &rest, &trace_id).await,
        },
        RequestShape::Sandbox { label, txid, rest } => {
            if !validate_sandbox(&label, &txid) {
                return Err(Error::InvalidSandbox {
                    subdomain: label,
                    txid: txid.as_str().to_string(),
                });
            }
            match mode {
                RequestMode::Proxy => {
                    let output = state
                        .pipeline
                        .get_by_txid(&txid, &rest, &headers, &trace_id)
                        .await?;
                    Ok(content_response(output, mode, &trace_id))
                }
                RequestMode::Route => route_txid(&state, &txid, &rest, &trace_id).await,
            }
        }
        RequestShape::Arns { name, rest } => match mode {
            RequestMode::Proxy => {
                let resolution = state.resolver.resolve(&name).await?;
                let output = state
                    .pipeline
                    .get_by_arns(&name, &resolution.txid, &rest, &headers, &trace_id)
                    .await?;
                Ok(content_response(output, mode, &trace_id))
            }
            RequestMode::Route => route_arns(&state, &name, &rest, &trace_id).await,
        },
    }
}

/// Pass-through proxy for GraphQL queries when a gateway is configured.
pub async fn graphql_handler(State(state): AppState, request: Request<Body>) -> Response {
    match proxy_graphql(state, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn proxy_graphql(state: AppStateData, request: Request<Body>) -> Result<Response, Error> {
    let Some(gateway) = state.config.graphql_gateway.clone() else {
        return Err(Error::NotFound {
            message: "GraphQL proxying is not enabled".to_string(),
        });
    };
    let Some(_guard) = state.tracker.guard() else {
        return Err(Error::ServiceUnavailable {
            message: "router is draining".to_string(),
        });
    };

    let url = gateway.join("graphql").map_err(|e| Error::Internal {
        message: format!("bad GraphQL URL: {e}"),
    })?;
    let method = request.method().clone();
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(content_type) = request.headers().get("content-type") {
        headers.insert("content-type", content_type.clone());
    }
    let body = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
        .await
        .map_err(|e| Error::InvalidRequest {
            message: format!("unreadable request body: {e}"),
        })?;

    let upstream = state
        .http_pool
        .fetch(FetchRequest {
            url,
            method: reqwest::Method::from_bytes(method.as_str().as_bytes()).map_err(|e| {
                Error::InvalidRequest {
                    message: format!("unsupported method: {e}"),
                }
            })?,
            headers,
            body: if body.is_empty() { None } else { Some(body) },
            timeout: Duration::from_millis(state.config.request_timeout_ms),
            redirect: RedirectPolicy::Follow,
        })
        .await?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let bytes = upstream.bytes().await.map_err(|e| Error::GatewayRequest {
        message: format!("error reading GraphQL response: {e}"),
        status_code: None,
    })?;

    let mut response = Response::builder().status(status);
    response = response.header("content-type", content_type);
    response.body(Body::from(bytes)).map_err(|e| Error::Internal {
        message: format!("failed to build response: {e}"),
    })
}

async fn serve_root(
    state: &AppStateData,
    mode: RequestMode,
    headers: &axum::http::HeaderMap,
    trace_id: &str,
) -> Result<Response, Error> {
    let Some(root) = &state.config.root_host_content else {
        return Err(Error::NotFound {
            message: "no root content configured for this host".to_string(),
        });
    };

    // Auto-detect: a txid shape is content, anything else is a name.
    if let Ok(txid) = TxId::from_str(root) {
        match mode {
            RequestMode::Proxy => {
                let output = state.pipeline.get_by_txid(&txid, "", headers, trace_id).await?;
                Ok(content_response(output, mode, trace_id))
            }
            RequestMode::Route => route_txid(state, &txid, "", trace_id).await,
        }
    } else {
        let name = ArnsName::from_str(root)?;
        match mode {
            RequestMode::Proxy => {
                let resolution = state.resolver.resolve(&name).await?;
                let output = state
                    .pipeline
                    .get_by_arns(&name, &resolution.txid, "", headers, trace_id)
                    .await?;
                Ok(content_response(output, mode, trace_id))
            }
            RequestMode::Route => route_arns(state, &name, "", trace_id).await,
        }
    }
}

/// Content addresses served from the bare base domain are bounced to
/// their sandbox subdomain so each address gets an isolated browser
/// origin.
fn sandbox_redirect(
    state: &AppStateData,
    txid: &TxId,
    rest: &str,
    trace_id: &str,
) -> Result<Response, Error> {
    let sandbox = sandbox_subdomain(txid)?;
    let suffix = if rest.is_empty() {
        String::new()
    } else {
        format!("/{rest}")
    };
    let location = format!(
        "https://{sandbox}.{}/{txid}{suffix}",
        state.config.base_domain
    );
    redirect(&location, RequestMode::Proxy, None, trace_id)
}

async fn route_txid(
    state: &AppStateData,
    txid: &TxId,
    rest: &str,
    trace_id: &str,
) -> Result<Response, Error> {
    let gateway = state.pipeline.select_gateway().await?;
    let sandbox = sandbox_subdomain(txid)?;
    let suffix = if rest.is_empty() {
        String::new()
    } else {
        format!("/{rest}")
    };
    let url = content_url(&gateway, txid, &sandbox, &suffix)?;
    redirect(url.as_str(), RequestMode::Route, Some(&gateway), trace_id)
}

async fn route_arns(
    state: &AppStateData,
    name: &ArnsName,
    rest: &str,
    trace_id: &str,
) -> Result<Response, Error> {
    let gateway = state.pipeline.select_gateway().await?;
    let suffix = if rest.is_empty() {
        String::new()
    } else {
        format!("/{rest}")
    };
    let url = arns_url(&gateway, name, &suffix)?;
    redirect(url.as_str(), RequestMode::Route, Some(&gateway), trace_id)
}

fn redirect(
    location: &str,
    mode: RequestMode,
    gateway: Option<&url::Url>,
    trace_id: &str,
) -> Result<Response, Error> {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header("location", location)
        .header(MODE_HEADER, mode.to_string())
        .header(TRACE_ID_HEADER, trace_id);
    if let Some(gateway) = gateway {
        builder = builder.header(ROUTED_VIA_HEADER, gateway.as_str());
    }
    builder.body(Body::empty()).map_err(|e| Error::Internal {
        message: format!("failed to build redirect: {e}"),
    })
}

fn content_response(output: PipelineOutput, mode: RequestMode, trace_id: &str) -> Response {
    match output {
        PipelineOutput::Complete(content) => verified_response(*content, mode, trace_id),
        PipelineOutput::Passthrough(passthrough) => {
            passthrough_response(*passthrough, mode, trace_id)
        }
    }
}

fn verified_response(content: VerifiedContent, mode: RequestMode, trace_id: &str) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", &content.content_type)
        .header("content-length", content.data.len())
        .header(MODE_HEADER, mode.to_string())
        .header(VERIFIED_HEADER, if content.verified { "true" } else { "false" })
        .header(TXID_HEADER, &content.content_txid)
        .header(CACHED_HEADER, if content.cached { "true" } else { "false" })
        .header(
            VERIFICATION_TIME_HEADER,
            content.verification_ms.to_string(),
        )
        .header(TRACE_ID_HEADER, trace_id);

    let routed_via = content.gateway.as_deref().unwrap_or("cache");
    builder = builder.header(ROUTED_VIA_HEADER, routed_via);
    if !content.verified_by.is_empty() {
        builder = builder.header(VERIFIED_BY_HEADER, content.verified_by.join(","));
    }
    if let Some(manifest_txid) = &content.manifest_txid {
        builder = builder.header(MANIFEST_TXID_HEADER, manifest_txid);
    }
    for (name, value) in &content.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from(content.data))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn passthrough_response(
    passthrough: PassthroughResponse,
    mode: RequestMode,
    trace_id: &str,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(passthrough.status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(MODE_HEADER, mode.to_string())
        .header(VERIFIED_HEADER, "false")
        .header(CACHED_HEADER, "false")
        .header(ROUTED_VIA_HEADER, passthrough.gateway.as_str())
        .header(TRACE_ID_HEADER, trace_id);
    if let Some(content_type) = &passthrough.content_type {
        builder = builder.header("content-type", content_type);
    }
    for (name, value) in &passthrough.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }

    let stream = passthrough.body.bytes_stream();
    let body = match passthrough.prefix {
        Some(prefix) => Body::from_stream(
            futures::stream::iter([Ok::<Bytes, reqwest::Error>(prefix)]).chain(stream),
        ),
        None => Body::from_stream(stream),
    };
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn request_host(request: &Request<Body>) -> Result<String, Error> {
    let host = request
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .ok_or_else(|| Error::InvalidRequest {
            message: "request has no Host header".to_string(),
        })?;
    // Strip the port; hosts compare case-insensitively.
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    Ok(host.to_ascii_lowercase())
}

fn effective_mode(state: &AppStateData, query: Option<&str>) -> RequestMode {
    if !state.config.allow_mode_override {
        return state.config.mode;
    }
    let Some(query) = query else {
        return state.config.mode;
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("mode=") {
            match RequestMode::from_str(value) {
                Ok(mode) => return mode,
                Err(_) => {
                    tracing::debug!("ignoring invalid mode override `{value}`");
                    return state.config.mode;
                }
            }
        }
    }
    state.config.mode
}

fn classify(base_domain: &str, host: &str, path: &str) -> Result<RequestShape, Error> {
    let base = base_domain.to_ascii_lowercase();
    let suffix = format!(".{base}");

    if let Some(label) = host.strip_suffix(&suffix) {
        if label.contains('.') {
            return Err(Error::NotFound {
                message: format!("`{label}` is not a single subdomain label"),
            });
        }
        if looks_like_sandbox(label) {
            let (first, rest) = split_first_segment(path);
            let txid = TxId::from_str(first).map_err(|_| Error::InvalidRequest {
                message: format!(
                    "sandboxed requests must address a transaction id, got `{first}`"
                ),
            })?;
            return Ok(RequestShape::Sandbox {
                label: label.to_string(),
                txid,
                rest: rest.to_string(),
            });
        }
        let name = ArnsName::from_str(label)?;
        return Ok(RequestShape::Arns {
            name,
            rest: path.trim_start_matches('/').to_string(),
        });
    }

    // The base domain itself, or an unrelated host (reverse proxies often
    // rewrite Host): both use path-shaped routing.
    let (first, rest) = split_first_segment(path);
    if first.is_empty() {
        return Ok(RequestShape::Root);
    }
    match TxId::from_str(first) {
        Ok(txid) => Ok(RequestShape::BaseTxid {
            txid,
            rest: rest.to_string(),
        }),
        Err(_) => Err(Error::NotFound {
            message: format!("`{first}` is neither a transaction id nor a reserved path"),
        }),
    }
}

fn split_first_segment(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    }
}
