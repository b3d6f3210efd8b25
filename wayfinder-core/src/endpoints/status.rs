use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::error::Error;
use crate::router_util::{AppState, AppStateData};
use crate::time_util::epoch_ms;
use crate::WAYFINDER_VERSION;

/// Liveness: reports `draining` once shutdown has begun so load balancers
/// stop sending traffic before the listener closes.
pub async fn health_handler(State(state): AppState) -> Json<Value> {
    let status = if state.tracker.is_draining() {
        "draining"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "inFlight": state.tracker.in_flight(),
    }))
}

pub async fn info_handler(State(state): AppState) -> Json<Value> {
    Json(json!({
        "version": WAYFINDER_VERSION,
        "mode": state.config.mode.to_string(),
        "routingStrategy": state.config.routing_strategy.to_string(),
        "baseDomain": state.config.base_domain,
        "verificationEnabled": state.config.verification_enabled,
        "uptimeMs": epoch_ms().saturating_sub(state.started_at_ms),
    }))
}

/// Operational stats: cache usage, circuit-breaker snapshot, temperature
/// scores. Token-gated when `stats_auth_token` is configured.
pub async fn stats_handler(
    State(state): AppState,
    headers: HeaderMap,
) -> Result<Json<Value>, Error> {
    authorize(&state, &headers)?;

    let cache = state.pipeline.cache_stats();
    let health: Vec<Value> = state
        .health
        .snapshot()
        .into_iter()
        .map(|(gateway, record)| {
            json!({
                "gateway": gateway,
                "healthy": record.healthy,
                "failures": record.failures,
                "circuitOpen": record.circuit_open,
            })
        })
        .collect();

    Ok(Json(json!({
        "inFlight": state.tracker.in_flight(),
        "cache": cache,
        "resolutionsCached": state.resolver.cached_count(),
        "gatewayHealth": health,
        "gatewayScores": state.temperature.all_scores(),
    })))
}

pub async fn metrics_handler(State(state): AppState) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics exporter not installed",
        )
            .into_response(),
    }
}

fn authorize(state: &AppStateData, headers: &HeaderMap) -> Result<(), Error> {
    let Some(expected) = &state.config.stats_auth_token else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(Error::InvalidRequest {
            message: "missing or invalid stats token".to_string(),
        })
    }
}
