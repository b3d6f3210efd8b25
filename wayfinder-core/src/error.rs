use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// Every failure the router can surface. Variants carry a stable machine
/// code (`code()`) and an HTTP status hint (`status_code()`), so handlers
/// can simply return `Err(error)` and let `IntoResponse` do the rest.
///
/// `Clone` matters: a failed single-flight result is fanned out to every
/// coalesced waiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    AppState {
        message: String,
    },
    ArnsConsensusMismatch {
        name: String,
        resolved_ids: Vec<String>,
    },
    ArnsResolutionFailed {
        name: String,
        message: String,
    },
    CacheIo {
        message: String,
    },
    Config {
        message: String,
    },
    GatewayRequest {
        message: String,
        status_code: Option<StatusCode>,
    },
    Internal {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    InvalidSandbox {
        subdomain: String,
        txid: String,
    },
    ManifestInvalid {
        txid: String,
        message: String,
    },
    ManifestNotFound {
        txid: String,
        path: String,
    },
    ManifestPathMismatch {
        manifest_txid: String,
        expected: String,
        reported: String,
    },
    NoHealthyGateways {
        message: String,
    },
    NotFound {
        message: String,
    },
    ServiceUnavailable {
        message: String,
    },
    Timeout {
        message: String,
    },
    VerificationFailed {
        txid: String,
        message: String,
    },
}

impl Error {
    /// Stable machine-readable code included in every error response body.
    pub fn code(&self) -> &'static str {
        match self {
            Error::AppState { .. } => "APP_STATE",
            Error::ArnsConsensusMismatch { .. } => "ARNS_CONSENSUS_MISMATCH",
            Error::ArnsResolutionFailed { .. } => "ARNS_RESOLUTION_FAILED",
            Error::CacheIo { .. } => "CACHE_IO",
            Error::Config { .. } => "CONFIG",
            Error::GatewayRequest { .. } => "GATEWAY_ERROR",
            Error::Internal { .. } => "INTERNAL",
            Error::InvalidRequest { .. } => "INVALID_REQUEST",
            Error::InvalidSandbox { .. } => "INVALID_SANDBOX",
            Error::ManifestInvalid { .. } => "MANIFEST_INVALID",
            Error::ManifestNotFound { .. } => "MANIFEST_NOT_FOUND",
            Error::ManifestPathMismatch { .. } => "MANIFEST_PATH_MISMATCH",
            Error::NoHealthyGateways { .. } => "NO_HEALTHY_GATEWAYS",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Error::Timeout { .. } => "TIMEOUT",
            Error::VerificationFailed { .. } => "VERIFICATION_FAILED",
        }
    }

    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            Error::AppState { .. } => tracing::Level::ERROR,
            Error::ArnsConsensusMismatch { .. } => tracing::Level::ERROR,
            Error::ArnsResolutionFailed { .. } => tracing::Level::WARN,
            Error::CacheIo { .. } => tracing::Level::WARN,
            Error::Config { .. } => tracing::Level::ERROR,
            Error::GatewayRequest { .. } => tracing::Level::WARN,
            Error::Internal { .. } => tracing::Level::ERROR,
            Error::InvalidRequest { .. } => tracing::Level::WARN,
            Error::InvalidSandbox { .. } => tracing::Level::WARN,
            Error::ManifestInvalid { .. } => tracing::Level::WARN,
            Error::ManifestNotFound { .. } => tracing::Level::WARN,
            Error::ManifestPathMismatch { .. } => tracing::Level::ERROR,
            Error::NoHealthyGateways { .. } => tracing::Level::ERROR,
            Error::NotFound { .. } => tracing::Level::DEBUG,
            Error::ServiceUnavailable { .. } => tracing::Level::WARN,
            Error::Timeout { .. } => tracing::Level::WARN,
            Error::VerificationFailed { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ArnsConsensusMismatch { .. } => StatusCode::BAD_GATEWAY,
            Error::ArnsResolutionFailed { .. } => StatusCode::NOT_FOUND,
            Error::CacheIo { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::GatewayRequest { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Error::InvalidSandbox { .. } => StatusCode::BAD_REQUEST,
            Error::ManifestInvalid { .. } => StatusCode::BAD_GATEWAY,
            Error::ManifestNotFound { .. } => StatusCode::NOT_FOUND,
            Error::ManifestPathMismatch { .. } => StatusCode::BAD_GATEWAY,
            Error::NoHealthyGateways { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::VerificationFailed { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AppState { message } => {
                write!(f, "Error initializing application state: {message}")
            }
            Error::ArnsConsensusMismatch { name, resolved_ids } => {
                write!(
                    f,
                    "Trusted gateways disagree on resolution of `{name}`: {}",
                    resolved_ids.join(", ")
                )
            }
            Error::ArnsResolutionFailed { name, message } => {
                write!(f, "Failed to resolve ArNS name `{name}`: {message}")
            }
            Error::CacheIo { message } => write!(f, "Content cache I/O error: {message}"),
            Error::Config { message } => write!(f, "Invalid configuration: {message}"),
            Error::GatewayRequest { message, .. } => write!(f, "Gateway error: {message}"),
            Error::Internal { message } => write!(f, "{message}"),
            Error::InvalidRequest { message } => write!(f, "{message}"),
            Error::InvalidSandbox { subdomain, txid } => {
                write!(
                    f,
                    "Sandbox subdomain `{subdomain}` does not match transaction id `{txid}`"
                )
            }
            Error::ManifestInvalid { txid, message } => {
                write!(f, "Invalid path manifest `{txid}`: {message}")
            }
            Error::ManifestNotFound { txid, path } => {
                write!(f, "No manifest entry for path `{path}` in `{txid}`")
            }
            Error::ManifestPathMismatch {
                manifest_txid,
                expected,
                reported,
            } => {
                write!(
                    f,
                    "Manifest `{manifest_txid}` maps the requested path to `{expected}` but the gateway served `{reported}`"
                )
            }
            Error::NoHealthyGateways { message } => write!(f, "{message}"),
            Error::NotFound { message } => write!(f, "{message}"),
            Error::ServiceUnavailable { message } => write!(f, "{message}"),
            Error::Timeout { message } => write!(f, "Request timed out: {message}"),
            Error::VerificationFailed { txid, message } => {
                write!(f, "Verification failed for `{txid}`: {message}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        self.log();
        let body = json!({ "error": self.to_string(), "code": self.code() });
        (self.status_code(), Json(body)).into_response()
    }
}

pub trait ResultExt<T> {
    fn ok_or_log(self) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn ok_or_log(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                error.log();
                None
            }
        }
    }
}
