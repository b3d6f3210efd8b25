#![forbid(unsafe_code)]

pub mod address; // transaction ids, ArNS names, sandbox subdomains
pub mod arns; // ArNS consensus resolver
pub mod cache; // LRU primitives and the two-tier content cache
pub mod config; // environment-driven configuration
pub mod endpoints; // HTTP handlers
pub mod error; // error handling
pub mod fetcher; // gateway content fetcher
pub mod health; // per-gateway circuit breaker
pub mod http_client; // pooled outbound HTTP client
pub mod manifest; // path manifest parsing and resolution
pub mod observability; // logs and metrics bootstrap
pub mod ping; // background gateway probing
pub mod pipeline; // verified content pipeline
pub mod registry; // gateway registry providers
pub mod request_tracker; // in-flight accounting and drain barrier
pub mod router_util; // application state and router construction
pub mod routing; // gateway selection strategies
pub mod single_flight; // request coalescing
pub mod temperature; // sliding-window gateway performance tracker
pub mod time_util; // epoch-millisecond helpers
pub mod verifier; // digest-quorum verification

pub const WAYFINDER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Component tag sent to upstream gateways on every outbound request.
pub const COMPONENT_NAME: &str = "wayfinder-router";
