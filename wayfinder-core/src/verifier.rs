use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::address::TxId;
use crate::config::Config;
use crate::error::Error;
use crate::http_client::{FetchRequest, HttpClientPool};
use crate::registry::{gateway_key, trusted_verification_set, GatewayRegistry};

/// Header a gateway reports a content digest under.
pub const DIGEST_HEADER: &str = "x-ar-io-digest";

/// Header carrying the txid of the bytes actually served (the manifest
/// leaf for sub-path requests).
pub const DATA_ID_HEADER: &str = "x-ar-io-data-id";

/// Result of a successful digest-quorum check.
#[derive(Clone, Debug)]
pub struct VerificationOutcome {
    /// Hex SHA-256 of the verified bytes.
    pub digest: String,
    /// The trusted gateways that agreed with the computed digest.
    pub verified_by: Vec<String>,
    pub duration_ms: u64,
}

/// The security core: a routing gateway's bytes are accepted only if their
/// SHA-256 matches a digest reported by at least one *trusted* gateway.
/// Routing gateways therefore never need to be trusted: a lie is caught
/// before a single byte reaches the client.
pub struct Verifier {
    pool: Arc<HttpClientPool>,
    registry: Arc<dyn GatewayRegistry>,
    static_verification: Vec<Url>,
    timeout_ms: u64,
}

impl Verifier {
    pub fn new(
        pool: Arc<HttpClientPool>,
        registry: Arc<dyn GatewayRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            registry,
            static_verification: config.verification_gateways.clone(),
            timeout_ms: config.arns_timeout_ms,
        }
    }

    /// Hash the (already buffered, already decoded) body and require the
    /// digest to match at least one trusted gateway's answer for
    /// `expected_txid`.
    pub async fn verify_bytes(
        &self,
        data: &Bytes,
        expected_txid: &TxId,
    ) -> Result<VerificationOutcome, Error> {
        let started = Instant::now();
        let (digest_hex, digest_b64) = hash_bytes(data);

        let trusted =
            trusted_verification_set(self.registry.as_ref(), &self.static_verification).await;
        if trusted.is_empty() {
            return Err(Error::VerificationFailed {
                txid: expected_txid.as_str().to_string(),
                message: "no trusted gateways available for digest checks".to_string(),
            });
        }

        let queries = trusted.iter().map(|gateway| {
            let pool = &self.pool;
            async move {
                let digest = fetch_trusted_digest(pool, gateway, expected_txid, self.timeout_ms)
                    .await?;
                Some((gateway_key(gateway), digest))
            }
        });
        let answers: Vec<(String, String)> = join_all(queries).await.into_iter().flatten().collect();

        if answers.is_empty() {
            return Err(Error::VerificationFailed {
                txid: expected_txid.as_str().to_string(),
                message: format!("none of {} trusted gateways reported a digest", trusted.len()),
            });
        }

        let verified_by: Vec<String> = answers
            .iter()
            .filter(|(_, reported)| digest_matches(&digest_hex, &digest_b64, reported))
            .map(|(gateway, _)| gateway.clone())
            .collect();

        if verified_by.is_empty() {
            return Err(Error::VerificationFailed {
                txid: expected_txid.as_str().to_string(),
                message: format!(
                    "computed digest {digest_hex} does not match any of {} trusted digests",
                    answers.len()
                ),
            });
        }

        let disagreed = answers.len() - verified_by.len();
        if disagreed > 0 {
            tracing::warn!(
                txid = %expected_txid,
                disagreed,
                "trusted gateways disagreed with the verified digest"
            );
        }

        Ok(VerificationOutcome {
            digest: digest_hex,
            verified_by,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// SHA-256 of the body in both representations gateways use.
pub fn hash_bytes(data: &Bytes) -> (String, String) {
    let mut hasher = Sha256::new();
    // Chunked so the hot loop matches the streaming ingest path.
    for chunk in data.chunks(64 * 1024) {
        hasher.update(chunk);
    }
    let digest = hasher.finalize();
    (hex::encode(digest), URL_SAFE_NO_PAD.encode(digest))
}

/// Gateways report digests as base64url or hex; accept either.
pub fn digest_matches(local_hex: &str, local_b64: &str, reported: &str) -> bool {
    let reported = reported.trim();
    reported.eq_ignore_ascii_case(local_hex) || reported == local_b64
}

async fn fetch_trusted_digest(
    pool: &HttpClientPool,
    gateway: &Url,
    txid: &TxId,
    timeout_ms: u64,
) -> Option<String> {
    let url = gateway.join(&format!("raw/{txid}")).ok()?;
    let response = pool
        .fetch(FetchRequest::head(url, Duration::from_millis(timeout_ms)))
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpClientSettings;
    use crate::registry::StaticRegistry;
    use axum::http::HeaderMap;
    use axum::routing::head;
    use axum::Router;
    use std::net::SocketAddr;
    use std::str::FromStr;

    const TX: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn digest_gateway(digest: String) -> Router {
        Router::new().route(
            "/raw/{txid}",
            head(move || async move {
                let mut headers = HeaderMap::new();
                headers.insert(DIGEST_HEADER, digest.parse().unwrap());
                (headers, "")
            }),
        )
    }

    async fn verifier_with(routers: Vec<Router>) -> Verifier {
        let mut gateways = Vec::new();
        for router in routers {
            let addr = serve(router).await;
            gateways.push(Url::parse(&format!("http://{addr}")).unwrap());
        }
        let registry = Arc::new(StaticRegistry::new(vec![], gateways.clone()));
        let config = Config {
            verification_gateways: gateways,
            ..Config::default()
        };
        Verifier::new(
            Arc::new(HttpClientPool::new(HttpClientSettings::default())),
            registry,
            &config,
        )
    }

    #[tokio::test]
    async fn matching_digest_verifies_and_names_the_agreeing_gateways() {
        let body = Bytes::from_static(b"hello");
        let (digest_hex, _) = hash_bytes(&body);
        let verifier = verifier_with(vec![
            digest_gateway(digest_hex.clone()),
            digest_gateway(digest_hex.clone()),
        ])
        .await;

        let outcome = verifier
            .verify_bytes(&body, &TxId::from_str(TX).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.digest, digest_hex);
        assert_eq!(outcome.verified_by.len(), 2);
    }

    #[tokio::test]
    async fn one_agreeing_gateway_is_enough() {
        let body = Bytes::from_static(b"hello");
        let (digest_hex, _) = hash_bytes(&body);
        let (wrong_hex, _) = hash_bytes(&Bytes::from_static(b"other"));
        let verifier =
            verifier_with(vec![digest_gateway(digest_hex), digest_gateway(wrong_hex)]).await;

        let outcome = verifier
            .verify_bytes(&body, &TxId::from_str(TX).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.verified_by.len(), 1);
    }

    #[tokio::test]
    async fn unanimous_disagreement_fails_verification() {
        let (wrong_hex, _) = hash_bytes(&Bytes::from_static(b"Y"));
        let verifier =
            verifier_with(vec![digest_gateway(wrong_hex.clone()), digest_gateway(wrong_hex)]).await;

        let result = verifier
            .verify_bytes(&Bytes::from_static(b"X"), &TxId::from_str(TX).unwrap())
            .await;
        assert!(matches!(result, Err(Error::VerificationFailed { .. })));
    }

    #[tokio::test]
    async fn silent_trusted_set_fails_verification() {
        let verifier = verifier_with(vec![
            Router::new().route("/raw/{txid}", head(|| async { "" })),
        ])
        .await;
        let result = verifier
            .verify_bytes(&Bytes::from_static(b"X"), &TxId::from_str(TX).unwrap())
            .await;
        assert!(matches!(result, Err(Error::VerificationFailed { .. })));
    }

    #[tokio::test]
    async fn base64url_digests_are_accepted() {
        let body = Bytes::from_static(b"payload");
        let (_, digest_b64) = hash_bytes(&body);
        let verifier = verifier_with(vec![digest_gateway(digest_b64)]).await;
        let outcome = verifier
            .verify_bytes(&body, &TxId::from_str(TX).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.verified_by.len(), 1);
    }

    #[test]
    fn digest_comparison_normalises_case_for_hex_only() {
        let body = Bytes::from_static(b"z");
        let (hex_digest, b64_digest) = hash_bytes(&body);
        assert!(digest_matches(&hex_digest, &b64_digest, &hex_digest.to_uppercase()));
        assert!(digest_matches(&hex_digest, &b64_digest, &b64_digest));
        assert!(!digest_matches(&hex_digest, &b64_digest, "nonsense"));
    }

    #[test]
    fn hashing_is_chunk_order_independent() {
        let data = Bytes::from(vec![7u8; 200_000]);
        let (a, _) = hash_bytes(&data);
        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(a, expected);
    }
}
