use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::address::TxId;
use crate::cache::LruCache;
use crate::error::Error;

/// The only manifest dialect gateways serve.
pub const MANIFEST_TYPE: &str = "arweave/paths";

/// Content type a gateway uses when handing back a raw manifest body.
pub const MANIFEST_CONTENT_TYPE: &str = "application/x.arweave-manifest+json";

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestIndex {
    pub path: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestFallback {
    pub id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
}

/// An `arweave/paths` document: an immutable index from sub-paths to
/// content addresses, itself stored as addressed content.
#[derive(Clone, Debug, Deserialize)]
pub struct PathManifest {
    pub manifest: String,
    pub version: String,
    #[serde(default)]
    pub index: Option<ManifestIndex>,
    #[serde(default)]
    pub fallback: Option<ManifestFallback>,
    pub paths: HashMap<String, ManifestEntry>,
}

/// Outcome of mapping a requested sub-path through a manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestResolution {
    pub manifest_txid: TxId,
    pub path: String,
    pub content_txid: TxId,
    pub is_index: bool,
}

impl PathManifest {
    /// Strict parse: the manifest type, a string version, and the paths
    /// object are all required. Unknown fields are tolerated.
    pub fn parse(txid: &TxId, body: &[u8]) -> Result<PathManifest, Error> {
        let manifest: PathManifest =
            serde_json::from_slice(body).map_err(|e| Error::ManifestInvalid {
                txid: txid.as_str().to_string(),
                message: format!("not a parsable manifest: {e}"),
            })?;
        if manifest.manifest != MANIFEST_TYPE {
            return Err(Error::ManifestInvalid {
                txid: txid.as_str().to_string(),
                message: format!(
                    "unsupported manifest type `{}` (expected `{MANIFEST_TYPE}`)",
                    manifest.manifest
                ),
            });
        }
        Ok(manifest)
    }

    /// Resolution order: empty path → index, then fallback; otherwise an
    /// exact path match, then fallback; anything else is absent.
    pub fn resolve(&self, manifest_txid: &TxId, requested_path: &str) -> Result<ManifestResolution, Error> {
        let path = normalize_path(requested_path);

        if path.is_empty() {
            if let Some(index_path) = self.index.as_ref().and_then(|i| i.path.as_deref()) {
                if let Some(entry) = self.paths.get(index_path) {
                    return self.entry_to_resolution(manifest_txid, index_path, &entry.id, true);
                }
            }
            if let Some(fallback_id) = self.fallback.as_ref().and_then(|f| f.id.as_deref()) {
                return self.entry_to_resolution(manifest_txid, "", fallback_id, false);
            }
            return Err(Error::ManifestNotFound {
                txid: manifest_txid.as_str().to_string(),
                path,
            });
        }

        if let Some(entry) = self.paths.get(&path) {
            return self.entry_to_resolution(manifest_txid, &path, &entry.id, false);
        }
        if let Some(fallback_id) = self.fallback.as_ref().and_then(|f| f.id.as_deref()) {
            return self.entry_to_resolution(manifest_txid, &path, fallback_id, false);
        }
        Err(Error::ManifestNotFound {
            txid: manifest_txid.as_str().to_string(),
            path,
        })
    }

    fn entry_to_resolution(
        &self,
        manifest_txid: &TxId,
        path: &str,
        content_id: &str,
        is_index: bool,
    ) -> Result<ManifestResolution, Error> {
        let content_txid = TxId::from_str(content_id).map_err(|_| Error::ManifestInvalid {
            txid: manifest_txid.as_str().to_string(),
            message: format!("entry for `{path}` has invalid id `{content_id}`"),
        })?;
        Ok(ManifestResolution {
            manifest_txid: manifest_txid.clone(),
            path: path.to_string(),
            content_txid,
            is_index,
        })
    }
}

/// Manifest paths carry no leading slash; requests are normalised the same
/// way. Idempotent.
pub fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').trim_end_matches('/').to_string()
}

/// Verified, parsed manifests keyed by manifest txid. Manifests are
/// immutable content, so entries never expire; only LRU pressure evicts.
pub struct ManifestCache {
    cache: LruCache<String, Arc<PathManifest>>,
}

impl ManifestCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: LruCache::with_max_entries(max_entries),
        }
    }

    pub fn get(&self, txid: &TxId) -> Option<Arc<PathManifest>> {
        self.cache.get(&txid.as_str().to_string())
    }

    pub fn insert(&self, txid: &TxId, manifest: Arc<PathManifest>) {
        self.cache
            .insert(txid.as_str().to_string(), manifest, None);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST_TX: &str = "MMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMMA";
    const INDEX_TX: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const PAGE_TX: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBA";
    const FALLBACK_TX: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCA";

    fn manifest_tx() -> TxId {
        TxId::from_str(MANIFEST_TX).unwrap()
    }

    fn full_manifest() -> PathManifest {
        PathManifest::parse(
            &manifest_tx(),
            format!(
                r#"{{
                    "manifest": "arweave/paths",
                    "version": "0.2.0",
                    "index": {{ "path": "index.html" }},
                    "fallback": {{ "id": "{FALLBACK_TX}" }},
                    "paths": {{
                        "index.html": {{ "id": "{INDEX_TX}" }},
                        "a/b": {{ "id": "{PAGE_TX}" }}
                    }}
                }}"#
            )
            .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn parse_rejects_wrong_manifest_type() {
        let result = PathManifest::parse(
            &manifest_tx(),
            br#"{ "manifest": "arweave/other", "version": "1", "paths": {} }"#,
        );
        assert!(matches!(result, Err(Error::ManifestInvalid { .. })));
    }

    #[test]
    fn parse_rejects_missing_paths() {
        let result = PathManifest::parse(
            &manifest_tx(),
            br#"{ "manifest": "arweave/paths", "version": "1" }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(PathManifest::parse(&manifest_tx(), b"<html>").is_err());
    }

    #[test]
    fn empty_path_resolves_to_index() {
        let resolution = full_manifest().resolve(&manifest_tx(), "").unwrap();
        assert_eq!(resolution.content_txid.as_str(), INDEX_TX);
        assert!(resolution.is_index);
    }

    #[test]
    fn exact_path_match_wins() {
        let resolution = full_manifest().resolve(&manifest_tx(), "/a/b").unwrap();
        assert_eq!(resolution.content_txid.as_str(), PAGE_TX);
        assert!(!resolution.is_index);
        assert_eq!(resolution.path, "a/b");
    }

    #[test]
    fn unknown_path_uses_fallback() {
        let resolution = full_manifest().resolve(&manifest_tx(), "missing/page").unwrap();
        assert_eq!(resolution.content_txid.as_str(), FALLBACK_TX);
    }

    #[test]
    fn unknown_path_without_fallback_is_not_found() {
        let manifest = PathManifest::parse(
            &manifest_tx(),
            format!(
                r#"{{ "manifest": "arweave/paths", "version": "1",
                     "paths": {{ "a": {{ "id": "{PAGE_TX}" }} }} }}"#
            )
            .as_bytes(),
        )
        .unwrap();
        let result = manifest.resolve(&manifest_tx(), "b");
        assert!(matches!(result, Err(Error::ManifestNotFound { .. })));
    }

    #[test]
    fn empty_path_without_index_uses_fallback() {
        let manifest = PathManifest::parse(
            &manifest_tx(),
            format!(
                r#"{{ "manifest": "arweave/paths", "version": "1",
                     "fallback": {{ "id": "{FALLBACK_TX}" }},
                     "paths": {{}} }}"#
            )
            .as_bytes(),
        )
        .unwrap();
        let resolution = manifest.resolve(&manifest_tx(), "/").unwrap();
        assert_eq!(resolution.content_txid.as_str(), FALLBACK_TX);
    }

    #[test]
    fn invalid_entry_id_is_a_manifest_error() {
        let manifest = PathManifest::parse(
            &manifest_tx(),
            br#"{ "manifest": "arweave/paths", "version": "1",
                 "paths": { "a": { "id": "not-a-txid" } } }"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.resolve(&manifest_tx(), "a"),
            Err(Error::ManifestInvalid { .. })
        ));
    }

    #[test]
    fn normalize_path_is_idempotent() {
        for raw in ["", "/", "a/b", "/a/b", "a/b/", "/a/b/", "//a", "a//"] {
            let once = normalize_path(raw);
            assert_eq!(normalize_path(&once), once, "not idempotent for `{raw}`");
        }
        assert_eq!(normalize_path("/a/b/"), "a/b");
        assert_eq!(normalize_path("/"), "");
    }

    #[test]
    fn cache_round_trips_by_txid() {
        let cache = ManifestCache::new(10);
        let txid = manifest_tx();
        assert!(cache.get(&txid).is_none());
        cache.insert(&txid, Arc::new(full_manifest()));
        assert!(cache.get(&txid).is_some());
        assert_eq!(cache.len(), 1);
    }
}
