//! Identity directory: handle and DID resolution.
//!
//! DID documents come from plc.directory (for `did:plc:`) or the domain's
//! `.well-known/did.json` (for `did:web:`); handles resolve through the
//! domain's `.well-known/atproto-did`. Lookups are wrapped in a bounded
//! TTL'd cache since the same few identities dominate any hydration burst.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::AtprotoError;

/// A resolved identity: both identifiers plus the origin host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub did: String,
    pub handle: String,
    /// PDS base URL (e.g. `https://pds.example.com`), no trailing slash.
    pub pds: String,
}

/// Directory lookups used by hydration, the missing-record fetcher and the
/// follow scraper.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn lookup_did(&self, did: &str) -> Result<ResolvedIdentity, AtprotoError>;
    async fn lookup_handle(&self, handle: &str) -> Result<ResolvedIdentity, AtprotoError>;
}

/// Default PLC directory host.
pub const DEFAULT_PLC_HOST: &str = "https://plc.directory";

/// HTTP-backed directory.
pub struct HttpDirectory {
    http: Client,
    plc_host: String,
}

impl HttpDirectory {
    pub fn new(plc_host: impl Into<String>) -> Result<Self, AtprotoError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            plc_host: plc_host.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default, rename = "alsoKnownAs")]
    also_known_as: Vec<String>,
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
struct DidService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(rename = "serviceEndpoint")]
    service_endpoint: String,
}

impl DidDocument {
    fn handle(&self) -> Option<String> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .map(String::from)
    }

    fn pds(&self) -> Option<String> {
        self.service
            .iter()
            .find(|s| s.service_type == "AtprotoPersonalDataServer")
            .map(|s| s.service_endpoint.trim_end_matches('/').to_string())
    }
}

#[async_trait]
impl IdentityDirectory for HttpDirectory {
    async fn lookup_did(&self, did: &str) -> Result<ResolvedIdentity, AtprotoError> {
        let doc_url = if did.starts_with("did:plc:") {
            format!("{}/{}", self.plc_host, did)
        } else if let Some(domain) = did.strip_prefix("did:web:") {
            format!("https://{domain}/.well-known/did.json")
        } else {
            return Err(AtprotoError::InvalidDid(did.to_string()));
        };

        let response = self.http.get(&doc_url).send().await?;
        if !response.status().is_success() {
            return Err(AtprotoError::IdentityResolution {
                ident: did.to_string(),
                reason: format!("DID document fetch returned {}", response.status()),
            });
        }

        let doc: DidDocument = response.json().await?;

        let handle = doc.handle().ok_or_else(|| AtprotoError::IdentityResolution {
            ident: did.to_string(),
            reason: "DID document has no at:// alias".to_string(),
        })?;
        let pds = doc.pds().ok_or_else(|| AtprotoError::IdentityResolution {
            ident: did.to_string(),
            reason: "DID document has no PDS service".to_string(),
        })?;

        debug!(did = %did, handle = %handle, pds = %pds, "resolved DID");

        Ok(ResolvedIdentity {
            did: did.to_string(),
            handle,
            pds,
        })
    }

    async fn lookup_handle(&self, handle: &str) -> Result<ResolvedIdentity, AtprotoError> {
        let url = format!("https://{handle}/.well-known/atproto-did");
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AtprotoError::IdentityResolution {
                ident: handle.to_string(),
                reason: format!("well-known lookup returned {}", response.status()),
            });
        }

        let did = response.text().await?.trim().to_string();
        if !did.starts_with("did:") {
            return Err(AtprotoError::IdentityResolution {
                ident: handle.to_string(),
                reason: "well-known response is not a DID".to_string(),
            });
        }

        self.lookup_did(&did).await
    }
}

/// A bounded TTL'd cache over any directory.
pub struct CachedDirectory<D> {
    inner: D,
    cache: Mutex<LruCache<String, (Instant, ResolvedIdentity)>>,
    ttl: Duration,
}

impl<D> CachedDirectory<D> {
    pub fn new(inner: D, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn cache_get(&self, key: &str) -> Option<ResolvedIdentity> {
        let mut cache = self.cache.lock().ok()?;
        let (at, ident) = cache.get(key)?;
        if at.elapsed() > self.ttl {
            cache.pop(key);
            return None;
        }
        Some(ident.clone())
    }

    fn cache_put(&self, ident: &ResolvedIdentity) {
        if let Ok(mut cache) = self.cache.lock() {
            let entry = (Instant::now(), ident.clone());
            cache.put(ident.did.clone(), entry.clone());
            cache.put(ident.handle.clone(), entry);
        }
    }
}

#[async_trait]
impl<D: IdentityDirectory> IdentityDirectory for CachedDirectory<D> {
    async fn lookup_did(&self, did: &str) -> Result<ResolvedIdentity, AtprotoError> {
        if let Some(hit) = self.cache_get(did) {
            return Ok(hit);
        }
        let ident = self.inner.lookup_did(did).await?;
        self.cache_put(&ident);
        Ok(ident)
    }

    async fn lookup_handle(&self, handle: &str) -> Result<ResolvedIdentity, AtprotoError> {
        if let Some(hit) = self.cache_get(handle) {
            return Ok(hit);
        }
        let ident = self.inner.lookup_handle(handle).await?;
        self.cache_put(&ident);
        Ok(ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn did_doc_json() -> serde_json::Value {
        serde_json::json!({
            "id": "did:plc:abc123",
            "alsoKnownAs": ["at://alice.example.com"],
            "service": [
                {
                    "id": "#atproto_pds",
                    "type": "AtprotoPersonalDataServer",
                    "serviceEndpoint": "https://pds.example.com/"
                }
            ]
        })
    }

    #[tokio::test]
    async fn test_lookup_plc_did() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/did:plc:abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(did_doc_json()))
            .mount(&server)
            .await;

        let dir = HttpDirectory::new(server.uri()).unwrap();
        let ident = dir.lookup_did("did:plc:abc123").await.unwrap();
        assert_eq!(ident.handle, "alice.example.com");
        // trailing slash trimmed
        assert_eq!(ident.pds, "https://pds.example.com");
    }

    #[tokio::test]
    async fn test_lookup_did_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/did:plc:missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = HttpDirectory::new(server.uri()).unwrap();
        let result = dir.lookup_did("did:plc:missing").await;
        assert!(matches!(
            result,
            Err(AtprotoError::IdentityResolution { .. })
        ));
    }

    #[tokio::test]
    async fn test_lookup_unsupported_did_method() {
        let dir = HttpDirectory::new(DEFAULT_PLC_HOST).unwrap();
        let result = dir.lookup_did("did:key:z6Mk").await;
        assert!(matches!(result, Err(AtprotoError::InvalidDid(_))));
    }

    struct CountingDirectory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IdentityDirectory for CountingDirectory {
        async fn lookup_did(&self, did: &str) -> Result<ResolvedIdentity, AtprotoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedIdentity {
                did: did.to_string(),
                handle: "alice.example.com".to_string(),
                pds: "https://pds.example.com".to_string(),
            })
        }

        async fn lookup_handle(&self, handle: &str) -> Result<ResolvedIdentity, AtprotoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedIdentity {
                did: "did:plc:abc123".to_string(),
                handle: handle.to_string(),
                pds: "https://pds.example.com".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_cached_directory_hits_inner_once() {
        let dir = CachedDirectory::new(
            CountingDirectory {
                calls: AtomicUsize::new(0),
            },
            16,
            Duration::from_secs(60),
        );

        dir.lookup_did("did:plc:abc123").await.unwrap();
        dir.lookup_did("did:plc:abc123").await.unwrap();
        assert_eq!(dir.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_directory_caches_both_keys() {
        let dir = CachedDirectory::new(
            CountingDirectory {
                calls: AtomicUsize::new(0),
            },
            16,
            Duration::from_secs(60),
        );

        // A DID lookup also primes the handle key.
        let ident = dir.lookup_did("did:plc:abc123").await.unwrap();
        let again = dir.lookup_handle(&ident.handle).await.unwrap();
        assert_eq!(again.did, "did:plc:abc123");
        assert_eq!(dir.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_directory_expires() {
        let dir = CachedDirectory::new(
            CountingDirectory {
                calls: AtomicUsize::new(0),
            },
            16,
            Duration::from_millis(0),
        );

        dir.lookup_did("did:plc:abc123").await.unwrap();
        dir.lookup_did("did:plc:abc123").await.unwrap();
        assert_eq!(dir.inner.calls.load(Ordering::SeqCst), 2);
    }
}
