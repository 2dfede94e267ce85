//! Profile lookup and cache
//!
//! The gateway enriches outbound envelopes with the sender's display name and
//! mobile number. Profiles come from an external service and are cached in a
//! bounded LRU keyed by a digest of the raw user ID, so raw identifiers stay
//! out of the in-process cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Default cache capacity
const CACHE_CAPACITY: usize = 1000;

/// Deterministic digest of a raw user identifier: URL-safe unpadded base64 of
/// SHA-256 over the UTF-8 bytes. Stable across restarts.
pub fn digest(raw: &str) -> String {
    let hash = Sha256::digest(raw.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Customer profile as served by the profile backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub customer_id: Option<i64>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl Profile {
    /// "First Last" display name; empty parts are skipped
    pub fn display_name(&self) -> String {
        let mut parts = Vec::new();
        if let Some(first) = self.first_name.as_deref().filter(|s| !s.is_empty()) {
            parts.push(first);
        }
        if let Some(last) = self.last_name.as_deref().filter(|s| !s.is_empty()) {
            parts.push(last);
        }
        parts.join(" ")
    }
}

/// External profile lookup
#[async_trait]
pub trait ProfileLoader: Send + Sync {
    /// Load the profile for a raw customer ID. `Ok(None)` means the customer
    /// does not exist; `Err` means the backend was unreachable.
    async fn load(&self, customer_id: &str) -> anyhow::Result<Option<Profile>>;
}

/// HTTP client against the profile service
pub struct HttpProfileLoader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProfileLoader {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProfileLoader for HttpProfileLoader {
    async fn load(&self, customer_id: &str) -> anyhow::Result<Option<Profile>> {
        let url = format!("{}/v1/customer/details/{}", self.base_url, customer_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        let profile: Profile = response.json().await?;
        Ok(Some(profile))
    }
}

/// Bounded LRU over the profile loader (cache key = digest, load key = raw ID)
///
/// A single mutex serializes access; the hot path is a hit, so contention is
/// acceptable. Load failures are not cached.
pub struct ProfileCache {
    loader: Arc<dyn ProfileLoader>,
    cache: Mutex<LruCache<String, Profile>>,
}

impl ProfileCache {
    pub fn new(loader: Arc<dyn ProfileLoader>) -> Self {
        Self::with_capacity(loader, CACHE_CAPACITY)
    }

    pub fn with_capacity(loader: Arc<dyn ProfileLoader>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            loader,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached profile for a raw user ID, loading on miss.
    /// Returns `None` when the customer is unknown or the backend failed.
    pub async fn get_or_load(&self, raw_id: &str) -> Option<Profile> {
        if raw_id.is_empty() {
            return None;
        }
        let key = digest(raw_id);

        if let Some(profile) = self.cache.lock().ok()?.get(&key).cloned() {
            return Some(profile);
        }

        match self.loader.load(raw_id).await {
            Ok(Some(profile)) => {
                if let Ok(mut cache) = self.cache.lock() {
                    cache.put(key, profile.clone());
                }
                Some(profile)
            }
            Ok(None) => {
                debug!(user_id = raw_id, "profile not found");
                None
            }
            Err(e) => {
                warn!(user_id = raw_id, error = %e, "profile load failed");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Loader serving a fixed profile per known ID, counting backend hits
    pub(crate) struct StubLoader {
        pub known: Vec<(String, Profile)>,
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl StubLoader {
        pub(crate) fn single(id: &str, first: &str, last: &str, mobile: &str) -> Self {
            Self {
                known: vec![(
                    id.to_string(),
                    Profile {
                        customer_id: id.parse().ok(),
                        mobile: Some(mobile.to_string()),
                        email: None,
                        first_name: Some(first.to_string()),
                        last_name: Some(last.to_string()),
                    },
                )],
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                known: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl ProfileLoader for StubLoader {
        async fn load(&self, customer_id: &str) -> anyhow::Result<Option<Profile>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("profile service unavailable");
            }
            Ok(self
                .known
                .iter()
                .find(|(id, _)| id == customer_id)
                .map(|(_, p)| p.clone()))
        }
    }

    #[test]
    fn test_digest_is_deterministic_and_url_safe() {
        let a = digest("customer42");
        let b = digest("customer42");
        assert_eq!(a, b);
        assert_ne!(a, digest("customer43"));
        // 32 bytes of SHA-256 -> 43 base64 chars, no padding
        assert_eq!(a.len(), 43);
        assert!(!a.contains('='));
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
    }

    #[tokio::test]
    async fn test_miss_populates_cache() {
        let loader = Arc::new(StubLoader::single("1", "John", "Doe", "919905663451"));
        let cache = ProfileCache::new(loader.clone());

        let first = cache.get_or_load("1").await.unwrap();
        assert_eq!(first.display_name(), "John Doe");
        let second = cache.get_or_load("1").await.unwrap();
        assert_eq!(second.mobile.as_deref(), Some("919905663451"));

        // second call served from cache
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let loader = Arc::new(StubLoader::failing());
        let cache = ProfileCache::new(loader.clone());

        assert!(cache.get_or_load("1").await.is_none());
        assert!(cache.get_or_load("1").await.is_none());

        // both attempts hit the backend; negative results never stick
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lru_evicts_oldest() {
        let loader = Arc::new(StubLoader {
            known: vec![
                ("1".to_string(), Profile::default()),
                ("2".to_string(), Profile::default()),
                ("3".to_string(), Profile::default()),
            ],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cache = ProfileCache::with_capacity(loader.clone(), 2);

        cache.get_or_load("1").await;
        cache.get_or_load("2").await;
        cache.get_or_load("3").await; // evicts "1"
        cache.get_or_load("1").await; // reloads

        assert_eq!(loader.calls.load(Ordering::SeqCst), 4);
    }
}
