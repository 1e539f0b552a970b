use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::metrics::{CACHE_HITS, CACHE_MISSES};
use crate::store::Store;

/// Static caching contract for one handler: namespace, TTL, and whether the
/// entry varies per user.
#[derive(Debug, Clone)]
pub struct CacheSpec {
    pub namespace: String,
    pub ttl: Duration,
    pub vary_user: bool,
}

impl CacheSpec {
    pub fn new(namespace: &str, ttl: Duration) -> Self {
        Self {
            namespace: namespace.to_string(),
            ttl,
            vary_user: false,
        }
    }

    pub fn vary_user(mut self) -> Self {
        self.vary_user = true;
        self
    }
}

/// The request-derived half of a cache key.
#[derive(Debug, Clone, Default)]
pub struct CacheRequest {
    pub method: String,
    pub path: String,
    pub route_params: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub user_key: Option<String>,
}

impl CacheRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn route_param(mut self, name: &str, value: &str) -> Self {
        self.route_params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn query_param(mut self, name: &str, value: &str) -> Self {
        self.query_params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn user(mut self, user_key: &str) -> Self {
        self.user_key = Some(user_key.to_string());
        self
    }
}

/// Canonical cache key: SHA-256 over the sorted-key JSON of the identifying
/// tuple. serde_json's default map is ordered, so field order in the source
/// request can never change the key.
pub fn cache_key(spec: &CacheSpec, req: &CacheRequest) -> String {
    let identity = json!({
        "ns": spec.namespace,
        "m": req.method.to_uppercase(),
        "p": req.path,
        "rp": req.route_params,
        "qp": req.query_params,
        "u": if spec.vary_user { req.user_key.as_deref() } else { None },
    });

    let mut hasher = Sha256::new();
    hasher.update(identity.to_string().as_bytes());
    let digest = hasher.finalize();

    format!("anticip8:cache:{}:{:x}", spec.namespace, digest)
}

/// Namespaced TTL JSON cache in front of handler responses, shared by real
/// requests and prefetch warmers. Fail-open on every store error: a dead KV
/// degrades to uncached computation, never to a failed request.
///
/// Only JSON values pass through here; handlers that stream or build raw
/// responses bypass the cache entirely.
#[derive(Clone)]
pub struct ResponseCache {
    store: Store,
    service: String,
}

impl ResponseCache {
    pub fn new(store: Store, service: &str) -> Self {
        Self {
            store,
            service: service.to_string(),
        }
    }

    pub async fn get_json(&self, key: &str, namespace: &str) -> Option<serde_json::Value> {
        let raw = match self.store.get(key).await {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "cache get failed, fail-open");
                None
            }
        };

        match raw {
            Some(body) => match serde_json::from_str(&body) {
                Ok(value) => {
                    CACHE_HITS
                        .with_label_values(&[&self.service, namespace])
                        .inc();
                    Some(value)
                }
                Err(_) => {
                    // corrupted entry; treat as a miss
                    CACHE_MISSES
                        .with_label_values(&[&self.service, namespace])
                        .inc();
                    None
                }
            },
            None => {
                CACHE_MISSES
                    .with_label_values(&[&self.service, namespace])
                    .inc();
                None
            }
        }
    }

    pub async fn put_json(&self, key: &str, ttl: Duration, value: &serde_json::Value) {
        let payload = value.to_string();
        if let Err(err) = self.store.set_ex(key, &payload, ttl).await {
            debug!(error = %err, "cache set failed, fail-open");
        }
    }

    /// Serve from cache or compute and store. The wrapper around every
    /// cacheable handler body.
    pub async fn get_or_compute<F, Fut>(
        &self,
        spec: &CacheSpec,
        req: &CacheRequest,
        compute: F,
    ) -> serde_json::Value
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = serde_json::Value>,
    {
        let key = cache_key(spec, req);
        if let Some(hit) = self.get_json(&key, &spec.namespace).await {
            return hit;
        }

        let value = compute().await;
        self.put_json(&key, spec.ttl, &value).await;
        value
    }

    /// Warmer write-through: place a precomputed value at the canonical key
    /// a future real request will hit.
    pub async fn warm(&self, spec: &CacheSpec, req: &CacheRequest, value: &serde_json::Value) {
        let key = cache_key(spec, req);
        self.put_json(&key, spec.ttl, value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CacheSpec {
        CacheSpec::new("options", Duration::from_secs(60))
    }

    #[test]
    fn key_is_stable_across_param_insertion_order() {
        let a = CacheRequest::get("/order-options/15")
            .route_param("order_id", "15")
            .query_param("a", "1")
            .query_param("b", "2");
        let b = CacheRequest::get("/order-options/15")
            .query_param("b", "2")
            .query_param("a", "1")
            .route_param("order_id", "15");
        assert_eq!(cache_key(&spec(), &a), cache_key(&spec(), &b));
    }

    #[test]
    fn key_differs_per_namespace_and_path() {
        let req = CacheRequest::get("/order-options/15");
        let other_ns = CacheSpec::new("pricing", Duration::from_secs(60));
        assert_ne!(cache_key(&spec(), &req), cache_key(&other_ns, &req));

        let other_path = CacheRequest::get("/order-options/16");
        assert_ne!(cache_key(&spec(), &req), cache_key(&spec(), &other_path));
    }

    #[test]
    fn user_only_varies_key_when_requested() {
        let anon = CacheRequest::get("/p");
        let u1 = CacheRequest::get("/p").user("u1");

        // vary_user off: user identity is erased from the key
        assert_eq!(cache_key(&spec(), &anon), cache_key(&spec(), &u1));

        let vary = CacheSpec::new("options", Duration::from_secs(60)).vary_user();
        assert_ne!(cache_key(&vary, &anon), cache_key(&vary, &u1));
    }

    #[tokio::test]
    async fn get_or_compute_round_trips() {
        let cache = ResponseCache::new(Store::memory(), "test-svc");
        let s = spec();
        let req = CacheRequest::get("/order-options/7").route_param("order_id", "7");

        let first = cache
            .get_or_compute(&s, &req, || async { json!({"options": ["A", "B"]}) })
            .await;
        assert_eq!(first["options"][0], "A");

        // Second call must be served from the store, not recomputed.
        let second = cache
            .get_or_compute(&s, &req, || async { json!({"options": ["DIFFERENT"]}) })
            .await;
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn warm_populates_the_canonical_key() {
        let cache = ResponseCache::new(Store::memory(), "test-svc");
        let s = spec();
        let req = CacheRequest::get("/order-options/9").route_param("order_id", "9");

        cache.warm(&s, &req, &json!({"options": ["W"]})).await;

        let got = cache
            .get_or_compute(&s, &req, || async { json!({"options": ["COMPUTED"]}) })
            .await;
        assert_eq!(got["options"][0], "W");
    }

    #[tokio::test]
    async fn corrupted_entries_fall_through_to_compute() {
        let store = Store::memory();
        let cache = ResponseCache::new(store.clone(), "test-svc");
        let s = spec();
        let req = CacheRequest::get("/p");

        let key = cache_key(&s, &req);
        store
            .set_ex(&key, "{not json", Duration::from_secs(60))
            .await
            .unwrap();

        let got = cache
            .get_or_compute(&s, &req, || async { json!({"ok": true}) })
            .await;
        assert_eq!(got["ok"], true);
    }
}
