//! Response cache for idempotent requests.
//!
//! Keys are `namespace:METHOD:path:sortedQuery[:userId]`. The cache owns the
//! response-writing step for cacheable requests: on a miss the upstream body is
//! streamed to the client while a copy is kept, and the copy is stored once the
//! body completes ([`ResponseCache::write_through`]). Concurrent misses may both
//! store; the last write wins.

use crate::auth::Identity;
use crate::config::{CacheConfig, CacheMode};
use crate::routes::RouteEntry;
use crate::store::SharedStore;
use hyper::body::{HttpBody, Sender};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Method, Response, StatusCode};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const X_CACHE: &str = "x-cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    Anonymous,
    User,
    Health,
}

impl CacheNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheNamespace::Anonymous => "anon",
            CacheNamespace::User => "user",
            CacheNamespace::Health => "health",
        }
    }
}

/// Deterministic cache key; query parameter order never matters.
pub fn cache_key(
    namespace: CacheNamespace,
    method: &Method,
    path: &str,
    query: Option<&str>,
    user_id: Option<&str>,
) -> String {
    let mut pairs: Vec<&str> = query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .collect();
    pairs.sort_unstable();

    let mut key = format!(
        "{}:{}:{}:{}",
        namespace.as_str(),
        method.as_str(),
        path,
        pairs.join("&")
    );
    if let Some(user_id) = user_id {
        key.push(':');
        key.push_str(user_id);
    }
    key
}

/// Where and for how long a cacheable request is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePlan {
    pub key: String,
    pub namespace: CacheNamespace,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl CachedResponse {
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        if let Some(content_type) = self.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("HIT"));
        response
    }
}

const DEFAULT_FILL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ResponseCache {
    store: SharedStore,
    config: CacheConfig,
    fill_timeout: Duration,
}

impl ResponseCache {
    pub fn new(store: SharedStore, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            fill_timeout: DEFAULT_FILL_TIMEOUT,
        }
    }

    /// Longest wait for the next chunk of an upstream body being cached.
    pub fn with_fill_timeout(mut self, fill_timeout: Duration) -> Self {
        self.fill_timeout = fill_timeout;
        self
    }

    fn namespace_ttl(&self, namespace: CacheNamespace) -> Duration {
        Duration::from_secs(match namespace {
            CacheNamespace::Anonymous => self.config.anonymous_ttl_secs,
            CacheNamespace::User => self.config.user_ttl_secs,
            CacheNamespace::Health => self.config.health_ttl_secs,
        })
    }

    /// Decide whether a routed request is cacheable, and under which key.
    ///
    /// Only GETs are cached. A request carrying user identity is skipped unless
    /// the route opts into per-user caching, so private responses never land in
    /// the shared namespace.
    pub fn plan(
        &self,
        method: &Method,
        route: &RouteEntry,
        path: &str,
        query: Option<&str>,
        identity: Option<&Identity>,
    ) -> Option<CachePlan> {
        if !self.config.enabled || method != Method::GET || route.upgrade {
            return None;
        }

        let (namespace, user_id) = match (route.cache.mode, identity) {
            (CacheMode::Disabled, _) => return None,
            (CacheMode::Anonymous, Some(_)) => return None,
            (CacheMode::PerUser, Some(identity)) => {
                (CacheNamespace::User, Some(identity.user_id.as_str()))
            }
            (CacheMode::Anonymous, None) | (CacheMode::PerUser, None) => {
                (CacheNamespace::Anonymous, None)
            }
        };

        let ttl = route
            .cache
            .ttl_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.namespace_ttl(namespace));

        Some(CachePlan {
            key: cache_key(namespace, method, path, query, user_id),
            namespace,
            ttl,
        })
    }

    pub fn health_plan(&self, path: &str) -> CachePlan {
        CachePlan {
            key: cache_key(CacheNamespace::Health, &Method::GET, path, None, None),
            namespace: CacheNamespace::Health,
            ttl: self.namespace_ttl(CacheNamespace::Health),
        }
    }

    /// A definitive hit, or `None` on miss, decode failure or store outage.
    pub async fn lookup(&self, plan: &CachePlan) -> Option<CachedResponse> {
        let namespace = plan.namespace.as_str();
        let raw = match self.store.get(&plan.key).await {
            Ok(raw) => raw,
            Err(e) => {
                counter!("gateway.cache.unavailable", 1);
                tracing::warn!(key = %plan.key, error = %e, "Cache lookup failed, passing request through");
                return None;
            }
        };

        match raw.map(|bytes| serde_json::from_slice::<CachedResponse>(&bytes)) {
            Some(Ok(entry)) => {
                counter!("gateway.cache.hit", 1, "namespace" => namespace);
                tracing::debug!(key = %plan.key, "Cache hit");
                Some(entry)
            }
            Some(Err(e)) => {
                tracing::warn!(key = %plan.key, error = %e, "Discarding undecodable cache entry");
                let _ = self.store.delete(&plan.key).await;
                None
            }
            None => {
                counter!("gateway.cache.miss", 1, "namespace" => namespace);
                None
            }
        }
    }

    pub async fn store(&self, plan: &CachePlan, entry: &CachedResponse) {
        put_entry(&self.store, plan, entry).await;
    }

    /// Hand a successful upstream response to the client and cache it on the
    /// way through. Headers go out immediately; the body is forwarded chunk by
    /// chunk and stored only if it completes within `max_entry_bytes` as
    /// UTF-8. Non-2xx responses pass through untouched.
    pub fn write_through(&self, plan: &CachePlan, response: Response<Body>) -> Response<Body> {
        let (mut parts, body) = response.into_parts();
        parts
            .headers
            .insert(X_CACHE, HeaderValue::from_static("MISS"));

        let declared_len = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        let too_large = declared_len.map_or(false, |len| len > self.config.max_entry_bytes);
        if !parts.status.is_success() || too_large {
            return Response::from_parts(parts, body);
        }

        let fill = CacheFill {
            store: self.store.clone(),
            plan: plan.clone(),
            status: parts.status.as_u16(),
            content_type: parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            limit: self.config.max_entry_bytes,
            idle: self.fill_timeout,
        };
        let (sender, client_body) = Body::channel();
        tokio::spawn(fill.run(body, sender));
        Response::from_parts(parts, client_body)
    }

    /// Remove every entry whose key matches `pattern` (glob, e.g. `anon:GET:/api/documents*`).
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        match self.store.delete_matching(pattern).await {
            Ok(removed) => {
                tracing::info!(pattern, removed, "Invalidated cache entries");
                removed
            }
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Cache invalidation failed");
                0
            }
        }
    }

    /// Remove every per-user entry belonging to `user_id`.
    pub async fn invalidate_user(&self, user_id: &str) -> u64 {
        let pattern = format!("{}:*:{}", CacheNamespace::User.as_str(), user_id);
        self.invalidate(&pattern).await
    }
}

async fn put_entry(store: &SharedStore, plan: &CachePlan, entry: &CachedResponse) {
    let payload = match serde_json::to_vec(entry) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(key = %plan.key, error = %e, "Failed to serialize cache entry");
            return;
        }
    };
    if let Err(e) = store.set_ex(&plan.key, &payload, plan.ttl).await {
        counter!("gateway.cache.unavailable", 1);
        tracing::warn!(key = %plan.key, error = %e, "Failed to store cache entry");
    } else {
        tracing::debug!(key = %plan.key, ttl_secs = plan.ttl.as_secs(), "Cached response");
    }
}

/// Copies an upstream body to the client while collecting it for the cache.
struct CacheFill {
    store: SharedStore,
    plan: CachePlan,
    status: u16,
    content_type: Option<String>,
    limit: usize,
    idle: Duration,
}

impl CacheFill {
    async fn run(self, mut upstream: Body, mut client: Sender) {
        let mut kept = Some(Vec::new());
        loop {
            let chunk = match tokio::time::timeout(self.idle, upstream.data()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::warn!(key = %self.plan.key, error = %e, "Upstream body failed, not caching");
                    client.abort();
                    return;
                }
                Err(_) => {
                    tracing::warn!(
                        key = %self.plan.key,
                        idle_ms = self.idle.as_millis() as u64,
                        "Upstream body stalled, not caching"
                    );
                    client.abort();
                    return;
                }
            };

            if let Some(buf) = kept.as_mut() {
                if buf.len() + chunk.len() > self.limit {
                    tracing::debug!(key = %self.plan.key, limit = self.limit, "Response too large to cache");
                    kept = None;
                } else {
                    buf.extend_from_slice(&chunk);
                }
            }
            if client.send_data(chunk).await.is_err() {
                // client went away; partial bodies are never stored
                return;
            }
        }

        if let Some(Ok(body)) = kept.map(String::from_utf8) {
            let entry = CachedResponse {
                status: self.status,
                content_type: self.content_type,
                body,
            };
            put_entry(&self.store, &self.plan, &entry).await;
        }
    }
}
