//! Static route table: path prefix to backend service.
//!
//! Prefixes match on segment boundaries (`/api/chat` matches `/api/chat` and
//! `/api/chat/42`, never `/api/chatter`). Prefixes are unique and may not nest,
//! so at most one entry can match any path.

use crate::config::{CacheMode, GatewayConfig, RewriteConfig, RouteCacheConfig};
use anyhow::{bail, Context, Result};
use hyper::Uri;
use std::collections::HashMap;
use std::sync::Arc;

/// A backend service reachable through one or more routes.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub name: String,
    pub base_url: Uri,
    pub health_path: String,
}

impl ServiceTarget {
    /// Absolute URL of the service health endpoint.
    pub fn health_url(&self) -> String {
        join_url(&self.base_url, &self.health_path, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRewrite {
    StripPrefix,
    Preserve,
    Replace(String),
}

impl PathRewrite {
    pub fn apply(&self, prefix: &str, path: &str) -> String {
        let rest = path.strip_prefix(prefix).unwrap_or(path);
        let rewritten = match self {
            PathRewrite::Preserve => return path.to_string(),
            PathRewrite::StripPrefix => rest.to_string(),
            PathRewrite::Replace(with) => format!("{}{}", with.trim_end_matches('/'), rest),
        };
        if rewritten.is_empty() {
            "/".to_string()
        } else if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{}", rewritten)
        }
    }
}

impl From<&RewriteConfig> for PathRewrite {
    fn from(config: &RewriteConfig) -> Self {
        match config {
            RewriteConfig::StripPrefix => PathRewrite::StripPrefix,
            RewriteConfig::Preserve => PathRewrite::Preserve,
            RewriteConfig::Replace { with } => PathRewrite::Replace(with.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub prefix: String,
    pub service: Arc<ServiceTarget>,
    pub rewrite: PathRewrite,
    pub requires_auth: bool,
    pub upgrade: bool,
    pub validate_json: bool,
    pub cache: RouteCacheConfig,
    pub description: Option<String>,
}

impl RouteEntry {
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/'),
            None => false,
        }
    }

    /// Upstream URI for an inbound path and query.
    pub fn upstream_uri(&self, path: &str, query: Option<&str>) -> Result<Uri> {
        let rewritten = self.rewrite.apply(&self.prefix, path);
        join_url(&self.service.base_url, &rewritten, query)
            .parse()
            .with_context(|| format!("Invalid upstream URI for {}", self.service.name))
    }

    pub fn caches_per_user(&self) -> bool {
        self.cache.mode == CacheMode::PerUser
    }
}

fn join_url(base: &Uri, path: &str, query: Option<&str>) -> String {
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().map(|a| a.as_str()).unwrap_or_default();
    let base_path = base.path().trim_end_matches('/');
    let mut url = format!("{}://{}{}{}", scheme, authority, base_path, path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Arc<RouteEntry>>,
    services: Vec<Arc<ServiceTarget>>,
}

impl RouteTable {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut services = Vec::with_capacity(config.services.len());
        let mut by_name = HashMap::new();
        for service in &config.services {
            let target = Arc::new(ServiceTarget {
                name: service.name.clone(),
                base_url: service
                    .base_url
                    .parse()
                    .with_context(|| format!("Invalid base_url for {}", service.name))?,
                health_path: service.health_path.clone(),
            });
            by_name.insert(service.name.clone(), target.clone());
            services.push(target);
        }

        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            let service = by_name
                .get(&route.service)
                .cloned()
                .with_context(|| format!("Route {} targets unknown service {}", route.prefix, route.service))?;
            routes.push(RouteEntry {
                prefix: route.prefix.clone(),
                service,
                rewrite: PathRewrite::from(&route.rewrite),
                requires_auth: route.requires_auth,
                upgrade: route.upgrade,
                validate_json: route.validate_json,
                cache: route.cache.clone(),
                description: route.description.clone(),
            });
        }

        Self::new(routes, services)
    }

    pub fn new(routes: Vec<RouteEntry>, services: Vec<Arc<ServiceTarget>>) -> Result<Self> {
        for (i, a) in routes.iter().enumerate() {
            for b in routes.iter().skip(i + 1) {
                if a.prefix == b.prefix {
                    bail!("Duplicate route prefix: {}", a.prefix);
                }
                if a.matches(&b.prefix) || b.matches(&a.prefix) {
                    bail!("Overlapping route prefixes: {} and {}", a.prefix, b.prefix);
                }
            }
        }

        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
            services,
        })
    }

    /// Longest matching prefix, case-sensitive.
    pub fn resolve(&self, path: &str) -> Option<Arc<RouteEntry>> {
        self.routes
            .iter()
            .filter(|route| route.matches(path))
            .max_by_key(|route| route.prefix.len())
            .cloned()
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.prefix.clone()).collect()
    }

    pub fn routes(&self) -> &[Arc<RouteEntry>] {
        &self.routes
    }

    /// Distinct backend services, in configuration order.
    pub fn services(&self) -> &[Arc<ServiceTarget>] {
        &self.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::from_config(&GatewayConfig::default()).unwrap()
    }

    #[test]
    fn resolves_on_segment_boundaries() {
        let table = table();
        assert_eq!(table.resolve("/api/chat").unwrap().prefix, "/api/chat");
        assert_eq!(table.resolve("/api/chat/123/messages").unwrap().prefix, "/api/chat");
        assert!(table.resolve("/api/chatter").is_none());
        assert!(table.resolve("/API/chat").is_none());
        assert!(table.resolve("/api/docs").is_none());
        assert_eq!(table.resolve("/ws/chat").unwrap().service.name, "chat-service");
    }

    #[test]
    fn rewrites_paths() {
        let table = table();
        let vectors = table.resolve("/api/vectors/search").unwrap();
        let uri = vectors.upstream_uri("/api/vectors/search", Some("q=1")).unwrap();
        assert_eq!(uri.to_string(), "http://localhost:3005/search?q=1");

        let root = vectors.upstream_uri("/api/vectors", None).unwrap();
        assert_eq!(root.path(), "/");

        let ws = table.resolve("/ws/chat").unwrap();
        assert_eq!(ws.upstream_uri("/ws/chat", None).unwrap().path(), "/ws/chat");

        assert_eq!(
            PathRewrite::Replace("/v2/".to_string()).apply("/api/ai", "/api/ai/chat"),
            "/v2/chat"
        );
    }

    #[test]
    fn rejects_duplicate_and_nested_prefixes() {
        let mut config = GatewayConfig::default();
        let mut nested = config.routes[0].clone();
        nested.prefix = format!("{}/archive", nested.prefix);
        config.routes.push(nested);
        assert!(RouteTable::from_config(&config).is_err());

        let mut config = GatewayConfig::default();
        config.routes.push(config.routes[1].clone());
        assert!(RouteTable::from_config(&config).is_err());
    }

    #[test]
    fn lists_services_once() {
        let table = table();
        assert_eq!(table.services().len(), 5);
        assert_eq!(
            table.services()[0].health_url(),
            "http://localhost:3001/health"
        );
    }
}
