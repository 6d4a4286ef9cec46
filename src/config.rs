// src/config.rs
use crate::routes::RouteTable;
use crate::server::LOCAL_PATHS;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub environment: Environment,
    /// Upper bound for a single forwarded request, connect included.
    pub request_timeout_ms: u64,
    /// How long the surviving side of a spliced upgrade may linger after the other closed.
    pub upgrade_close_grace_ms: u64,
    pub max_body_bytes: usize,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub services: Vec<ServiceConfig>,
    pub routes: Vec<RouteConfig>,
    pub rate_limits: Vec<PolicyConfig>,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(self) -> bool {
        self == Environment::Development
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://` address of the shared store. `None` keeps counters and cache in process.
    pub url: Option<String>,
    pub op_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub prefix: String,
    pub service: String,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    #[serde(default = "default_true")]
    pub requires_auth: bool,
    #[serde(default)]
    pub upgrade: bool,
    #[serde(default = "default_true")]
    pub validate_json: bool,
    #[serde(default)]
    pub cache: RouteCacheConfig,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewriteConfig {
    #[default]
    StripPrefix,
    Preserve,
    Replace { with: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RouteCacheConfig {
    pub mode: CacheMode,
    /// Overrides the namespace TTL for this route.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Disabled,
    Anonymous,
    PerUser,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PolicyConfig {
    pub name: String,
    pub window_secs: u64,
    pub max_requests: u64,
    /// Empty means every method.
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub path_prefixes: Vec<String>,
    #[serde(default)]
    pub exact_paths: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PolicyConfig {
    pub fn is_catch_all(&self) -> bool {
        self.methods.is_empty() && self.path_prefixes.is_empty() && self.exact_paths.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub anonymous_ttl_secs: u64,
    pub user_ttl_secs: u64,
    pub health_ttl_secs: u64,
    pub max_entry_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_timeout_ms: u64,
    pub cache_reports: bool,
    pub refresh_interval_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            op_timeout_ms: 250,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anonymous_ttl_secs: 300,
            user_ttl_secs: 600,
            health_ttl_secs: 60,
            max_entry_bytes: 1024 * 1024,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5000,
            cache_reports: true,
            refresh_interval_secs: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,api_gateway=debug".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let service = |name: &str, port: u16| ServiceConfig {
            name: name.to_string(),
            base_url: format!("http://localhost:{}", port),
            health_path: default_health_path(),
        };
        let api_route = |prefix: &str, service: &str, description: &str| RouteConfig {
            prefix: prefix.to_string(),
            service: service.to_string(),
            rewrite: RewriteConfig::StripPrefix,
            requires_auth: true,
            upgrade: false,
            validate_json: true,
            cache: RouteCacheConfig::default(),
            description: Some(description.to_string()),
        };

        let mut vectors = api_route("/api/vectors", "vector-db-service", "Embeddings and semantic search");
        vectors.cache = RouteCacheConfig {
            mode: CacheMode::PerUser,
            ttl_secs: Some(300),
        };
        let mut documents = api_route("/api/documents", "document-service", "Document upload and text extraction");
        documents.cache.mode = CacheMode::PerUser;
        let mut files = api_route("/api/files", "file-storage-service", "File storage");
        files.validate_json = false;

        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            environment: Environment::Development,
            request_timeout_ms: 30_000,
            upgrade_close_grace_ms: 5_000,
            max_body_bytes: 10 * 1024 * 1024,
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            services: vec![
                service("document-service", 3001),
                service("chat-service", 3002),
                service("file-storage-service", 3003),
                service("ai-service", 3004),
                service("vector-db-service", 3005),
            ],
            routes: vec![
                documents,
                api_route("/api/chat", "chat-service", "Chat sessions and messages"),
                RouteConfig {
                    prefix: "/ws/chat".to_string(),
                    service: "chat-service".to_string(),
                    rewrite: RewriteConfig::Preserve,
                    requires_auth: true,
                    upgrade: true,
                    validate_json: false,
                    cache: RouteCacheConfig::default(),
                    description: Some("Realtime chat stream (protocol upgrade)".to_string()),
                },
                files,
                api_route("/api/ai", "ai-service", "AI completions, summaries and analysis"),
                vectors,
            ],
            rate_limits: vec![
                PolicyConfig {
                    name: "chat-creation".to_string(),
                    window_secs: 60 * 60,
                    max_requests: 10,
                    methods: vec!["POST".to_string()],
                    path_prefixes: Vec::new(),
                    exact_paths: vec!["/api/chat".to_string(), "/api/chat/sessions".to_string()],
                    message: Some("Too many chat sessions created, please try again later.".to_string()),
                },
                PolicyConfig {
                    name: "auth".to_string(),
                    window_secs: 15 * 60,
                    max_requests: 5,
                    methods: Vec::new(),
                    path_prefixes: vec!["/api/auth".to_string(), "/auth".to_string()],
                    exact_paths: Vec::new(),
                    message: Some("Too many authentication attempts, please try again later.".to_string()),
                },
                PolicyConfig {
                    name: "general".to_string(),
                    window_secs: 15 * 60,
                    max_requests: 1000,
                    methods: Vec::new(),
                    path_prefixes: Vec::new(),
                    exact_paths: Vec::new(),
                    message: None,
                },
            ],
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from a YAML file, then apply environment overrides and validate.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_config(path)?,
            None => GatewayConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply simple key/value overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            let host = self
                .listen_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.listen_addr = format!("{}:{}", host, port.trim());
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.store.url = Some(url);
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(env) = lookup("GATEWAY_ENV").or_else(|| lookup("NODE_ENV")) {
            match Environment::parse(&env) {
                Some(parsed) => self.environment = parsed,
                None => tracing::warn!(value = %env, "Ignoring unknown environment name"),
            }
        }
        for service in &mut self.services {
            if let Some(url) = lookup(&service_env_key(&service.name)) {
                service.base_url = url;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!("Invalid listen_addr: {}", self.listen_addr);
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                bail!("Service name cannot be empty");
            }
            if !names.insert(service.name.as_str()) {
                bail!("Duplicate service name: {}", service.name);
            }
            let uri: hyper::Uri = service
                .base_url
                .parse()
                .with_context(|| format!("Invalid base_url for service '{}'", service.name))?;
            if uri.scheme().is_none() || uri.authority().is_none() {
                bail!(
                    "base_url for service '{}' must be absolute: {}",
                    service.name,
                    service.base_url
                );
            }
        }

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                bail!("Route prefix must start with '/': {}", route.prefix);
            }
            if !names.contains(route.service.as_str()) {
                bail!(
                    "Route '{}' targets unknown service '{}'",
                    route.prefix,
                    route.service
                );
            }
        }

        let mut policy_names = HashSet::new();
        for policy in &self.rate_limits {
            if !policy_names.insert(policy.name.as_str()) {
                bail!("Duplicate rate limit policy: {}", policy.name);
            }
            if policy.window_secs == 0 || policy.max_requests == 0 {
                bail!("Rate limit policy '{}' needs a window and a limit", policy.name);
            }
        }
        if !self.rate_limits.iter().any(PolicyConfig::is_catch_all) {
            bail!("Rate limit policies must end with a catch-all policy");
        }

        if self.environment == Environment::Production && self.auth.jwt_secret.is_none() {
            bail!("JWT_SECRET must be set in production");
        }

        let table = RouteTable::from_config(self)?;
        for local in LOCAL_PATHS {
            if let Some(route) = table.resolve(local) {
                bail!("Route prefix {} shadows the gateway endpoint {}", route.prefix, local);
            }
        }

        Ok(())
    }
}

/// `document-service` -> `DOCUMENT_SERVICE_URL`
pub fn service_env_key(name: &str) -> String {
    let mut key: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    key.push_str("_URL");
    key
}

pub fn load_config(path: &str) -> Result<GatewayConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
    let config: GatewayConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
