//! Fixed-window rate limiting against the shared store.
//!
//! Policies are checked in order and the first whose matcher accepts the
//! request applies; the list always ends in a catch-all, so every request is
//! counted by exactly one policy. Counters are keyed by `(policy, scope)` and
//! reset completely when the window expires.

use crate::auth::Identity;
use crate::config::PolicyConfig;
use crate::store::SharedStore;
use anyhow::{bail, Result};
use hyper::Method;
use metrics::counter;
use std::net::IpAddr;
use std::time::Duration;

/// Which requests a policy applies to. Empty lists accept anything.
#[derive(Debug, Clone, Default)]
pub struct PolicyMatcher {
    pub methods: Vec<Method>,
    pub path_prefixes: Vec<String>,
    pub exact_paths: Vec<String>,
}

impl PolicyMatcher {
    pub fn is_catch_all(&self) -> bool {
        self.methods.is_empty() && self.path_prefixes.is_empty() && self.exact_paths.is_empty()
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return false;
        }
        if self.path_prefixes.is_empty() && self.exact_paths.is_empty() {
            return true;
        }
        let trimmed = if path.len() > 1 { path.trim_end_matches('/') } else { path };
        self.exact_paths.iter().any(|p| p == trimmed)
            || self.path_prefixes.iter().any(|prefix| {
                path.strip_prefix(prefix.as_str())
                    .map(|rest| rest.is_empty() || rest.starts_with('/'))
                    .unwrap_or(false)
            })
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub name: String,
    pub window: Duration,
    pub max_requests: u64,
    pub matcher: PolicyMatcher,
    pub message: String,
}

impl RateLimitPolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let methods = config
            .methods
            .iter()
            .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            name: config.name.clone(),
            window: Duration::from_secs(config.window_secs),
            max_requests: config.max_requests,
            matcher: PolicyMatcher {
                methods,
                path_prefixes: config.path_prefixes.clone(),
                exact_paths: config.exact_paths.clone(),
            },
            message: config.message.clone().unwrap_or_else(|| {
                "Too many requests from this client, please try again later.".to_string()
            }),
        })
    }
}

/// Identity a counter is tracked against.
///
/// Authenticated requests are always scoped by user id, for every policy;
/// everything else by client address.
pub fn scope_key(identity: Option<&Identity>, remote: IpAddr) -> String {
    match identity {
        Some(identity) => format!("user:{}", identity.user_id),
        None => format!("ip:{}", remote),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        policy: String,
        limit: u64,
        remaining: u64,
    },
    Limited {
        policy: String,
        limit: u64,
        retry_after_secs: u64,
        message: String,
    },
    /// The store could not be reached; the request proceeds unlimited.
    Unenforced { policy: String },
}

pub struct RateLimiter {
    policies: Vec<RateLimitPolicy>,
    store: SharedStore,
}

impl RateLimiter {
    pub fn new(policies: Vec<RateLimitPolicy>, store: SharedStore) -> Result<Self> {
        if !policies.iter().any(|p| p.matcher.is_catch_all()) {
            bail!("Rate limit policies must include a catch-all policy");
        }
        Ok(Self { policies, store })
    }

    pub fn from_config(configs: &[PolicyConfig], store: SharedStore) -> Result<Self> {
        let policies = configs
            .iter()
            .map(RateLimitPolicy::from_config)
            .collect::<Result<Vec<_>>>()?;
        Self::new(policies, store)
    }

    pub fn policies(&self) -> &[RateLimitPolicy] {
        &self.policies
    }

    pub fn select(&self, method: &Method, path: &str) -> &RateLimitPolicy {
        self.policies
            .iter()
            .find(|p| p.matcher.matches(method, path))
            // `new` guarantees a catch-all exists
            .unwrap_or_else(|| &self.policies[self.policies.len() - 1])
    }

    pub async fn check(&self, method: &Method, path: &str, scope: &str) -> RateDecision {
        let policy = self.select(method, path);
        let key = format!("ratelimit:{}:{}", policy.name, scope);

        let window = match self.store.incr_window(&key, policy.window).await {
            Ok(window) => window,
            Err(e) => {
                counter!("gateway.rate_limit.unenforced", 1, "policy" => policy.name.clone());
                tracing::warn!(policy = %policy.name, error = %e, "Rate limit store unavailable, passing request through");
                return RateDecision::Unenforced {
                    policy: policy.name.clone(),
                };
            }
        };

        if window.count > policy.max_requests {
            counter!("gateway.rate_limit.rejected", 1, "policy" => policy.name.clone());
            tracing::info!(policy = %policy.name, scope, count = window.count, "Rate limit exceeded");
            let millis = window.ttl.as_millis() as u64;
            RateDecision::Limited {
                policy: policy.name.clone(),
                limit: policy.max_requests,
                retry_after_secs: ((millis + 999) / 1000).max(1),
                message: policy.message.clone(),
            }
        } else {
            RateDecision::Allowed {
                policy: policy.name.clone(),
                limit: policy.max_requests,
                remaining: policy.max_requests - window.count,
            }
        }
    }
}
