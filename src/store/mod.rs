//! Shared key-value store used for rate-limit counters and cached responses.
//!
//! Every mutation is a single atomic store operation (increment-with-expiry,
//! set-with-expiry); callers never read-modify-write. Callers treat any
//! [`StoreError`] as "store unavailable" and fall back to pass-through.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::config::StoreConfig;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out")]
    Timeout,

    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of an atomic window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count after this increment.
    pub count: u64,
    /// Time until the window resets.
    pub ttl: Duration,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Increment `key`, creating it with `window` as its expiry when absent.
    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<u64>;

    /// Delete every key matching a glob pattern (`*` and `?`).
    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;

    fn backend(&self) -> &'static str;

    /// Drop expired entries the backend does not expire itself.
    fn sweep(&self) -> usize {
        0
    }
}

pub type SharedStore = Arc<dyn KvStore>;

/// Build the store once at startup. Connection to redis is established lazily,
/// so an unreachable store never prevents the gateway from starting.
pub fn from_config(config: &StoreConfig) -> anyhow::Result<SharedStore> {
    match &config.url {
        Some(url) => {
            let store = RedisStore::open(url, Duration::from_millis(config.op_timeout_ms))?;
            tracing::info!(url = %redact(url), "Using redis for rate limits and cache");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No store configured; rate limits and cache are local to this instance");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Glob match with `*` (any run) and `?` (any single char), as redis `MATCH` does.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_k = 0;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_k = ki;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_k += 1;
            ki = star_k;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
