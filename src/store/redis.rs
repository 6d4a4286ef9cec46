// src/store/redis.rs
use super::{KvStore, StoreError, StoreResult, WindowCount};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// After a failed connect, skip reconnect attempts for this long and fail fast.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// INCR, then set the expiry only when the key has none (first hit in a window).
/// Returns `{count, pttl}` in a single round trip.
const INCR_WINDOW_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

#[derive(Default)]
struct ConnState {
    conn: Option<ConnectionManager>,
    failed_at: Option<Instant>,
}

/// Redis-backed store shared by every gateway instance.
pub struct RedisStore {
    client: redis::Client,
    state: Mutex<ConnState>,
    incr_script: redis::Script,
    op_timeout: Duration,
}

impl RedisStore {
    /// Parse the address and build the client. No connection is made here.
    pub fn open(url: &str, op_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            state: Mutex::new(ConnState::default()),
            incr_script: redis::Script::new(INCR_WINDOW_SCRIPT),
            op_timeout,
        })
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let mut state = self.state.lock().await;
        if let Some(conn) = &state.conn {
            return Ok(conn.clone());
        }
        if let Some(failed_at) = state.failed_at {
            if failed_at.elapsed() < RECONNECT_BACKOFF {
                return Err(StoreError::Unavailable("reconnect backoff".to_string()));
            }
        }

        let connect_timeout = self.op_timeout.max(Duration::from_secs(1));
        match timeout(connect_timeout, ConnectionManager::new(self.client.clone())).await {
            Ok(Ok(conn)) => {
                tracing::info!("Connected to redis");
                state.conn = Some(conn.clone());
                state.failed_at = None;
                Ok(conn)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to connect to redis");
                state.failed_at = Some(Instant::now());
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!("Timed out connecting to redis");
                state.failed_at = Some(Instant::now());
                Err(StoreError::Timeout)
            }
        }
    }

    async fn bounded<T, F>(&self, budget: Duration, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(budget, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let mut conn = self.connection().await?;
        let window_ms = window.as_millis().max(1) as u64;
        let (count, ttl_ms): (u64, i64) = self
            .bounded(
                self.op_timeout,
                self.incr_script.key(key).arg(window_ms).invoke_async(&mut conn),
            )
            .await?;

        Ok(WindowCount {
            count,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        self.bounded(self.op_timeout, conn.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let millis = ttl.as_millis().max(1) as u64;
        self.bounded(self.op_timeout, conn.pset_ex(key, value, millis))
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        self.bounded(self.op_timeout, conn.del(key)).await
    }

    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut deleted = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    self.op_timeout,
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(500)
                        .query_async(&mut conn),
                )
                .await?;
            if !keys.is_empty() {
                let removed: u64 = self.bounded(self.op_timeout, conn.del(&keys)).await?;
                deleted += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        tracing::debug!(pattern, deleted, "Deleted keys by pattern");
        Ok(deleted)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let reply: String = self
            .bounded(self.op_timeout, redis::cmd("PING").query_async(&mut conn))
            .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(reply))
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_url() {
        assert!(RedisStore::open("not a url", Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn unreachable_store_fails_fast() {
        // nothing listens on port 1
        let store = RedisStore::open("redis://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        assert!(store.incr_window("k", Duration::from_secs(1)).await.is_err());

        let started = Instant::now();
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    // Needs a local redis: cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn increments_atomically() {
        let store = RedisStore::open("redis://127.0.0.1:6379", Duration::from_secs(1)).unwrap();
        let key = format!("test:window:{}", uuid::Uuid::new_v4());
        let first = store.incr_window(&key, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.count, 1);
        let second = store.incr_window(&key, Duration::from_secs(30)).await.unwrap();
        assert_eq!(second.count, 2);
        assert!(second.ttl <= Duration::from_secs(30));
        store.delete(&key).await.unwrap();
    }
}
