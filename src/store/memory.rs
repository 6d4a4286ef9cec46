// src/store/memory.rs
use super::{glob_match, KvStore, StoreResult, WindowCount};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Slot {
    Counter(u64),
    Value(Bytes),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

/// In-process store with the same atomicity as the redis store.
///
/// Uses tokio's clock so tests can drive expiry with a paused runtime.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Reads already ignore them; this only bounds memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let live = entry.expires_at > now;
            purged += !live as usize;
            live
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn incr_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Counter(0),
            expires_at: now + window,
        });

        if entry.expires_at <= now {
            *entry = Entry {
                slot: Slot::Counter(0),
                expires_at: now + window,
            };
        }

        let previous = match &entry.slot {
            Slot::Counter(n) => Some(*n),
            Slot::Value(_) => None,
        };
        let count = match previous {
            Some(n) => n + 1,
            // redis would refuse INCR on a non-integer; restart the window instead
            None => {
                entry.expires_at = now + window;
                1
            }
        };
        entry.slot = Slot::Counter(count);

        Ok(WindowCount {
            count,
            ttl: entry.expires_at.saturating_duration_since(now),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => match &entry.slot {
                Slot::Value(bytes) => Some(bytes.to_vec()),
                Slot::Counter(n) => Some(n.to_string().into_bytes()),
            },
            _ => None,
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(Bytes::copy_from_slice(value)),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        Ok(self.entries.remove(key).map(|_| 1).unwrap_or(0))
    }

    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let matched = glob_match(pattern, key);
            removed += matched as u64;
            !matched
        });
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn sweep(&self) -> usize {
        self.purge_expired()
    }
}
