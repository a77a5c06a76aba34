//! In-memory implementation of the KV port for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{KvError, KvStore};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// In-memory [`KvStore`] with real TTL semantics (driven by tokio time, so
/// tests can pause and advance the clock).
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    zsets: Mutex<HashMap<String, Vec<(f64, String)>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(Entry::live) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(entries.remove(key).is_some_and(|e| e.live()))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let entries = self.entries.lock().unwrap();
        let matches = |key: &str| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        };
        Ok(entries
            .iter()
            .filter(|(key, entry)| matches(key) && entry.live())
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut zsets = self.zsets.lock().unwrap();
        let set = zsets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.push((score, member.to_string()));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        if let Some(set) = self.zsets.lock().unwrap().get_mut(key) {
            set.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        Ok(self
            .zsets
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |set| set.len() as u64))
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let zsets = self.zsets.lock().unwrap();
        let Some(set) = zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut sorted = set.clone();
        if sorted.is_empty() {
            return Ok(Vec::new());
        }
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let len = sorted.len() as isize;
        let norm = |i: isize| -> usize {
            if i < 0 {
                (len + i).max(0) as usize
            } else {
                i.min(len) as usize
            }
        };
        let (start, stop) = (norm(start), norm(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(sorted[start..=stop.min(sorted.len().saturating_sub(1))]
            .iter()
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_get_del() {
        let kv = MemoryKvStore::new();
        kv.set_ex("a", "1", TTL).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(kv.del("a").await.unwrap());
        assert!(!kv.del("a").await.unwrap());
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let kv = MemoryKvStore::new();
        kv.set_ex("a", "1", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert!(kv.keys("a*").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_respects_incumbent_until_expiry() {
        let kv = MemoryKvStore::new();
        assert!(kv.set_nx_ex("lock", "w1", Duration::from_secs(30)).await.unwrap());
        assert!(!kv.set_nx_ex("lock", "w2", Duration::from_secs(30)).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("w1"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(kv.set_nx_ex("lock", "w2", Duration::from_secs(30)).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn keys_matches_prefix_glob() {
        let kv = MemoryKvStore::new();
        kv.set_ex("mempool:0x01", "a", TTL).await.unwrap();
        kv.set_ex("mempool:0x02", "b", TTL).await.unwrap();
        kv.set_ex("senderNonce:0xaa:0", "c", TTL).await.unwrap();

        let mut keys = kv.keys("mempool:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["mempool:0x01", "mempool:0x02"]);
    }

    #[tokio::test]
    async fn zset_orders_by_score() {
        let kv = MemoryKvStore::new();
        kv.zadd("idx", "late", 300.0).await.unwrap();
        kv.zadd("idx", "early", 100.0).await.unwrap();
        kv.zadd("idx", "mid", 200.0).await.unwrap();

        assert_eq!(kv.zcard("idx").await.unwrap(), 3);
        assert_eq!(
            kv.zrange("idx", 0, -1).await.unwrap(),
            vec!["early", "mid", "late"]
        );

        kv.zrem("idx", "mid").await.unwrap();
        assert_eq!(kv.zrange("idx", 0, -1).await.unwrap(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn zadd_updates_existing_member_score() {
        let kv = MemoryKvStore::new();
        kv.zadd("idx", "m", 100.0).await.unwrap();
        kv.zadd("idx", "m", 50.0).await.unwrap();
        assert_eq!(kv.zcard("idx").await.unwrap(), 1);
    }
}
