//! Generic TTL map (spec §4.10), used for short-lived agent auth challenges
//! and WS request-correlation timeouts.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct ExpiryMap<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> ExpiryMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: Mutex::new(HashMap::new()) })
    }

    pub async fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.lock().await.insert(key, Entry { value, expires_at });
    }

    /// Lazy eviction on access, per spec §4.10.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.entries.lock().await;
        match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().await.remove(key).map(|e| e.value)
    }

    pub async fn get_by_value(&self, value: &V) -> Option<K>
    where
        V: PartialEq,
    {
        let guard = self.entries.lock().await;
        let now = Instant::now();
        guard
            .iter()
            .find(|(_, e)| e.expires_at > now && &e.value == value)
            .map(|(k, _)| k.clone())
    }

    pub async fn remove_by_value(&self, value: &V) -> Option<K>
    where
        V: PartialEq,
    {
        let key = self.get_by_value(value).await?;
        self.remove(&key).await;
        Some(key)
    }

    async fn sweep(&self) {
        let now = Instant::now();
        self.entries.lock().await.retain(|_, e| e.expires_at > now);
    }

    /// Spawn a background sweeper; cancel the returned token to stop it.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> CancellationToken
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let map = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => map.sweep().await,
                }
            }
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire_lazily() {
        let map: Arc<ExpiryMap<&'static str, u32>> = ExpiryMap::new();
        map.set("a", 1, Duration::from_millis(10)).await;
        assert_eq!(map.get(&"a").await, Some(1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(map.get(&"a").await, None);
    }

    #[tokio::test]
    async fn get_and_remove_by_value() {
        let map: Arc<ExpiryMap<u32, &'static str>> = ExpiryMap::new();
        map.set(1, "x", Duration::from_secs(5)).await;
        map.set(2, "y", Duration::from_secs(5)).await;
        assert_eq!(map.get_by_value(&"y").await, Some(2));
        assert_eq!(map.remove_by_value(&"y").await, Some(2));
        assert_eq!(map.get(&2).await, None);
    }

    #[tokio::test]
    async fn sweeper_drops_expired_entries() {
        let map: Arc<ExpiryMap<&'static str, u32>> = ExpiryMap::new();
        map.set("a", 1, Duration::from_millis(10)).await;
        let token = map.spawn_sweeper(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(map.entries.lock().await.len(), 0);
        token.cancel();
    }
}
