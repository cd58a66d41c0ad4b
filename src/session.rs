//! Session cache mapping opaque cookies to dataset permissions.
//!
//! A hit here skips the whole token/visa evaluation, so entries are bounded
//! by the configured session TTL and nothing else: there is no logout.

use moka::future::Cache;
use std::time::Duration;
use uuid::Uuid;

/// TTL-bounded map from session key to authorized dataset list.
#[derive(Clone)]
pub struct SessionCache {
    cache: Cache<String, Vec<String>>,
}

impl SessionCache {
    /// Create the cache. Capacity is sized for a million concurrent
    /// sessions; beyond that the least-recently-used entries are evicted.
    pub fn new(expiration: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_live(expiration)
            .max_capacity(1_000_000)
            .build();
        Self { cache }
    }

    /// Look up a session key.
    pub async fn get(&self, key: &str) -> Option<Vec<String>> {
        self.cache.get(key).await
    }

    /// Store a dataset list under a session key.
    pub async fn set(&self, key: &str, datasets: Vec<String>) {
        self.cache.insert(key.to_string(), datasets).await;
    }

    /// Generate a fresh random session key.
    ///
    /// Collisions are vanishingly unlikely, but the loop guarantees the key
    /// does not already name a live session.
    pub fn new_key(&self) -> String {
        loop {
            let key = Uuid::new_v4().to_string();
            if !self.cache.contains_key(&key) {
                return key;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get() {
        let sessions = SessionCache::new(Duration::from_secs(60));
        let key = sessions.new_key();
        sessions
            .set(&key, vec!["EGAD00000000001".to_string()])
            .await;
        assert_eq!(
            sessions.get(&key).await,
            Some(vec!["EGAD00000000001".to_string()])
        );
    }

    #[tokio::test]
    async fn test_missing_key() {
        let sessions = SessionCache::new(Duration::from_secs(60));
        assert_eq!(sessions.get("nope").await, None);
    }

    #[tokio::test]
    async fn test_keys_are_unique() {
        let sessions = SessionCache::new(Duration::from_secs(60));
        let a = sessions.new_key();
        let b = sessions.new_key();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_expiration() {
        let sessions = SessionCache::new(Duration::from_millis(20));
        let key = sessions.new_key();
        sessions.set(&key, vec!["EGAD1".to_string()]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.get(&key).await, None);
    }
}
