use std::{
  collections::HashMap,
  hash::Hash,
  time::{Duration, Instant},
};

use tokio::sync::RwLock;

struct TtlEntry<T> {
  value: T,
  created_at: Instant,
  expires_at: Instant,
}

/// TTL-keyed store of check results. Entries expire passively:
/// a `get` past the expiry behaves as a miss, and `cleanup`
/// drops everything expired.
pub struct TtlCache<K: Eq + Hash, T: Clone>(
  RwLock<HashMap<K, TtlEntry<T>>>,
);

impl<K: Eq + Hash, T: Clone> Default for TtlCache<K, T> {
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: Eq + Hash, T: Clone> TtlCache<K, T> {
  pub async fn get(&self, key: &K) -> Option<T> {
    let cache = self.0.read().await;
    let entry = cache.get(key)?;
    if entry.expires_at <= Instant::now() {
      return None;
    }
    Some(entry.value.clone())
  }

  pub async fn insert(&self, key: K, value: T, ttl: Duration) {
    let now = Instant::now();
    self.0.write().await.insert(
      key,
      TtlEntry {
        value,
        created_at: now,
        expires_at: now + ttl,
      },
    );
  }

  /// Remove all expired entries.
  pub async fn cleanup(&self) {
    let now = Instant::now();
    self
      .0
      .write()
      .await
      .retain(|_, entry| entry.expires_at > now);
  }

  /// Age of the oldest live entry, or None when empty.
  pub async fn oldest_entry_age(&self) -> Option<Duration> {
    let now = Instant::now();
    self
      .0
      .read()
      .await
      .values()
      .filter(|entry| entry.expires_at > now)
      .map(|entry| now.duration_since(entry.created_at))
      .max()
  }

  pub async fn clear(&self) {
    self.0.write().await.clear();
  }

  pub async fn len(&self) -> usize {
    self.0.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.0.read().await.is_empty()
  }
}

/// Share-by-clone concurrent map. Backs the per-stack lock
/// registry and other small maps where readers should never
/// hold the map lock across await points.
#[derive(Debug)]
pub struct CloneCache<K: Eq + Hash, T: Clone>(
  RwLock<HashMap<K, T>>,
);

impl<K: Eq + Hash, T: Clone> Default for CloneCache<K, T> {
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: Eq + Hash + Clone, T: Clone> CloneCache<K, T> {
  pub async fn get(&self, key: &K) -> Option<T> {
    self.0.read().await.get(key).cloned()
  }

  pub async fn insert(&self, key: K, value: T) -> Option<T> {
    self.0.write().await.insert(key, value)
  }

  pub async fn remove(&self, key: &K) -> Option<T> {
    self.0.write().await.remove(key)
  }

  pub async fn entries(&self) -> Vec<(K, T)> {
    let cache = self.0.read().await;
    cache
      .iter()
      .map(|(key, value)| (key.clone(), value.clone()))
      .collect()
  }
}

impl<K: Eq + Hash + Clone, T: Clone + Default> CloneCache<K, T> {
  pub async fn get_or_insert_default(&self, key: &K) -> T {
    let mut cache = self.0.write().await;
    match cache.get(key).cloned() {
      Some(item) => item,
      None => {
        let item: T = Default::default();
        cache.insert(key.clone(), item.clone());
        item
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn ttl_get_misses_after_expiry() {
    let cache = TtlCache::<String, u32>::default();
    cache
      .insert("a".to_string(), 1, Duration::from_millis(10))
      .await;
    assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.get(&"a".to_string()).await, None);
  }

  #[tokio::test]
  async fn cleanup_drops_expired_entries() {
    let cache = TtlCache::<String, u32>::default();
    cache
      .insert("old".to_string(), 1, Duration::from_millis(5))
      .await;
    cache
      .insert("live".to_string(), 2, Duration::from_secs(60))
      .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.cleanup().await;
    assert_eq!(cache.len().await, 1);
    assert_eq!(cache.get(&"live".to_string()).await, Some(2));
  }

  #[tokio::test]
  async fn oldest_entry_age_tracks_live_entries() {
    let cache = TtlCache::<String, u32>::default();
    assert_eq!(cache.oldest_entry_age().await, None);
    cache
      .insert("a".to_string(), 1, Duration::from_secs(60))
      .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let age = cache.oldest_entry_age().await.unwrap();
    assert!(age >= Duration::from_millis(10));
  }

  #[tokio::test]
  async fn clear_empties_the_cache() {
    let cache = TtlCache::<String, u32>::default();
    cache
      .insert("a".to_string(), 1, Duration::from_secs(60))
      .await;
    cache.clear().await;
    assert!(cache.is_empty().await);
  }
}
