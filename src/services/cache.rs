use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::CacheStats;

struct CacheEntry<V> {
    value: V,
    tags: Vec<String>,
    stored_at: Instant,
}

/// Keyed store with a TTL and invalidation by tag.
///
/// Every invalidation bumps a generation counter. A reader that missed
/// captures the generation before querying and fills through
/// [`QueryCache::insert_if_current`], so a result computed before a write
/// is never stored after that write's invalidation.
pub struct QueryCache<V> {
    ttl: Duration,
    entries: HashMap<String, CacheEntry<V>>,
    generation: u64,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(ttl: Duration) -> Self {
        QueryCache {
            ttl,
            entries: HashMap::new(),
            generation: 0,
            hits: 0,
            misses: 0,
            invalidations: 0,
        }
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let fresh = match self.entries.get(key) {
            Some(entry) => entry.stored_at.elapsed() < self.ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };

        if !fresh {
            self.entries.remove(key);
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stores `value`, first sweeping every expired entry.
    pub fn insert(&mut self, key: String, value: V, tags: &[&str]) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                stored_at: Instant::now(),
            },
        );
    }

    /// Stores `value` only if no invalidation happened since `generation`
    /// was read; returns whether it was stored.
    pub fn insert_if_current(&mut self, key: String, value: V, tags: &[&str], generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.insert(key, value, tags);
        true
    }

    /// Drops every entry carrying `tag`; returns how many were removed.
    pub fn invalidate_tag(&mut self, tag: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
        let removed = before - self.entries.len();
        self.generation += 1;
        self.invalidations += 1;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            invalidations: self.invalidations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_insert_and_miss_after_tag_invalidation() {
        let mut cache = QueryCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1, &["prazos:u1"]);
        cache.insert("b".to_string(), 2, &["prazos:u2"]);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.invalidate_tag("prazos:u1"), 1);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn expired_entries_are_misses() {
        let mut cache = QueryCache::new(Duration::ZERO);
        cache.insert("a".to_string(), "value".to_string(), &[]);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn fill_computed_before_an_invalidation_is_dropped() {
        let mut cache = QueryCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("list"), None);
        let generation = cache.generation();

        // A write lands between the reader's miss and its fill.
        cache.invalidate_tag("prazos:u1");

        assert!(!cache.insert_if_current("list".to_string(), vec![0], &["prazos:u1"], generation));
        assert_eq!(cache.get("list"), None);

        let generation = cache.generation();
        assert!(cache.insert_if_current("list".to_string(), vec![1], &["prazos:u1"], generation));
        assert_eq!(cache.get("list"), Some(vec![1]));
    }

    #[test]
    fn insert_sweeps_expired_entries() {
        let mut cache = QueryCache::new(Duration::from_secs(60));
        cache.insert("2026-03-09".to_string(), 1, &[]);
        cache.insert("2026-03-10".to_string(), 2, &[]);
        assert_eq!(cache.stats().entries, 2);

        cache.set_ttl(Duration::ZERO);
        cache.insert("2026-03-11".to_string(), 3, &[]);
        assert_eq!(cache.stats().entries, 1);
    }
}
