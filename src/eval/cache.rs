//! Statement-scoped memoization
//!
//! - Cache is valid for exactly one statement and is dropped with it
//! - Keys are context function calls and uncorrelated subqueries, whose
//!   values cannot change within a statement
//! - Disabling the cache restores per-row evaluation without changing results

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::policy::expr::{ContextFn, Subquery};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Function(ContextFn),
    /// `in (select ...)` value list
    SubqueryValues(String),
    /// `exists (select ...)` result
    SubqueryExists(String),
}

impl CacheKey {
    pub fn subquery_values(subquery: &Subquery) -> Self {
        CacheKey::SubqueryValues(subquery.to_string())
    }

    pub fn subquery_exists(subquery: &Subquery) -> Self {
        CacheKey::SubqueryExists(subquery.to_string())
    }
}

/// Hit/miss counters; a miss is one underlying computation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone)]
pub struct SessionCache {
    entries: HashMap<CacheKey, Value>,
    stats: CacheStats,
    enabled: bool,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SessionCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: HashMap::new(),
            stats: CacheStats::default(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Return the cached value for `key`, computing it with `thunk` on a miss
    pub fn memoize<E>(
        &mut self,
        key: CacheKey,
        thunk: impl FnOnce() -> Result<Value, E>,
    ) -> Result<Value, E> {
        if let Some(value) = self.lookup(&key) {
            return Ok(value);
        }
        let value = thunk()?;
        self.store(key, value.clone());
        Ok(value)
    }

    /// Cached value, counting a hit when present
    pub fn lookup(&mut self, key: &CacheKey) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let value = self.entries.get(key).cloned();
        if value.is_some() {
            self.stats.hits += 1;
        }
        value
    }

    /// Record a freshly computed value, counting a miss
    pub fn store(&mut self, key: CacheKey, value: Value) {
        self.stats.misses += 1;
        if self.enabled {
            self.entries.insert(key, value);
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.stats = CacheStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memoize_computes_once() {
        let mut cache = SessionCache::default();
        let mut calls = 0;

        for _ in 0..5 {
            let value = cache
                .memoize(CacheKey::Function(ContextFn::Uid), || {
                    calls += 1;
                    Ok::<_, ()>(Value::String("u1".to_string()))
                })
                .unwrap();
            assert_eq!(value, "u1");
        }

        assert_eq!(calls, 1);
        assert_eq!(cache.stats(), CacheStats { hits: 4, misses: 1 });
    }

    #[test]
    fn test_errors_are_not_cached() {
        let mut cache = SessionCache::default();
        let key = CacheKey::Function(ContextFn::Jwt);

        let result = cache.memoize(key.clone(), || Err::<Value, _>("boom"));
        assert_eq!(result, Err("boom"));
        assert!(cache.is_empty());

        let value = cache.memoize(key, || Ok::<_, &str>(Value::Null)).unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disabled_cache_always_recomputes() {
        let mut cache = SessionCache::new(false);
        let mut calls = 0;
        for _ in 0..3 {
            cache
                .memoize(CacheKey::Function(ContextFn::Role), || {
                    calls += 1;
                    Ok::<_, ()>(Value::Null)
                })
                .unwrap();
        }
        assert_eq!(calls, 3);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_clear_resets_entries_and_stats() {
        let mut cache = SessionCache::default();
        cache.store(CacheKey::Function(ContextFn::Uid), Value::Null);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
