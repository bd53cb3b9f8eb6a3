//! Query plan caching for federated operations
//!
//! This module provides an LRU cache from query fingerprint to compiled query
//! plan with support for:
//! - TTL-based expiration (checked lazily on read)
//! - Least-recently-used eviction at capacity
//! - Prefix and glob invalidation
//!
//! ## How It Works
//!
//! 1. **Fingerprint**: SHA-256 of the whitespace-normalized query + operation name
//! 2. **Cache Hit**: Return the cached plan, skipping planning
//! 3. **Cache Miss**: Plan the operation, cache the plan, return it
//! 4. **Capacity**: Inserting a new fingerprint into a full cache evicts the
//!    least recently accessed entry first
//!
//! ## Example
//!
//! ```rust
//! use federation_resilience::{QueryPlanCache, QueryPlanCacheConfig};
//! use std::time::Duration;
//!
//! let cache: QueryPlanCache<String> = QueryPlanCache::new(QueryPlanCacheConfig {
//!     max_size: 1_000,
//!     ttl: Some(Duration::from_secs(300)),
//! });
//!
//! let fingerprint = QueryPlanCache::<String>::fingerprint("{ me { id } }", None);
//! cache.set(fingerprint.clone(), "plan".to_string());
//! assert!(cache.get(&fingerprint).is_some());
//! ```

use crate::metrics::{CacheOperation, MetricsCollector};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wildmatch::WildMatchPattern;

/// Configuration for the query plan cache
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryPlanCacheConfig {
    /// Maximum number of cached plans
    pub max_size: usize,
    /// Plans older than this are treated as missing; `None` never expires
    pub ttl: Option<Duration>,
}

impl Default for QueryPlanCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

impl QueryPlanCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Validation(
                "query plan cache max_size must be greater than 0".to_string(),
            ));
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(Error::Validation(
                "query plan cache ttl must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A cached plan as returned by [`QueryPlanCache::get`]
#[derive(Debug)]
pub struct CachedQueryPlan<P> {
    pub plan: Arc<P>,
    pub created_at: Instant,
    pub access_count: u64,
    pub last_accessed: Instant,
}

impl<P> Clone for CachedQueryPlan<P> {
    fn clone(&self) -> Self {
        Self {
            plan: self.plan.clone(),
            created_at: self.created_at,
            access_count: self.access_count,
            last_accessed: self.last_accessed,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
}

struct Entry<P> {
    plan: Arc<P>,
    created_at: Instant,
    access_count: u64,
    last_accessed: Instant,
    /// Position in the LRU index
    tick: u64,
}

impl<P> Entry<P> {
    fn snapshot(&self) -> CachedQueryPlan<P> {
        CachedQueryPlan {
            plan: self.plan.clone(),
            created_at: self.created_at,
            access_count: self.access_count,
            last_accessed: self.last_accessed,
        }
    }
}

struct CacheInner<P> {
    entries: HashMap<String, Entry<P>>,
    /// Access tick -> fingerprint; the first entry is the least recently used
    lru: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<P> CacheInner<P> {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, fingerprint: &str) -> bool {
        match self.entries.remove(fingerprint) {
            Some(entry) => {
                self.lru.remove(&entry.tick);
                true
            }
            None => false,
        }
    }
}

/// LRU + TTL cache from query fingerprint to plan
pub struct QueryPlanCache<P> {
    config: QueryPlanCacheConfig,
    inner: Mutex<CacheInner<P>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<P> QueryPlanCache<P> {
    pub fn new(config: QueryPlanCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                lru: BTreeMap::new(),
                next_tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            metrics: None,
        }
    }

    /// Report cache operations to a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fingerprint an operation
    ///
    /// Runs of whitespace are collapsed, so formatting differences map to the
    /// same plan.
    pub fn fingerprint(query: &str, operation_name: Option<&str>) -> String {
        let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"\n");
        if let Some(name) = operation_name {
            hasher.update(name.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Look up a plan
    ///
    /// An entry older than the TTL is removed and reported as a miss.
    pub fn get(&self, fingerprint: &str) -> Option<CachedQueryPlan<P>> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = inner.entries.get(fingerprint).map(|entry| {
            self.config
                .ttl
                .map_or(false, |ttl| now.saturating_duration_since(entry.created_at) > ttl)
        });

        let Some(expired) = expired else {
            inner.misses += 1;
            drop(guard);
            tracing::debug!(fingerprint = %fingerprint, "Query plan cache miss");
            self.report(&[CacheOperation::Miss]);
            return None;
        };

        if expired {
            inner.remove(fingerprint);
            inner.evictions += 1;
            inner.misses += 1;
            drop(guard);
            tracing::debug!(fingerprint = %fingerprint, "Query plan expired");
            self.report(&[CacheOperation::Eviction, CacheOperation::Miss]);
            return None;
        }

        let tick = inner.tick();
        let snapshot = match inner.entries.get_mut(fingerprint) {
            Some(entry) => {
                inner.lru.remove(&entry.tick);
                entry.tick = tick;
                entry.access_count += 1;
                entry.last_accessed = now;
                entry.snapshot()
            }
            None => return None,
        };
        inner.lru.insert(tick, fingerprint.to_string());
        inner.hits += 1;
        drop(guard);

        tracing::debug!(fingerprint = %fingerprint, "Query plan cache hit");
        self.report(&[CacheOperation::Hit]);
        Some(snapshot)
    }

    /// Insert or overwrite a plan
    pub fn set(&self, fingerprint: impl Into<String>, plan: impl Into<Arc<P>>) {
        let fingerprint = fingerprint.into();
        let plan = plan.into();
        let now = Instant::now();
        let mut evicted = 0;

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let tick = inner.tick();

            if let Some(entry) = inner.entries.get_mut(&fingerprint) {
                inner.lru.remove(&entry.tick);
                *entry = Entry {
                    plan,
                    created_at: now,
                    access_count: 0,
                    last_accessed: now,
                    tick,
                };
            } else {
                while inner.entries.len() >= self.config.max_size {
                    let Some((_, oldest)) = inner.lru.pop_first() else {
                        break;
                    };
                    inner.entries.remove(&oldest);
                    inner.evictions += 1;
                    evicted += 1;
                    tracing::debug!(fingerprint = %oldest, "Evicted least recently used query plan");
                }
                inner.entries.insert(
                    fingerprint.clone(),
                    Entry {
                        plan,
                        created_at: now,
                        access_count: 0,
                        last_accessed: now,
                        tick,
                    },
                );
            }
            inner.lru.insert(tick, fingerprint);
        }

        for _ in 0..evicted {
            self.report(&[CacheOperation::Eviction]);
        }
        self.report(&[CacheOperation::Set]);
    }

    /// Return the cached plan or plan the operation and cache the result
    pub async fn get_or_plan<F, Fut, E>(&self, fingerprint: &str, planner: F) -> std::result::Result<Arc<P>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<P, E>>,
    {
        if let Some(cached) = self.get(fingerprint) {
            return Ok(cached.plan);
        }
        let plan = Arc::new(planner().await?);
        self.set(fingerprint, plan.clone());
        Ok(plan)
    }

    /// Remove cached plans
    ///
    /// With no pattern everything is removed. A pattern containing `*` or `?`
    /// is matched as a glob against the whole fingerprint, any other pattern
    /// as a prefix. Returns the number of removed plans.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let removed = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match pattern {
                None => {
                    let count = inner.entries.len();
                    inner.entries.clear();
                    inner.lru.clear();
                    count
                }
                Some(pattern) => {
                    let selector = Selector::new(pattern);
                    let matching: Vec<String> = inner
                        .entries
                        .keys()
                        .filter(|fingerprint| selector.matches(fingerprint))
                        .cloned()
                        .collect();
                    for fingerprint in &matching {
                        inner.remove(fingerprint);
                    }
                    matching.len()
                }
            }
        };

        tracing::debug!(pattern = ?pattern, removed, "Invalidated query plans");
        self.report(&[CacheOperation::Invalidation]);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.entries.len(),
            max_size: self.config.max_size,
            hit_rate: if lookups > 0 {
                inner.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Zero the hit, miss and eviction counters
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &QueryPlanCacheConfig {
        &self.config
    }

    /// Sizes of the entry map and of the LRU index
    #[cfg(test)]
    fn index_sizes(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.entries.len(), inner.lru.len())
    }

    fn report(&self, operations: &[CacheOperation]) {
        if let Some(metrics) = &self.metrics {
            for operation in operations {
                metrics.record_cache_operation(*operation);
            }
        }
    }
}

impl<P> std::fmt::Debug for QueryPlanCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPlanCache")
            .field("config", &self.config)
            .field("size", &self.len())
            .finish()
    }
}

/// Fingerprint selector of [`QueryPlanCache::invalidate`]
enum Selector<'a> {
    Prefix(&'a str),
    Glob(WildMatchPattern<'*', '?'>),
}

impl<'a> Selector<'a> {
    fn new(pattern: &'a str) -> Self {
        if pattern.contains(['*', '?']) {
            Selector::Glob(WildMatchPattern::new(pattern))
        } else {
            Selector::Prefix(pattern)
        }
    }

    fn matches(&self, fingerprint: &str) -> bool {
        match self {
            Selector::Prefix(prefix) => fingerprint.starts_with(prefix),
            Selector::Glob(glob) => glob.matches(fingerprint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize, ttl_ms: Option<u64>) -> QueryPlanCache<String> {
        QueryPlanCache::new(QueryPlanCacheConfig {
            max_size,
            ttl: ttl_ms.map(Duration::from_millis),
        })
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace() {
        let a = QueryPlanCache::<String>::fingerprint("{ user { id } }", None);
        let b = QueryPlanCache::<String>::fingerprint("{\n  user {\n    id\n  }\n}", None);
        let c = QueryPlanCache::<String>::fingerprint("{ user { id } }", Some("GetUser"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_round_trip() {
        let cache = cache(10, None);
        cache.set("q1", "plan-1".to_string());

        let cached = cache.get("q1").unwrap();
        assert_eq!(*cached.plan, "plan-1");
        assert_eq!(cached.access_count, 1);

        let cached = cache.get("q1").unwrap();
        assert_eq!(cached.access_count, 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_miss_is_counted() {
        let cache = cache(10, None);
        assert!(cache.get("unknown").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(2, None);
        cache.set("a", "plan-a".to_string());
        cache.set("b", "plan-b".to_string());
        assert!(cache.get("a").is_some());

        cache.set("c", "plan-c".to_string());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let cache = cache(2, None);
        cache.set("a", "old".to_string());
        cache.set("b", "plan-b".to_string());
        cache.set("a", "new".to_string());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(*cache.get("a").unwrap().plan, "new");

        // "b" is now the least recently used
        cache.set("c", "plan-c".to_string());
        assert!(cache.get("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = cache(10, Some(1_000));
        cache.set("q1", "plan".to_string());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cache.get("q1").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("q1").is_none());

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_invalidate_all() {
        let cache = cache(10, None);
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());

        assert_eq!(cache.invalidate(None), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_by_prefix_and_glob() {
        let cache = cache(10, None);
        cache.set("users:1", "1".to_string());
        cache.set("users:2", "2".to_string());
        cache.set("products:1", "3".to_string());
        cache.set("products:22", "4".to_string());

        assert_eq!(cache.invalidate(Some("users:")), 2);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.invalidate(Some("products:?")), 1);
        assert!(cache.get("products:22").is_some());

        assert_eq!(cache.invalidate(Some("*:2*")), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_glob_matching() {
        assert!(Selector::new("*").matches(""));
        assert!(Selector::new("a*c").matches("abbbc"));
        assert!(Selector::new("a?c").matches("abc"));
        assert!(!Selector::new("a?c").matches("abbc"));
        assert!(Selector::new("*b*").matches("aaabaaa"));
        assert!(!Selector::new("a*c").matches("abcd"));
        assert!(Selector::new("abc").matches("abcd"));
        assert!(!Selector::new("bcd").matches("abcd"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sets_keep_lru_index_consistent() {
        let cache = Arc::new(cache(8, None));
        let mut handles = Vec::new();
        for worker in 0..8u32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..500u32 {
                    cache.set(format!("fp:{}", (i + worker) % 12), format!("plan-{worker}-{i}"));
                    cache.set("shared", format!("shared-{worker}"));
                    cache.get(&format!("fp:{}", i % 12));
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let (entries, lru) = cache.index_sizes();
        assert_eq!(entries, lru);
        assert!(cache.len() <= 8);

        // Last write wins once the writers are done
        cache.set("shared", "final".to_string());
        assert_eq!(cache.get("shared").unwrap().plan.as_str(), "final");
        let (entries, lru) = cache.index_sizes();
        assert_eq!(entries, lru);
    }

    #[tokio::test]
    async fn test_get_or_plan_only_plans_on_miss() {
        let cache = cache(10, None);
        let mut planned = 0;

        for _ in 0..3 {
            let plan = cache
                .get_or_plan("q1", || {
                    planned += 1;
                    async { Ok::<_, Error>("plan".to_string()) }
                })
                .await
                .unwrap();
            assert_eq!(*plan, "plan");
        }

        assert_eq!(planned, 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_get_or_plan_does_not_cache_errors() {
        let cache = cache(10, None);
        let result = cache
            .get_or_plan("q1", || async {
                Err::<String, _>(Error::Validation("unknown field".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reports_to_metrics() {
        let metrics = Arc::new(MetricsCollector::default());
        let cache = cache(1, None).with_metrics(metrics.clone());

        cache.get("a");
        cache.set("a", "1".to_string());
        cache.get("a");
        cache.set("b", "2".to_string());
        cache.invalidate(None);

        let snapshot = metrics.get_metrics().cache;
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.sets, 2);
        assert_eq!(snapshot.evictions, 1);
        assert_eq!(snapshot.invalidations, 1);
    }

    #[test]
    fn test_reset_stats() {
        let cache = cache(10, None);
        cache.get("missing");
        cache.reset_stats();
        assert_eq!(cache.stats(), CacheStats {
            max_size: 10,
            ..Default::default()
        });
    }

    #[test]
    fn test_config_validation() {
        assert!(QueryPlanCacheConfig::default().validate().is_ok());
        assert!(QueryPlanCacheConfig { max_size: 0, ttl: None }.validate().is_err());
    }
}
