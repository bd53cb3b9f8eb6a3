//! Performance metrics for subgraph execution, plan caching and entity loading.
//!
//! [`MetricsCollector`] is a passive sink. The error boundary, the query plan
//! cache and the data loaders report into it; operators read an aggregated
//! [`PerformanceMetrics`] snapshot or scrape the optional Prometheus export.
//!
//! # Metrics Exposed (Prometheus)
//!
//! - `subgraph_executions_total` - Subgraph calls by subgraph and status
//! - `subgraph_execution_duration_seconds` - Subgraph call latency histogram
//! - `query_plan_cache_operations_total` - Plan cache operations by kind
//! - `dataloader_batch_size` - Keys per dispatched batch
//!
//! # Example
//!
//! ```rust
//! use federation_resilience::{MetricsCollector, MetricsConfig};
//! use std::time::Duration;
//!
//! let metrics = MetricsCollector::new(MetricsConfig::default());
//! metrics.record_execution("products", Duration::from_millis(12), true);
//!
//! let snapshot = metrics.get_metrics();
//! assert_eq!(snapshot.executions.overall.total_executions, 1);
//! ```

use crate::dataloader::DataLoaderStats;
use crate::{Error, Result};
use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Configuration for metrics collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Master switch; when off every `record_*` call is a no-op
    pub enabled: bool,
    pub collect_execution_metrics: bool,
    pub collect_cache_metrics: bool,
    pub collect_data_loader_metrics: bool,
    /// Number of recent executions used for the p95 latency
    pub window_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_execution_metrics: true,
            collect_cache_metrics: true,
            collect_data_loader_metrics: true,
            window_size: 1000,
        }
    }
}

impl MetricsConfig {
    /// Collect nothing
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the p95 window size
    pub fn window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::Validation(
                "metrics window_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Plan cache operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOperation {
    Hit,
    Miss,
    Set,
    Eviction,
    Invalidation,
}

impl CacheOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOperation::Hit => "hit",
            CacheOperation::Miss => "miss",
            CacheOperation::Set => "set",
            CacheOperation::Eviction => "eviction",
            CacheOperation::Invalidation => "invalidation",
        }
    }
}

/// Aggregated execution statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_duration: Duration,
    /// 95th percentile over the most recent `window_size` executions
    pub p95_duration: Duration,
    pub success_rate: f64,
}

/// Execution statistics, overall and per subgraph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    #[serde(flatten)]
    pub overall: ExecutionStats,
    pub per_subgraph: BTreeMap<String, ExecutionStats>,
}

/// Plan cache statistics as reported by cache operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// Snapshot returned by [`MetricsCollector::get_metrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub executions: ExecutionMetrics,
    pub cache: CacheMetrics,
    pub data_loader: DataLoaderStats,
}

#[derive(Debug, Default)]
struct ExecutionWindow {
    total: u64,
    successful: u64,
    total_duration: Duration,
    recent: VecDeque<Duration>,
}

impl ExecutionWindow {
    fn record(&mut self, duration: Duration, success: bool, window_size: usize) {
        self.total += 1;
        if success {
            self.successful += 1;
        }
        self.total_duration += duration;
        if self.recent.len() >= window_size {
            self.recent.pop_front();
        }
        self.recent.push_back(duration);
    }

    fn stats(&self) -> ExecutionStats {
        if self.total == 0 {
            return ExecutionStats::default();
        }
        ExecutionStats {
            total_executions: self.total,
            successful_executions: self.successful,
            failed_executions: self.total - self.successful,
            average_duration: self.total_duration / u32::try_from(self.total).unwrap_or(u32::MAX),
            p95_duration: percentile(&self.recent, 0.95),
            success_rate: self.successful as f64 / self.total as f64,
        }
    }
}

fn percentile(samples: &VecDeque<Duration>, quantile: f64) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Debug, Default)]
struct MetricsState {
    overall: ExecutionWindow,
    per_subgraph: BTreeMap<String, ExecutionWindow>,
    cache: CacheMetrics,
    loads: u64,
    load_cache_hits: u64,
    batches: u64,
    batched_keys: u64,
}

/// Prometheus collectors, created on [`MetricsCollector::register`]
struct PrometheusMetrics {
    registry: Registry,
    executions: IntCounterVec,
    execution_duration: HistogramVec,
    cache_operations: IntCounterVec,
    batch_size: HistogramVec,
}

impl PrometheusMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let executions = IntCounterVec::new(
            Opts::new("subgraph_executions_total", "Total number of subgraph calls"),
            &["subgraph", "status"],
        )?;
        let execution_duration = HistogramVec::new(
            HistogramOpts::new(
                "subgraph_execution_duration_seconds",
                "Subgraph call duration in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["subgraph"],
        )?;
        let cache_operations = IntCounterVec::new(
            Opts::new(
                "query_plan_cache_operations_total",
                "Total number of query plan cache operations",
            ),
            &["operation"],
        )?;
        let batch_size = HistogramVec::new(
            HistogramOpts::new("dataloader_batch_size", "Number of keys per dispatched batch")
                .buckets(BATCH_SIZE_BUCKETS.to_vec()),
            &["subgraph"],
        )?;

        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;
        registry.register(Box::new(cache_operations.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            executions,
            execution_duration,
            cache_operations,
            batch_size,
        })
    }
}

/// Passive collector of execution, cache and batching statistics
pub struct MetricsCollector {
    config: MetricsConfig,
    state: Mutex<MetricsState>,
    prometheus: OnceLock<PrometheusMetrics>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MetricsState::default()),
            prometheus: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Export metrics through `registry` from now on
    ///
    /// Can be called once per collector.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        if self.prometheus.get().is_some() {
            return Err(Error::Internal(
                "metrics collector is already registered".to_string(),
            ));
        }
        let metrics = PrometheusMetrics::new(registry)?;
        self.prometheus
            .set(metrics)
            .map_err(|_| Error::Internal("metrics collector is already registered".to_string()))
    }

    /// Encode the registered metrics in Prometheus text format
    ///
    /// Returns an empty string until [`MetricsCollector::register`] was called.
    pub fn render(&self) -> Result<String> {
        let Some(metrics) = self.prometheus.get() else {
            return Ok(String::new());
        };
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metrics.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Record one subgraph call
    pub fn record_execution(&self, subgraph_id: &str, duration: Duration, success: bool) {
        if !self.config.enabled || !self.config.collect_execution_metrics {
            return;
        }

        {
            let mut state = self.state.lock();
            let window_size = self.config.window_size.max(1);
            state.overall.record(duration, success, window_size);
            state
                .per_subgraph
                .entry(subgraph_id.to_string())
                .or_default()
                .record(duration, success, window_size);
        }

        if let Some(prom) = self.prometheus.get() {
            let status = if success { "success" } else { "error" };
            prom.executions.with_label_values(&[subgraph_id, status]).inc();
            prom.execution_duration
                .with_label_values(&[subgraph_id])
                .observe(duration.as_secs_f64());
        }
    }

    /// Record one plan cache operation
    pub fn record_cache_operation(&self, operation: CacheOperation) {
        if !self.config.enabled || !self.config.collect_cache_metrics {
            return;
        }

        {
            let mut state = self.state.lock();
            let cache = &mut state.cache;
            match operation {
                CacheOperation::Hit => cache.hits += 1,
                CacheOperation::Miss => cache.misses += 1,
                CacheOperation::Set => cache.sets += 1,
                CacheOperation::Eviction => cache.evictions += 1,
                CacheOperation::Invalidation => cache.invalidations += 1,
            }
        }

        if let Some(prom) = self.prometheus.get() {
            prom.cache_operations
                .with_label_values(&[operation.as_str()])
                .inc();
        }
    }

    /// Record one dispatched DataLoader batch
    pub fn record_batch(&self, subgraph_id: &str, size: usize) {
        if !self.config.enabled || !self.config.collect_data_loader_metrics {
            return;
        }

        {
            let mut state = self.state.lock();
            state.batches += 1;
            state.batched_keys += size as u64;
        }

        if let Some(prom) = self.prometheus.get() {
            prom.batch_size
                .with_label_values(&[subgraph_id])
                .observe(size as f64);
        }
    }

    /// Record one DataLoader `load`
    pub fn record_load(&self, cache_hit: bool) {
        if !self.config.enabled || !self.config.collect_data_loader_metrics {
            return;
        }
        let mut state = self.state.lock();
        state.loads += 1;
        if cache_hit {
            state.load_cache_hits += 1;
        }
    }

    /// Aggregated snapshot of everything recorded so far
    pub fn get_metrics(&self) -> PerformanceMetrics {
        let state = self.state.lock();

        let mut cache = state.cache.clone();
        let lookups = cache.hits + cache.misses;
        cache.hit_rate = if lookups > 0 {
            cache.hits as f64 / lookups as f64
        } else {
            0.0
        };

        PerformanceMetrics {
            executions: ExecutionMetrics {
                overall: state.overall.stats(),
                per_subgraph: state
                    .per_subgraph
                    .iter()
                    .map(|(id, window)| (id.clone(), window.stats()))
                    .collect(),
            },
            cache,
            data_loader: DataLoaderStats::from_counts(
                state.loads,
                state.load_cache_hits,
                state.batches,
                state.batched_keys,
            ),
        }
    }

    /// Clear the aggregated statistics
    ///
    /// Prometheus counters are cumulative and keep their values.
    pub fn reset(&self) {
        *self.state.lock() = MetricsState::default();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("config", &self.config)
            .field("prometheus", &self.prometheus.get().is_some())
            .finish()
    }
}

/// Shared metrics collector
pub type SharedMetricsCollector = Arc<MetricsCollector>;
