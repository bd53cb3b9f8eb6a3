//! DataLoader implementation for batching entity reference loads per subgraph
//!
//! This module provides a DataLoader that batches multiple entity resolution
//! requests to prevent N+1 query problems in federated GraphQL.
//!
//! Keys requested within one scheduling window are collected into a batch of at
//! most `max_batch_size` keys and handed to the subgraph's batch function in
//! submission order. The batch function answers with one `Result` per key, so a
//! single bad key does not fail its neighbours. Results are cached per loader
//! until cleared; failed keys are never cached.
//!
//! # Example
//!
//! ```rust,no_run
//! use federation_resilience::{DataLoaderConfig, FederatedDataLoader, Result};
//!
//! # async fn example() -> Result<()> {
//! let loaders: FederatedDataLoader<String, String> =
//!     FederatedDataLoader::new(DataLoaderConfig::default());
//!
//! let users = loaders.get_loader("users", |ids: Vec<String>| async move {
//!     Ok(ids.into_iter().map(|id| Ok(format!("user-{id}"))).collect())
//! });
//!
//! let user = users.load("1".to_string()).await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::MetricsCollector;
use crate::{Error, Result};
use ahash::AHashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// When a partially filled batch is dispatched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchWindow {
    /// Dispatch once the task that opened the batch yields to the scheduler
    #[default]
    Yield,
    /// Keep the batch open for a fixed delay
    Delay(Duration),
}

/// Configuration for DataLoaders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLoaderConfig {
    /// Maximum keys per batch; a full batch is dispatched immediately
    pub max_batch_size: usize,
    pub batch_window: BatchWindow,
    /// Cache results per loader until cleared
    pub cache: bool,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_window: BatchWindow::Yield,
            cache: true,
        }
    }
}

impl DataLoaderConfig {
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn batch_window(mut self, window: BatchWindow) -> Self {
        self.batch_window = window;
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Validation(
                "dataloader max_batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loader statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderStats {
    pub load_count: u64,
    pub batch_count: u64,
    pub average_batch_size: f64,
    pub cache_hit_rate: f64,
}

impl DataLoaderStats {
    pub(crate) fn from_counts(loads: u64, cache_hits: u64, batches: u64, batched_keys: u64) -> Self {
        Self {
            load_count: loads,
            batch_count: batches,
            average_batch_size: if batches > 0 {
                batched_keys as f64 / batches as f64
            } else {
                0.0
            },
            cache_hit_rate: if loads > 0 {
                cache_hits as f64 / loads as f64
            } else {
                0.0
            },
        }
    }
}

/// Future returned by a boxed batch function
pub type BatchFuture<V> = BoxFuture<'static, Result<Vec<Result<V>>>>;

/// Batch function: ordered keys in, one result per key out
pub type BatchFn<K, V> = Arc<dyn Fn(Vec<K>) -> BatchFuture<V> + Send + Sync>;

/// Maps a key to its cache identity
pub type CacheKeyFn<K> = Arc<dyn Fn(&K) -> K + Send + Sync>;

/// Box a batch function
pub fn batch_fn<K, V, F, Fut>(f: F) -> BatchFn<K, V>
where
    F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Result<V>>>> + Send + 'static,
{
    Arc::new(move |keys| f(keys).boxed())
}

type Shared<V> = std::result::Result<V, Arc<Error>>;

#[derive(Clone)]
struct Slot<V> {
    id: u64,
    rx: watch::Receiver<Option<Shared<V>>>,
}

struct PendingBatch<K, V> {
    id: u64,
    /// Keys as submitted, handed to the batch function
    keys: Vec<K>,
    /// Cache identities of `keys`
    identities: Vec<K>,
    slots: Vec<(u64, watch::Sender<Option<Shared<V>>>)>,
}

struct LoaderState<K, V> {
    pending: Option<PendingBatch<K, V>>,
    cache: AHashMap<K, Slot<V>>,
    next_id: u64,
}

impl<K, V> LoaderState<K, V> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct LoaderInner<K, V> {
    subgraph_id: String,
    config: DataLoaderConfig,
    batch_fn: BatchFn<K, V>,
    cache_key_fn: Option<CacheKeyFn<K>>,
    metrics: Option<Arc<MetricsCollector>>,
    state: Mutex<LoaderState<K, V>>,
    load_count: AtomicU64,
    cache_hits: AtomicU64,
    batch_count: AtomicU64,
    batched_keys: AtomicU64,
}

/// Batching loader for one subgraph
///
/// Cloning is cheap and clones share batches, cache and statistics.
pub struct DataLoader<K, V> {
    inner: Arc<LoaderInner<K, V>>,
}

impl<K, V> Clone for DataLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> DataLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a loader with default options
    pub fn new<F, Fut>(subgraph_id: impl Into<String>, config: DataLoaderConfig, batch_fn: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Result<V>>>> + Send + 'static,
    {
        Self::builder(subgraph_id, self::batch_fn(batch_fn))
            .config(config)
            .build()
    }

    /// Start building a loader around an already boxed batch function
    pub fn builder(subgraph_id: impl Into<String>, batch_fn: BatchFn<K, V>) -> DataLoaderBuilder<K, V> {
        DataLoaderBuilder {
            subgraph_id: subgraph_id.into(),
            config: DataLoaderConfig::default(),
            batch_fn,
            cache_key_fn: None,
            metrics: None,
        }
    }

    /// Load one key
    ///
    /// The key joins the currently open batch (or opens one) before this
    /// future first yields.
    pub async fn load(&self, key: K) -> Result<V> {
        let (identity, slot) = {
            let mut state = self.inner.state.lock();
            self.inner.enqueue(&mut state, key)
        };
        self.resolve(identity, slot).await
    }

    /// Load several keys, results in input order
    ///
    /// All keys are queued at once, so they share batches as far as
    /// `max_batch_size` allows.
    pub async fn load_many<I>(&self, keys: I) -> Vec<Result<V>>
    where
        I: IntoIterator<Item = K>,
    {
        let queued: Vec<(K, Slot<V>)> = {
            let mut state = self.inner.state.lock();
            keys.into_iter()
                .map(|key| self.inner.enqueue(&mut state, key))
                .collect()
        };
        futures::future::join_all(queued.into_iter().map(|(identity, slot)| self.resolve(identity, slot)))
            .await
    }

    /// Seed the cache with a value; an existing entry is kept
    pub fn prime(&self, key: K, value: V) {
        if !self.inner.config.cache {
            return;
        }
        let identity = self.inner.identity(&key);
        let mut state = self.inner.state.lock();
        if state.cache.contains_key(&identity) {
            return;
        }
        let id = state.next_id();
        let (_tx, rx) = watch::channel(Some(Ok(value)));
        state.cache.insert(identity, Slot { id, rx });
    }

    /// Forget one cached key
    pub fn clear(&self, key: &K) {
        let identity = self.inner.identity(key);
        self.inner.state.lock().cache.remove(&identity);
    }

    /// Forget every cached key
    pub fn clear_all(&self) {
        self.inner.state.lock().cache.clear();
    }

    pub fn stats(&self) -> DataLoaderStats {
        DataLoaderStats::from_counts(
            self.inner.load_count.load(Ordering::Relaxed),
            self.inner.cache_hits.load(Ordering::Relaxed),
            self.inner.batch_count.load(Ordering::Relaxed),
            self.inner.batched_keys.load(Ordering::Relaxed),
        )
    }

    pub fn subgraph_id(&self) -> &str {
        &self.inner.subgraph_id
    }

    async fn resolve(&self, identity: K, mut slot: Slot<V>) -> Result<V> {
        let outcome = loop {
            let ready = slot.rx.borrow_and_update().clone();
            if let Some(outcome) = ready {
                break outcome;
            }
            if slot.rx.changed().await.is_err() {
                let ready = slot.rx.borrow().clone();
                break match ready {
                    Some(outcome) => outcome,
                    None => {
                        self.inner.forget(&identity, slot.id);
                        Err(Arc::new(Error::Internal(
                            "batch ended without producing a result".to_string(),
                        )))
                    }
                };
            }
        };

        outcome.map_err(|source| Error::BatchLoad {
            subgraph_id: self.inner.subgraph_id.clone(),
            source,
        })
    }
}

impl<K, V> LoaderInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Cache identity of `key`
    fn identity(&self, key: &K) -> K {
        match &self.cache_key_fn {
            Some(key_fn) => key_fn(key),
            None => key.clone(),
        }
    }

    fn note_load(&self, cache_hit: bool) {
        self.load_count.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_load(cache_hit);
        }
    }

    /// Queue `key`, returning its cache identity and result slot
    fn enqueue(self: &Arc<Self>, state: &mut LoaderState<K, V>, key: K) -> (K, Slot<V>) {
        let identity = self.identity(&key);

        if self.config.cache {
            if let Some(slot) = state.cache.get(&identity) {
                self.note_load(true);
                return (identity, slot.clone());
            }
        }
        self.note_load(false);

        if state.pending.is_none() {
            let batch_id = state.next_id();
            state.pending = Some(PendingBatch {
                id: batch_id,
                keys: Vec::new(),
                identities: Vec::new(),
                slots: Vec::new(),
            });
            self.schedule(batch_id);
        }

        let slot_id = state.next_id();
        let (tx, rx) = watch::channel(None);
        let slot = Slot { id: slot_id, rx };

        let mut full = false;
        if let Some(batch) = state.pending.as_mut() {
            batch.keys.push(key);
            batch.identities.push(identity.clone());
            batch.slots.push((slot_id, tx));
            full = batch.keys.len() >= self.config.max_batch_size;
        }
        if self.config.cache {
            state.cache.insert(identity.clone(), slot.clone());
        }
        if full {
            if let Some(batch) = state.pending.take() {
                tokio::spawn(self.clone().run_batch(batch));
            }
        }

        (identity, slot)
    }

    /// Dispatch batch `batch_id` when its window closes, unless it already filled up
    fn schedule(self: &Arc<Self>, batch_id: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.config.batch_window {
                BatchWindow::Yield => tokio::task::yield_now().await,
                BatchWindow::Delay(delay) => tokio::time::sleep(delay).await,
            }
            let batch = {
                let mut state = inner.state.lock();
                let current = state.pending.as_ref().map(|pending| pending.id);
                if current == Some(batch_id) {
                    state.pending.take()
                } else {
                    None
                }
            };
            if let Some(batch) = batch {
                inner.run_batch(batch).await;
            }
        });
    }

    async fn run_batch(self: Arc<Self>, batch: PendingBatch<K, V>) {
        let PendingBatch {
            keys,
            identities,
            slots,
            ..
        } = batch;
        let size = keys.len();

        self.batch_count.fetch_add(1, Ordering::Relaxed);
        self.batched_keys.fetch_add(size as u64, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_batch(&self.subgraph_id, size);
        }
        tracing::debug!(
            subgraph = %self.subgraph_id,
            batch_size = size,
            "Dispatching DataLoader batch"
        );

        let results: Vec<Shared<V>> = match (self.batch_fn)(keys).await {
            Ok(values) if values.len() == size => values
                .into_iter()
                .map(|result| result.map_err(Arc::new))
                .collect(),
            Ok(values) => {
                tracing::warn!(
                    subgraph = %self.subgraph_id,
                    expected = size,
                    received = values.len(),
                    "Batch function returned the wrong number of results"
                );
                let err = Arc::new(Error::Internal(format!(
                    "batch function returned {} results for {} keys",
                    values.len(),
                    size
                )));
                vec![Err(err); size]
            }
            Err(err) => {
                tracing::warn!(
                    subgraph = %self.subgraph_id,
                    batch_size = size,
                    error = %err,
                    "Batch load failed"
                );
                vec![Err(Arc::new(err)); size]
            }
        };

        {
            let mut state = self.state.lock();
            for ((identity, (slot_id, _)), result) in identities.iter().zip(&slots).zip(&results) {
                if result.is_err() && state.cache.get(identity).map_or(false, |s| s.id == *slot_id) {
                    state.cache.remove(identity);
                }
            }
        }

        for ((_, tx), result) in slots.into_iter().zip(results) {
            tx.send_replace(Some(result));
        }
    }

    fn forget(&self, identity: &K, slot_id: u64) {
        let mut state = self.state.lock();
        if state.cache.get(identity).map_or(false, |s| s.id == slot_id) {
            state.cache.remove(identity);
        }
    }
}

impl<K, V> std::fmt::Debug for DataLoader<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("subgraph", &self.inner.subgraph_id)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder for [`DataLoader`]
pub struct DataLoaderBuilder<K, V> {
    subgraph_id: String,
    config: DataLoaderConfig,
    batch_fn: BatchFn<K, V>,
    cache_key_fn: Option<CacheKeyFn<K>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<K, V> DataLoaderBuilder<K, V> {
    pub fn config(mut self, config: DataLoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Cache and deduplicate keys by `key_fn(key)`
    ///
    /// The batch function still receives the keys as submitted.
    pub fn cache_key_fn(mut self, key_fn: CacheKeyFn<K>) -> Self {
        self.cache_key_fn = Some(key_fn);
        self
    }

    /// Report loads and batches to a metrics collector
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> DataLoader<K, V> {
        DataLoader {
            inner: Arc::new(LoaderInner {
                subgraph_id: self.subgraph_id,
                config: self.config,
                batch_fn: self.batch_fn,
                cache_key_fn: self.cache_key_fn,
                metrics: self.metrics,
                state: Mutex::new(LoaderState {
                    pending: None,
                    cache: AHashMap::new(),
                    next_id: 0,
                }),
                load_count: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                batch_count: AtomicU64::new(0),
                batched_keys: AtomicU64::new(0),
            }),
        }
    }
}

/// One DataLoader per subgraph
pub struct FederatedDataLoader<K, V> {
    config: DataLoaderConfig,
    cache_key_fn: Option<CacheKeyFn<K>>,
    metrics: Option<Arc<MetricsCollector>>,
    loaders: RwLock<HashMap<String, DataLoader<K, V>>>,
}

impl<K, V> FederatedDataLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: DataLoaderConfig) -> Self {
        Self {
            config,
            cache_key_fn: None,
            metrics: None,
            loaders: RwLock::new(HashMap::new()),
        }
    }

    /// Cache identity for keys of every loader created from now on
    pub fn with_cache_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&K) -> K + Send + Sync + 'static,
    {
        self.cache_key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the loader for `subgraph_id`, creating it with `batch_fn` on first use
    ///
    /// Later calls return the existing loader and ignore `batch_fn`.
    pub fn get_loader<F, Fut>(&self, subgraph_id: &str, batch_fn: F) -> DataLoader<K, V>
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Result<V>>>> + Send + 'static,
    {
        self.get_loader_boxed(subgraph_id, self::batch_fn(batch_fn))
    }

    /// [`FederatedDataLoader::get_loader`] for an already boxed batch function
    pub fn get_loader_boxed(&self, subgraph_id: &str, batch_fn: BatchFn<K, V>) -> DataLoader<K, V> {
        if let Some(loader) = self.loaders.read().get(subgraph_id) {
            return loader.clone();
        }

        let mut loaders = self.loaders.write();
        loaders
            .entry(subgraph_id.to_string())
            .or_insert_with(|| {
                let mut builder = DataLoader::builder(subgraph_id, batch_fn).config(self.config.clone());
                if let Some(key_fn) = &self.cache_key_fn {
                    builder = builder.cache_key_fn(key_fn.clone());
                }
                if let Some(metrics) = &self.metrics {
                    builder = builder.metrics(metrics.clone());
                }
                builder.build()
            })
            .clone()
    }

    /// Get an existing loader
    pub fn loader(&self, subgraph_id: &str) -> Option<DataLoader<K, V>> {
        self.loaders.read().get(subgraph_id).cloned()
    }

    /// Clear the cache of every loader
    pub fn clear_all(&self) {
        for loader in self.loaders.read().values() {
            loader.clear_all();
        }
    }

    /// Statistics per subgraph
    pub fn stats(&self) -> BTreeMap<String, DataLoaderStats> {
        self.loaders
            .read()
            .iter()
            .map(|(id, loader)| (id.clone(), loader.stats()))
            .collect()
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }
}

/// Cache key for a federation entity representation
///
/// Two representations of the same type are the same key when they hold the
/// same values, whatever the field order (including nested objects).
#[derive(Clone, Debug)]
pub struct RepresentationKey {
    typename: Arc<str>,
    normalized: NormalizedValue,
    representation: Arc<serde_json::Value>,
}

impl RepresentationKey {
    pub fn new(typename: &str, representation: serde_json::Value) -> Self {
        Self {
            typename: Arc::from(typename),
            normalized: NormalizedValue::from(&representation),
            representation: Arc::new(representation),
        }
    }

    /// Build a key from a representation carrying `__typename`
    pub fn from_representation(representation: serde_json::Value) -> Option<Self> {
        let typename = representation.get("__typename")?.as_str()?.to_string();
        Some(Self::new(&typename, representation))
    }

    pub fn typename(&self) -> &str {
        &self.typename
    }

    pub fn representation(&self) -> &serde_json::Value {
        &self.representation
    }
}

impl PartialEq for RepresentationKey {
    fn eq(&self, other: &Self) -> bool {
        self.typename == other.typename && self.normalized == other.normalized
    }
}

impl Eq for RepresentationKey {}

impl Hash for RepresentationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.typename.hash(state);
        self.normalized.hash(state);
    }
}

/// JSON value with objects sorted by key, for hashing
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum NormalizedValue {
    Null,
    Bool(bool),
    Number(String),
    String(String),
    List(Vec<NormalizedValue>),
    Object(Vec<(String, NormalizedValue)>),
}

impl From<&serde_json::Value> for NormalizedValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.to_string()),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from).collect()),
            serde_json::Value::Object(obj) => {
                let mut entries: Vec<(String, NormalizedValue)> = obj
                    .iter()
                    .map(|(key, value)| (key.clone(), NormalizedValue::from(value)))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Self::Object(entries)
            }
        }
    }
}
