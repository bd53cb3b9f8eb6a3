//! Federation runtime
//!
//! [`FederationRuntime`] ties the resilience components together for one
//! gateway:
//!
//! - operations are fingerprinted and their plans cached in a [`QueryPlanCache`]
//! - plan fetches run concurrently, each behind its subgraph's [`BoundedResolver`]
//! - per-subgraph results are folded by [`ErrorBoundary::handle_partial_failure`]
//! - entity loaders batch through [`FederatedDataLoader`] with breaker-protected batches
//! - every component reports to one shared [`MetricsCollector`]
//!
//! Planning itself (turning a document into subgraph fetches) belongs to the
//! caller and is passed in as a closure.
//!
//! # Example
//!
//! ```rust,no_run
//! use federation_resilience::{FederationRuntime, PlanFetch, ResolveInfo, Result};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<()> {
//! let runtime = FederationRuntime::builder()
//!     .subgraph("users", |_info: ResolveInfo| async move {
//!         Ok(serde_json::json!({ "me": { "id": "1" } }))
//!     })
//!     .subgraph_timeout("users", Duration::from_secs(2))
//!     .build()?;
//!
//! let query = "{ me { id } }";
//! let result = runtime
//!     .execute(query, None, || async {
//!         Ok(vec![PlanFetch::new("users", vec!["me".into()])])
//!     })
//!     .await;
//!
//! let response = runtime.response(result);
//! # Ok(())
//! # }
//! ```

use crate::cache::{QueryPlanCache, QueryPlanCacheConfig};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::ResilienceConfig;
use crate::dataloader::{self, DataLoader, DataLoaderConfig, FederatedDataLoader, RepresentationKey};
use crate::error::SubgraphError;
use crate::error_boundary::{merge_json, BoundedResolver, ErrorBoundary, ErrorBoundaryConfig, ErrorContext, Resolver};
use crate::health::HealthResponse;
use crate::metrics::{MetricsCollector, MetricsConfig};
use crate::types::{GraphQLResponse, OperationType, ProcessedResults, ResolveInfo, SubgraphResult, SubgraphResults};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// One subgraph request of a query plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFetch {
    pub subgraph_id: String,
    /// Response path the fetch resolves
    pub path: Vec<String>,
    /// Subgraph operation text
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub variables: serde_json::Value,
}

impl PlanFetch {
    pub fn new(subgraph_id: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            subgraph_id: subgraph_id.into(),
            path,
            operation: String::new(),
            variables: serde_json::Value::Null,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }
}

/// Cached execution plan of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub fingerprint: String,
    pub operation_type: OperationType,
    pub fetches: Vec<PlanFetch>,
}

/// Resilient execution of federated operations
pub struct FederationRuntime {
    config: ResilienceConfig,
    metrics: Arc<MetricsCollector>,
    boundary: ErrorBoundary,
    cache: QueryPlanCache<QueryPlan>,
    resolvers: HashMap<String, BoundedResolver>,
    loaders: FederatedDataLoader<RepresentationKey, serde_json::Value>,
}

impl FederationRuntime {
    /// Create a new runtime builder
    pub fn builder() -> FederationRuntimeBuilder {
        FederationRuntimeBuilder::new()
    }

    /// Plan an operation, or reuse the cached plan of an identical one
    ///
    /// `planner` only runs on a cache miss.
    pub async fn plan<F, Fut>(
        &self,
        query: &str,
        operation_name: Option<&str>,
        planner: F,
    ) -> Result<Arc<QueryPlan>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<PlanFetch>>>,
    {
        let fingerprint = QueryPlanCache::<QueryPlan>::fingerprint(query, operation_name);
        let operation_type = OperationType::detect(query);
        let planned = fingerprint.clone();

        self.cache
            .get_or_plan(&fingerprint, move || async move {
                let fetches = planner().await?;
                tracing::debug!(
                    fingerprint = %planned,
                    fetches = fetches.len(),
                    "Planned operation"
                );
                Ok(QueryPlan {
                    fingerprint: planned,
                    operation_type,
                    fetches,
                })
            })
            .await
    }

    /// Run every fetch of `plan` and fold the results
    ///
    /// Fetches run concurrently; a slow or failing subgraph does not cancel the
    /// others. Several fetches to one subgraph are merged into one result,
    /// which fails if any of them failed.
    pub async fn execute_plan(&self, plan: &QueryPlan) -> Result<ProcessedResults> {
        let span = tracing::info_span!(
            "federation.execute",
            fingerprint = %plan.fingerprint,
            operation_type = %plan.operation_type,
            fetches = plan.fetches.len(),
        );

        async {
            let results = futures::future::join_all(
                plan.fetches
                    .iter()
                    .map(|fetch| self.fetch(fetch, plan.operation_type)),
            )
            .await;

            let mut outcomes: BTreeMap<String, std::result::Result<serde_json::Value, SubgraphError>> =
                BTreeMap::new();
            for result in results {
                let subgraph_id = result.subgraph_id().to_string();
                let outcome = result.into_outcome();
                match outcomes.entry(subgraph_id) {
                    Entry::Vacant(entry) => {
                        entry.insert(outcome);
                    }
                    Entry::Occupied(mut entry) => {
                        let slot = entry.get_mut();
                        match outcome {
                            Ok(value) => {
                                if let Ok(data) = slot {
                                    merge_json(data, value);
                                }
                            }
                            Err(err) => {
                                if slot.is_ok() {
                                    *slot = Err(err);
                                }
                            }
                        }
                    }
                }
            }

            let results: SubgraphResults = outcomes
                .into_iter()
                .map(|(subgraph_id, outcome)| {
                    let result = match outcome {
                        Ok(data) => SubgraphResult::success(subgraph_id.clone(), data),
                        Err(err) => SubgraphResult::failure(subgraph_id.clone(), err),
                    };
                    (subgraph_id, result)
                })
                .collect();

            self.boundary.handle_partial_failure(results)
        }
        .instrument(span)
        .await
    }

    /// Plan (or reuse a plan) and execute an operation
    pub async fn execute<F, Fut>(
        &self,
        query: &str,
        operation_name: Option<&str>,
        planner: F,
    ) -> Result<ProcessedResults>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<PlanFetch>>>,
    {
        let plan = self.plan(query, operation_name, planner).await?;
        self.execute_plan(&plan).await
    }

    /// Client response for the outcome of [`FederationRuntime::execute`]
    pub fn response(&self, result: Result<ProcessedResults>) -> GraphQLResponse {
        match result {
            Ok(processed) => processed.into(),
            Err(err) => {
                GraphQLResponse::error(self.boundary.transform_error(&err, &ErrorContext::default()))
            }
        }
    }

    /// Entity loader of `subgraph_id`
    ///
    /// The loader is created on first use; its batches run behind the
    /// subgraph's timeout and circuit breaker. Later calls return the same
    /// loader and ignore `batch_fn`.
    pub fn loader<F, Fut>(&self, subgraph_id: &str, batch_fn: F) -> DataLoader<RepresentationKey, serde_json::Value>
    where
        F: Fn(Vec<RepresentationKey>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Result<serde_json::Value>>>> + Send + 'static,
    {
        if let Some(loader) = self.loaders.loader(subgraph_id) {
            return loader;
        }
        let protected = self
            .boundary
            .wrap_batch_fn(subgraph_id, dataloader::batch_fn(batch_fn));
        self.loaders.get_loader_boxed(subgraph_id, protected)
    }

    /// Entity loaders of every subgraph
    pub fn loaders(&self) -> &FederatedDataLoader<RepresentationKey, serde_json::Value> {
        &self.loaders
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Health of every subgraph, from its circuit breaker
    pub fn health(&self) -> HealthResponse {
        HealthResponse::from_registry(self.boundary.breakers())
    }

    pub fn cache(&self) -> &QueryPlanCache<QueryPlan> {
        &self.cache
    }

    pub fn boundary(&self) -> &ErrorBoundary {
        &self.boundary
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Ids of the registered subgraphs, sorted
    pub fn subgraphs(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.resolvers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    async fn fetch(&self, fetch: &PlanFetch, operation_type: OperationType) -> SubgraphResult {
        let info = ResolveInfo::new(fetch.path.clone(), operation_type)
            .with_operation(fetch.operation.clone())
            .with_variables(fetch.variables.clone());

        match self.resolvers.get(&fetch.subgraph_id) {
            Some(resolver) => resolver.execute(&info).await,
            None => {
                tracing::warn!(subgraph = %fetch.subgraph_id, "Plan references an unknown subgraph");
                self.metrics
                    .record_execution(&fetch.subgraph_id, Duration::ZERO, false);
                SubgraphResult::failure(
                    &fetch.subgraph_id,
                    SubgraphError::new(
                        &fetch.subgraph_id,
                        info.path,
                        operation_type,
                        Error::Internal(format!(
                            "No resolver registered for subgraph '{}'",
                            fetch.subgraph_id
                        )),
                    ),
                )
            }
        }
    }
}

impl std::fmt::Debug for FederationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationRuntime")
            .field("subgraphs", &self.subgraphs())
            .field("boundary", &self.boundary)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Builder for creating a [`FederationRuntime`]
///
/// # Example
///
/// ```rust,no_run
/// use federation_resilience::{CircuitBreakerConfig, FederationRuntime, ResolveInfo};
/// use std::time::Duration;
///
/// # fn example() -> federation_resilience::Result<()> {
/// let runtime = FederationRuntime::builder()
///     .subgraph("reviews", |_info: ResolveInfo| async move { Ok(serde_json::json!({})) })
///     .circuit_breaker(CircuitBreakerConfig {
///         failure_threshold: 3,
///         reset_timeout: Duration::from_secs(10),
///         half_open_max_calls: 1,
///     })
///     .critical_subgraph("accounts")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct FederationRuntimeBuilder {
    config: ResilienceConfig,
    subgraphs: Vec<(String, Arc<dyn Resolver>)>,
    prometheus: Option<prometheus::Registry>,
}

impl FederationRuntimeBuilder {
    pub fn new() -> Self {
        Self::from_config(ResilienceConfig::default())
    }

    /// Start from a complete configuration
    pub fn from_config(config: ResilienceConfig) -> Self {
        Self {
            config,
            subgraphs: Vec::new(),
            prometheus: None,
        }
    }

    /// Register the resolver of a subgraph
    pub fn subgraph<R>(mut self, subgraph_id: impl Into<String>, resolver: R) -> Self
    where
        R: Resolver + 'static,
    {
        let resolver: Arc<dyn Resolver> = Arc::new(resolver);
        self.subgraphs.push((subgraph_id.into(), resolver));
        self
    }

    /// Timeout for calls to one subgraph
    pub fn subgraph_timeout(mut self, subgraph_id: impl Into<String>, timeout: Duration) -> Self {
        self.config
            .error_boundary
            .subgraph_timeouts
            .insert(subgraph_id.into(), timeout);
        self
    }

    /// Timeout for subgraphs without their own
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.error_boundary.default_timeout = timeout;
        self
    }

    /// Breaker settings shared by every subgraph
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.error_boundary.circuit_breaker = config;
        self
    }

    /// Breaker settings of one subgraph
    pub fn subgraph_circuit_breaker(mut self, subgraph_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.config
            .error_boundary
            .subgraph_circuit_breakers
            .insert(subgraph_id.into(), config);
        self
    }

    /// Fail the whole operation when this subgraph fails
    pub fn critical_subgraph(mut self, subgraph_id: impl Into<String>) -> Self {
        self.config
            .error_boundary
            .partial_failure
            .critical_subgraphs
            .insert(subgraph_id.into());
        self
    }

    /// Data used in place of a failing subgraph's data
    pub fn fallback_value(mut self, subgraph_id: impl Into<String>, value: serde_json::Value) -> Self {
        self.config
            .error_boundary
            .partial_failure
            .fallback_values
            .insert(subgraph_id.into(), value);
        self
    }

    pub fn error_boundary(mut self, config: ErrorBoundaryConfig) -> Self {
        self.config.error_boundary = config;
        self
    }

    pub fn query_plan_cache(mut self, config: QueryPlanCacheConfig) -> Self {
        self.config.query_plan_cache = config;
        self
    }

    pub fn data_loader(mut self, config: DataLoaderConfig) -> Self {
        self.config.data_loader = config;
        self
    }

    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.config.metrics = config;
        self
    }

    /// Export metrics through a Prometheus registry
    pub fn with_prometheus(mut self, registry: prometheus::Registry) -> Self {
        self.prometheus = Some(registry);
        self
    }

    /// Validate the configuration and build the runtime
    pub fn build(self) -> Result<FederationRuntime> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        for (subgraph_id, _) in &self.subgraphs {
            if subgraph_id.is_empty() {
                return Err(Error::Validation("subgraph id must not be empty".to_string()));
            }
            if !seen.insert(subgraph_id.as_str()) {
                return Err(Error::Validation(format!(
                    "subgraph '{subgraph_id}' is registered more than once"
                )));
            }
        }

        let metrics = Arc::new(MetricsCollector::new(self.config.metrics.clone()));
        if let Some(registry) = &self.prometheus {
            metrics.register(registry)?;
        }

        let boundary = ErrorBoundary::new(self.config.error_boundary.clone()).with_metrics(metrics.clone());
        let cache = QueryPlanCache::new(self.config.query_plan_cache.clone()).with_metrics(metrics.clone());
        let loaders = FederatedDataLoader::new(self.config.data_loader.clone()).with_metrics(metrics.clone());

        let resolvers: HashMap<String, BoundedResolver> = self
            .subgraphs
            .into_iter()
            .map(|(subgraph_id, resolver)| {
                let bounded = boundary.wrap_shared(&subgraph_id, resolver);
                (subgraph_id, bounded)
            })
            .collect();

        tracing::info!(
            subgraphs = resolvers.len(),
            cache_size = self.config.query_plan_cache.max_size,
            "Federation runtime ready"
        );

        Ok(FederationRuntime {
            config: self.config,
            metrics,
            boundary,
            cache,
            resolvers,
            loaders,
        })
    }
}

impl Default for FederationRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
