//! Error boundary around subgraph calls
//!
//! Every call to a subgraph goes through a [`BoundedResolver`], which:
//!
//! 1. Applies the subgraph's timeout (or the default one)
//! 2. Routes the outcome through the subgraph's [`CircuitBreaker`]
//! 3. Tags any failure with the subgraph, field path and operation type
//!
//! Once all subgraphs of an operation answered, [`ErrorBoundary::handle_partial_failure`]
//! decides whether the client gets partial data plus errors, or a failed operation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use federation_resilience::{
//!     ErrorBoundary, ErrorBoundaryConfig, OperationType, ResolveInfo, Result, Resolver,
//! };
//!
//! # async fn example() -> Result<()> {
//! let boundary = ErrorBoundary::new(ErrorBoundaryConfig::default());
//!
//! let reviews = boundary.wrap_resolver("reviews", |info: ResolveInfo| async move {
//!     Ok(serde_json::json!({ "reviews": [] }))
//! });
//!
//! let info = ResolveInfo::new(vec!["me".into(), "reviews".into()], OperationType::Query);
//! let data = reviews.resolve(&info).await?;
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    SharedCircuitBreakerRegistry,
};
use crate::dataloader::{BatchFn, BatchFuture};
use crate::error::{is_production, GraphQLError, SubgraphError};
use crate::metrics::MetricsCollector;
use crate::types::{OperationType, ProcessedResults, ResolveInfo, SubgraphResult, SubgraphResults};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// How failing subgraphs affect the whole operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialFailureConfig {
    /// Return data of healthy subgraphs alongside errors of failing ones
    pub allow_partial_failure: bool,
    /// Subgraphs whose failure fails the whole operation
    pub critical_subgraphs: HashSet<String>,
    /// Data merged into the response in place of a failing subgraph's data
    pub fallback_values: HashMap<String, serde_json::Value>,
}

impl Default for PartialFailureConfig {
    fn default() -> Self {
        Self {
            allow_partial_failure: true,
            critical_subgraphs: HashSet::new(),
            fallback_values: HashMap::new(),
        }
    }
}

/// How errors are presented to clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorTransformationConfig {
    /// Replace internal messages with generic ones and drop causes
    pub sanitize_errors: bool,
    /// Add the cause chain under `extensions.exception.stacktrace` (debug builds only)
    pub include_stack_trace: bool,
}

impl Default for ErrorTransformationConfig {
    fn default() -> Self {
        Self {
            sanitize_errors: is_production(),
            include_stack_trace: false,
        }
    }
}

/// Configuration for the error boundary
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorBoundaryConfig {
    /// Per-subgraph call timeouts
    pub subgraph_timeouts: HashMap<String, Duration>,
    /// Timeout for subgraphs without an entry in `subgraph_timeouts`
    pub default_timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-subgraph circuit breaker settings
    pub subgraph_circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    pub partial_failure: PartialFailureConfig,
    pub error_transformation: ErrorTransformationConfig,
}

impl Default for ErrorBoundaryConfig {
    fn default() -> Self {
        Self {
            subgraph_timeouts: HashMap::new(),
            default_timeout: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
            subgraph_circuit_breakers: HashMap::new(),
            partial_failure: PartialFailureConfig::default(),
            error_transformation: ErrorTransformationConfig::default(),
        }
    }
}

impl ErrorBoundaryConfig {
    /// Set the timeout of one subgraph
    pub fn subgraph_timeout(mut self, subgraph_id: impl Into<String>, timeout: Duration) -> Self {
        self.subgraph_timeouts.insert(subgraph_id.into(), timeout);
        self
    }

    /// Timeout of subgraphs without their own
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Breaker settings shared by every subgraph
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Fail the whole operation when `subgraph_id` fails
    pub fn critical_subgraph(mut self, subgraph_id: impl Into<String>) -> Self {
        self.partial_failure.critical_subgraphs.insert(subgraph_id.into());
        self
    }

    /// Use `value` in place of a failing subgraph's data
    pub fn fallback_value(mut self, subgraph_id: impl Into<String>, value: serde_json::Value) -> Self {
        self.partial_failure
            .fallback_values
            .insert(subgraph_id.into(), value);
        self
    }

    /// Return healthy subgraphs' data alongside errors of failing ones
    pub fn allow_partial_failure(mut self, allow: bool) -> Self {
        self.partial_failure.allow_partial_failure = allow;
        self
    }

    /// Replace error details with generic messages
    pub fn sanitize_errors(mut self, sanitize: bool) -> Self {
        self.error_transformation.sanitize_errors = sanitize;
        self
    }

    /// Reject zero timeouts and invalid breaker settings
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(Error::Validation(
                "error boundary default_timeout must be greater than 0".to_string(),
            ));
        }
        if let Some((id, _)) = self.subgraph_timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(Error::Validation(format!(
                "timeout for subgraph '{id}' must be greater than 0"
            )));
        }
        self.circuit_breaker.validate()?;
        for config in self.subgraph_circuit_breakers.values() {
            config.validate()?;
        }
        Ok(())
    }
}

/// A subgraph field resolver
///
/// Implemented for any `Fn(ResolveInfo) -> impl Future<Output = Result<Value>>`.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, info: &ResolveInfo) -> Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut> Resolver for F
where
    F: Fn(ResolveInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn resolve(&self, info: &ResolveInfo) -> Result<serde_json::Value> {
        (self)(info.clone()).await
    }
}

/// Where an error happened, for [`ErrorBoundary::transform_error`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub subgraph_id: Option<String>,
    pub path: Option<Vec<String>>,
    pub operation_type: Option<OperationType>,
}

impl ErrorContext {
    pub fn for_subgraph(subgraph_id: impl Into<String>) -> Self {
        Self {
            subgraph_id: Some(subgraph_id.into()),
            ..Default::default()
        }
    }
}

impl From<&SubgraphError> for ErrorContext {
    fn from(err: &SubgraphError) -> Self {
        Self {
            subgraph_id: Some(err.subgraph_id.clone()),
            path: (!err.path.is_empty()).then(|| err.path.clone()),
            operation_type: Some(err.operation_type),
        }
    }
}

/// Timeout + circuit breaker + error tagging for one subgraph
pub struct ErrorBoundary {
    config: ErrorBoundaryConfig,
    breakers: SharedCircuitBreakerRegistry,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ErrorBoundary {
    pub fn new(config: ErrorBoundaryConfig) -> Self {
        let registry = config.subgraph_circuit_breakers.iter().fold(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            |registry, (id, breaker)| registry.with_override(id.clone(), breaker.clone()),
        );
        Self {
            config,
            breakers: Arc::new(registry),
            metrics: None,
        }
    }

    /// Record every bounded call in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ErrorBoundaryConfig {
        &self.config
    }

    /// Circuit breakers, one per subgraph
    pub fn breakers(&self) -> &SharedCircuitBreakerRegistry {
        &self.breakers
    }

    /// Timeout applied to calls to `subgraph_id`
    pub fn timeout_for(&self, subgraph_id: &str) -> Duration {
        self.config
            .subgraph_timeouts
            .get(subgraph_id)
            .copied()
            .unwrap_or(self.config.default_timeout)
    }

    /// Wrap a resolver with the subgraph's timeout and circuit breaker
    pub fn wrap_resolver<R>(&self, subgraph_id: &str, resolver: R) -> BoundedResolver
    where
        R: Resolver + 'static,
    {
        self.wrap_shared(subgraph_id, Arc::new(resolver))
    }

    /// [`ErrorBoundary::wrap_resolver`] for a resolver that is already shared
    pub fn wrap_shared(&self, subgraph_id: &str, resolver: Arc<dyn Resolver>) -> BoundedResolver {
        BoundedResolver {
            guard: self.guard(subgraph_id),
            resolver,
        }
    }

    /// Resolve once through the boundary
    pub async fn execute<R>(&self, subgraph_id: &str, resolver: R, info: &ResolveInfo) -> SubgraphResult
    where
        R: Resolver + 'static,
    {
        self.wrap_resolver(subgraph_id, resolver).execute(info).await
    }

    /// Protect a DataLoader batch function with the subgraph's timeout and breaker
    ///
    /// A failed batch comes back as `Error::Subgraph`; per-key errors inside a
    /// successful batch pass through untouched and do not trip the breaker.
    pub fn wrap_batch_fn<K, V>(&self, subgraph_id: &str, batch_fn: BatchFn<K, V>) -> BatchFn<K, V>
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let guard = Arc::new(self.guard(subgraph_id));
        Arc::new(move |keys: Vec<K>| -> BatchFuture<V> {
            let guard = guard.clone();
            let batch_fn = batch_fn.clone();
            async move {
                let span = tracing::info_span!(
                    "subgraph.call",
                    subgraph = %guard.subgraph_id,
                    batch_size = keys.len(),
                );
                guard
                    .call(span, move || batch_fn(keys))
                    .await
                    .map_err(|cause| {
                        Error::Subgraph(SubgraphError::new(
                            guard.subgraph_id.clone(),
                            Vec::new(),
                            OperationType::Query,
                            cause,
                        ))
                    })
            }
            .boxed()
        })
    }

    /// Fold per-subgraph results into one response
    ///
    /// Results are merged in subgraph id order. Fails with
    /// [`Error::PartialFailureDisabled`] or [`Error::CriticalSubgraphFailed`]
    /// when the configuration does not allow partial data.
    pub fn handle_partial_failure(&self, results: SubgraphResults) -> Result<ProcessedResults> {
        let failed: Vec<String> = results
            .values()
            .filter(|result| !result.is_success())
            .map(|result| result.subgraph_id().to_string())
            .collect();

        let policy = &self.config.partial_failure;
        if !failed.is_empty() {
            if !policy.allow_partial_failure {
                tracing::warn!(failed = ?failed, "Subgraphs failed and partial failure is disabled");
                return Err(Error::PartialFailureDisabled { subgraphs: failed });
            }

            let critical: Vec<String> = failed
                .iter()
                .filter(|id| policy.critical_subgraphs.contains(*id))
                .cloned()
                .collect();
            if !critical.is_empty() {
                tracing::warn!(critical = ?critical, "Critical subgraph failed");
                return Err(Error::CriticalSubgraphFailed { subgraphs: critical });
            }

            tracing::warn!(failed = ?failed, "Returning partial results");
        }

        let mut data = serde_json::Value::Object(serde_json::Map::new());
        let mut errors = Vec::new();

        for (subgraph_id, result) in results {
            match result.into_outcome() {
                Ok(value) => merge_json(&mut data, value),
                Err(err) => {
                    let context = ErrorContext::from(&err);
                    errors.push(self.transform_error(&Error::Subgraph(err), &context));
                    if let Some(fallback) = policy.fallback_values.get(&subgraph_id) {
                        merge_json(&mut data, fallback.clone());
                    }
                }
            }
        }

        Ok(ProcessedResults { data, errors })
    }

    /// Turn an error into the client-facing shape
    ///
    /// The output depends only on the error, the context and the configuration.
    pub fn transform_error(&self, error: &Error, context: &ErrorContext) -> GraphQLError {
        let settings = &self.config.error_transformation;

        let message = if settings.sanitize_errors {
            error.sanitized_message()
        } else {
            error.to_string()
        };

        let mut extensions = HashMap::new();
        extensions.insert("code".to_string(), serde_json::json!(error.code()));

        let subgraph_id = context
            .subgraph_id
            .as_deref()
            .or_else(|| error.subgraph_id());
        if let Some(subgraph_id) = subgraph_id {
            extensions.insert("subgraph".to_string(), serde_json::json!(subgraph_id));
        }
        if let Some(operation_type) = context.operation_type {
            extensions.insert(
                "operationType".to_string(),
                serde_json::json!(operation_type.to_string()),
            );
        }
        if let Some(open) = circuit_open_cause(error) {
            extensions.extend(open.to_extensions());
        }

        if settings.include_stack_trace && !settings.sanitize_errors && cfg!(debug_assertions) {
            let mut chain = vec![error.to_string()];
            let mut source = std::error::Error::source(error);
            while let Some(cause) = source {
                chain.push(cause.to_string());
                source = std::error::Error::source(cause);
            }
            extensions.insert(
                "exception".to_string(),
                serde_json::json!({ "stacktrace": chain }),
            );
        }

        GraphQLError {
            message,
            code: error.code().to_string(),
            path: context
                .path
                .clone()
                .or_else(|| error.path().map(<[String]>::to_vec)),
            extensions,
        }
    }

    fn guard(&self, subgraph_id: &str) -> CallGuard {
        CallGuard {
            subgraph_id: subgraph_id.to_string(),
            breaker: self.breakers.get_or_create(subgraph_id),
            timeout: self.timeout_for(subgraph_id),
            metrics: self.metrics.clone(),
        }
    }
}

impl std::fmt::Debug for ErrorBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBoundary")
            .field("config", &self.config)
            .field("breakers", &self.breakers)
            .finish()
    }
}

fn circuit_open_cause(error: &Error) -> Option<&CircuitBreakerError> {
    match error {
        Error::CircuitOpen(open) => Some(open),
        Error::Subgraph(err) => err.cause.as_deref().and_then(circuit_open_cause),
        _ => None,
    }
}

/// Merge `value` into `target`
///
/// Objects merge key by key, recursively; anything else in `value` replaces
/// what is in `target`.
pub fn merge_json(target: &mut serde_json::Value, value: serde_json::Value) {
    match (target, value) {
        (serde_json::Value::Object(target), serde_json::Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, value) => *target = value,
    }
}

/// Timeout, breaker and metrics for calls to one subgraph
struct CallGuard {
    subgraph_id: String,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CallGuard {
    async fn call<F, Fut, T>(&self, span: tracing::Span, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let outcome = self
            .breaker
            .protect(move || async move {
                match tokio::time::timeout(self.timeout, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        subgraph_id: self.subgraph_id.clone(),
                        timeout: self.timeout,
                    }),
                }
            })
            .instrument(span)
            .await;
        let elapsed = started.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics.record_execution(&self.subgraph_id, elapsed, outcome.is_ok());
        }
        if let Err(err) = &outcome {
            tracing::warn!(
                subgraph = %self.subgraph_id,
                error = %err,
                elapsed_ms = elapsed.as_millis() as u64,
                "Subgraph call failed"
            );
        }
        outcome
    }
}

/// A resolver running behind a subgraph's timeout and circuit breaker
pub struct BoundedResolver {
    guard: CallGuard,
    resolver: Arc<dyn Resolver>,
}

impl BoundedResolver {
    pub fn subgraph_id(&self) -> &str {
        &self.guard.subgraph_id
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.guard.breaker
    }

    pub fn timeout(&self) -> Duration {
        self.guard.timeout
    }

    /// Resolve and package the outcome as a [`SubgraphResult`]
    pub async fn execute(&self, info: &ResolveInfo) -> SubgraphResult {
        match self.resolve(info).await {
            Ok(data) => SubgraphResult::success(self.subgraph_id(), data),
            Err(Error::Subgraph(err)) => SubgraphResult::failure(self.subgraph_id(), err),
            Err(other) => SubgraphResult::failure(
                self.subgraph_id(),
                SubgraphError::new(self.subgraph_id(), info.path.clone(), info.operation_type, other),
            ),
        }
    }
}

#[async_trait]
impl Resolver for BoundedResolver {
    async fn resolve(&self, info: &ResolveInfo) -> Result<serde_json::Value> {
        let span = tracing::info_span!(
            "subgraph.call",
            subgraph = %self.guard.subgraph_id,
            operation_type = %info.operation_type,
            path = %info.path.join("."),
        );
        self.guard
            .call(span, || self.resolver.resolve(info))
            .await
            .map_err(|cause| {
                Error::Subgraph(SubgraphError::new(
                    self.guard.subgraph_id.clone(),
                    info.path.clone(),
                    info.operation_type,
                    cause,
                ))
            })
    }
}

impl std::fmt::Debug for BoundedResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedResolver")
            .field("subgraph", &self.guard.subgraph_id)
            .field("timeout", &self.guard.timeout)
            .field("breaker", &self.guard.breaker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::error::SubgraphErrorKind;
    use crate::metrics::MetricsConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ErrorBoundaryConfig {
        ErrorBoundaryConfig {
            error_transformation: ErrorTransformationConfig {
                sanitize_errors: false,
                include_stack_trace: false,
            },
            ..Default::default()
        }
    }

    fn info(path: &[&str]) -> ResolveInfo {
        ResolveInfo::new(path.iter().map(|s| s.to_string()).collect(), OperationType::Query)
    }

    fn failure(subgraph_id: &str, message: &str) -> SubgraphResult {
        SubgraphResult::failure(
            subgraph_id,
            SubgraphError::new(
                subgraph_id,
                vec!["me".to_string()],
                OperationType::Query,
                Error::Resolver(message.to_string()),
            ),
        )
    }

    fn results(items: Vec<SubgraphResult>) -> SubgraphResults {
        items
            .into_iter()
            .map(|r| (r.subgraph_id().to_string(), r))
            .collect()
    }

    #[tokio::test]
    async fn test_wrap_resolver_passes_data_through() {
        let boundary = ErrorBoundary::new(config());
        let resolver = boundary.wrap_resolver("users", |info: ResolveInfo| async move {
            Ok(json!({ "path": info.path }))
        });

        let data = resolver.resolve(&info(&["me"])).await.unwrap();
        assert_eq!(data, json!({ "path": ["me"] }));
        assert_eq!(resolver.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_downstream_error_is_tagged() {
        let boundary = ErrorBoundary::new(config());
        let resolver = boundary.wrap_resolver("reviews", |_info: ResolveInfo| async {
            Err(Error::Resolver("502 from reviews".to_string()))
        });

        let err = resolver.resolve(&info(&["me", "reviews"])).await.unwrap_err();
        match err {
            Error::Subgraph(err) => {
                assert_eq!(err.subgraph_id, "reviews");
                assert_eq!(err.path, vec!["me".to_string(), "reviews".to_string()]);
                assert_eq!(err.operation_type, OperationType::Query);
                assert_eq!(err.kind, SubgraphErrorKind::Downstream);
                assert!(err.timestamp > 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_breaker_failure() {
        let boundary = ErrorBoundary::new(
            config()
                .subgraph_timeout("slow", Duration::from_millis(50))
                .circuit_breaker(CircuitBreakerConfig {
                    failure_threshold: 1,
                    reset_timeout: Duration::from_secs(60),
                    half_open_max_calls: 1,
                }),
        );
        assert_eq!(boundary.timeout_for("slow"), Duration::from_millis(50));
        assert_eq!(boundary.timeout_for("other"), Duration::from_secs(30));

        let resolver = boundary.wrap_resolver("slow", |_info: ResolveInfo| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        });

        let result = resolver.execute(&info(&["slowField"])).await;
        assert!(!result.is_success());
        assert_eq!(result.error().unwrap().kind, SubgraphErrorKind::Timeout);
        assert_eq!(resolver.breaker().state(), CircuitState::Open);

        let result = resolver.execute(&info(&["slowField"])).await;
        assert_eq!(result.error().unwrap().kind, SubgraphErrorKind::CircuitOpen);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_resolver() {
        let boundary = ErrorBoundary::new(config().circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let resolver = boundary.wrap_resolver("inventory", move |_info: ResolveInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Resolver("down".to_string())) }
        });

        for _ in 0..3 {
            resolver.execute(&info(&["inStock"])).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            boundary.breakers().status().get("inventory"),
            Some(&CircuitState::Open)
        );
    }

    #[tokio::test]
    async fn test_records_executions() {
        let metrics = Arc::new(MetricsCollector::new(MetricsConfig::default()));
        let boundary = ErrorBoundary::new(config()).with_metrics(metrics.clone());

        boundary
            .execute("users", |_info: ResolveInfo| async { Ok(json!({})) }, &info(&["me"]))
            .await;
        boundary
            .execute(
                "users",
                |_info: ResolveInfo| async { Err(Error::Resolver("boom".to_string())) },
                &info(&["me"]),
            )
            .await;

        let executions = metrics.get_metrics().executions;
        assert_eq!(executions.overall.total_executions, 2);
        assert_eq!(executions.per_subgraph["users"].failed_executions, 1);
    }

    #[tokio::test]
    async fn test_wrap_batch_fn() {
        let boundary = ErrorBoundary::new(config().circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }));

        let ok = boundary.wrap_batch_fn(
            "products",
            crate::dataloader::batch_fn(|keys: Vec<u32>| async move {
                Ok(keys
                    .into_iter()
                    .map(|k| if k == 0 { Err(Error::Resolver("zero".into())) } else { Ok(k) })
                    .collect())
            }),
        );
        let values = ok(vec![0, 1]).await.unwrap();
        assert!(values[0].is_err());
        assert_eq!(*values[1].as_ref().unwrap(), 1);
        // A per-key error does not trip the breaker
        assert_eq!(
            boundary.breakers().get("products").unwrap().state(),
            CircuitState::Closed
        );

        let failing = boundary.wrap_batch_fn(
            "reviews",
            crate::dataloader::batch_fn(|_keys: Vec<u32>| async {
                Err::<Vec<Result<u32>>, _>(Error::Resolver("down".into()))
            }),
        );
        assert!(matches!(failing(vec![1]).await, Err(Error::Subgraph(_))));
        assert_eq!(
            boundary.breakers().get("reviews").unwrap().state(),
            CircuitState::Open
        );
    }

    #[test]
    fn test_all_success_merges_data() {
        let boundary = ErrorBoundary::new(config());
        let processed = boundary
            .handle_partial_failure(results(vec![
                SubgraphResult::success("users", json!({"me": {"id": "1", "name": "Ada"}})),
                SubgraphResult::success("reviews", json!({"me": {"reviews": [{"body": "ok"}]}})),
            ]))
            .unwrap();

        assert!(processed.errors.is_empty());
        assert_eq!(
            processed.data,
            json!({"me": {"id": "1", "name": "Ada", "reviews": [{"body": "ok"}]}})
        );
    }

    #[test]
    fn test_partial_failure_with_fallback() {
        let boundary = ErrorBoundary::new(config().fallback_value("reviews", json!({"reviews": []})));
        let processed = boundary
            .handle_partial_failure(results(vec![
                SubgraphResult::success("users", json!({"me": {"id": "1"}})),
                failure("reviews", "connection refused"),
            ]))
            .unwrap();

        assert_eq!(processed.data, json!({"me": {"id": "1"}, "reviews": []}));
        assert_eq!(processed.errors.len(), 1);
        let error = &processed.errors[0];
        assert_eq!(error.code, "SUBGRAPH_ERROR");
        assert_eq!(error.path, Some(vec!["me".to_string()]));
        assert_eq!(error.extensions["subgraph"], json!("reviews"));
        assert!(error.message.contains("connection refused"));
    }

    #[test]
    fn test_partial_failure_without_fallback_omits_data() {
        let boundary = ErrorBoundary::new(config());
        let processed = boundary
            .handle_partial_failure(results(vec![
                SubgraphResult::success("users", json!({"me": {"id": "1"}})),
                failure("reviews", "connection refused"),
                failure("inventory", "timeout"),
            ]))
            .unwrap();

        assert_eq!(processed.data, json!({"me": {"id": "1"}}));
        assert_eq!(processed.errors.len(), 2);
        assert!(processed.is_partial());
    }

    #[test]
    fn test_critical_subgraph_failure() {
        let boundary = ErrorBoundary::new(config().critical_subgraph("accounts"));
        let err = boundary
            .handle_partial_failure(results(vec![
                SubgraphResult::success("users", json!({"me": {"id": "1"}})),
                failure("accounts", "db down"),
            ]))
            .unwrap_err();

        match err {
            Error::CriticalSubgraphFailed { subgraphs } => {
                assert_eq!(subgraphs, vec!["accounts".to_string()])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_partial_failure_disabled() {
        let boundary = ErrorBoundary::new(config().allow_partial_failure(false));
        let err = boundary
            .handle_partial_failure(results(vec![
                SubgraphResult::success("users", json!({})),
                failure("reviews", "boom"),
            ]))
            .unwrap_err();
        assert!(matches!(err, Error::PartialFailureDisabled { .. }));

        // Nothing failed, nothing to refuse
        assert!(boundary
            .handle_partial_failure(results(vec![SubgraphResult::success("users", json!({}))]))
            .is_ok());
    }

    #[test]
    fn test_transform_error_sanitizes() {
        let boundary = ErrorBoundary::new(config().sanitize_errors(true));
        let error = Error::Internal("password=hunter2 in connection string".to_string());

        let transformed = boundary.transform_error(&error, &ErrorContext::for_subgraph("users"));
        assert_eq!(transformed.message, "Internal server error");
        assert_eq!(transformed.code, "INTERNAL_ERROR");
        assert_eq!(transformed.extensions["subgraph"], json!("users"));
        assert!(!transformed.extensions.contains_key("exception"));
    }

    #[test]
    fn test_transform_error_is_deterministic() {
        let boundary = ErrorBoundary::new(config());
        let error = Error::Subgraph(SubgraphError::new(
            "users",
            vec!["me".to_string()],
            OperationType::Mutation,
            Error::Resolver("boom".to_string()),
        ));
        let context = match &error {
            Error::Subgraph(err) => ErrorContext::from(err),
            _ => unreachable!(),
        };

        let first = boundary.transform_error(&error, &context);
        let second = boundary.transform_error(&error, &context);
        assert_eq!(first, second);
        assert_eq!(first.extensions["operationType"], json!("mutation"));
    }

    #[test]
    fn test_transform_error_carries_circuit_details() {
        let boundary = ErrorBoundary::new(config());
        let error = Error::Subgraph(SubgraphError::new(
            "reviews",
            vec![],
            OperationType::Query,
            Error::CircuitOpen(CircuitBreakerError::CircuitOpen {
                service: "reviews".to_string(),
                retry_after: Some(Duration::from_secs(10)),
            }),
        ));

        let transformed = boundary.transform_error(&error, &ErrorContext::default());
        assert_eq!(transformed.code, "SERVICE_UNAVAILABLE");
        assert_eq!(transformed.extensions["retryAfter"], json!(10));
        assert_eq!(transformed.path, None);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_stack_trace_in_debug_builds() {
        let mut config = config();
        config.error_transformation.include_stack_trace = true;
        let boundary = ErrorBoundary::new(config);

        let error = Error::Subgraph(SubgraphError::new(
            "users",
            vec![],
            OperationType::Query,
            Error::Resolver("socket closed".to_string()),
        ));
        let transformed = boundary.transform_error(&error, &ErrorContext::default());
        let trace = transformed.extensions["exception"]["stacktrace"]
            .as_array()
            .unwrap();
        assert!(trace.len() >= 2);
        assert!(trace
            .iter()
            .any(|line| line.as_str().unwrap().contains("socket closed")));
    }

    #[test]
    fn test_merge_json() {
        let mut target = json!({"a": {"b": 1, "c": [1]}, "d": "x"});
        merge_json(&mut target, json!({"a": {"c": [2], "e": true}, "d": null}));
        assert_eq!(target, json!({"a": {"b": 1, "c": [2], "e": true}, "d": null}));
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        assert!(config().default_timeout(Duration::ZERO).validate().is_err());
        assert!(config()
            .subgraph_timeout("users", Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_setters() {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(5),
            half_open_max_calls: 1,
        };
        let config = ErrorBoundaryConfig::default()
            .default_timeout(Duration::from_secs(3))
            .circuit_breaker(breaker.clone())
            .allow_partial_failure(false)
            .sanitize_errors(true);

        assert_eq!(config.default_timeout, Duration::from_secs(3));
        assert_eq!(config.circuit_breaker, breaker);
        assert!(!config.partial_failure.allow_partial_failure);
        assert!(config.error_transformation.sanitize_errors);
        assert!(config.validate().is_ok());

        let boundary = ErrorBoundary::new(config);
        assert_eq!(boundary.timeout_for("users"), Duration::from_secs(3));
    }
}
