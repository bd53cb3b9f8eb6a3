//! # federation-resilience
//!
//! Resilience and performance layer for a federated GraphQL gateway: the parts
//! that sit between the gateway's planner and its subgraphs.
//!
//! ## Features
//!
//! - **Circuit Breakers**: Per-subgraph breakers with closed, open and half-open states
//! - **Error Boundaries**: Timeouts, failure tagging and partial results when subgraphs fail
//! - **Query Plan Cache**: Fingerprinted plans in an LRU cache with optional TTL
//! - **Batching**: Per-subgraph [`DataLoader`]s that coalesce entity lookups
//! - **Metrics**: Rolling execution statistics with optional Prometheus export
//! - **Health**: Subgraph health derived from breaker state
//!
//! ## Main Components
//!
//! - [`FederationRuntime`]: Ties every component together for one gateway.
//! - [`FederationRuntimeBuilder`]: Configuration builder for the runtime.
//! - [`ErrorBoundary`]: Wraps subgraph resolvers into [`BoundedResolver`]s.
//! - [`QueryPlanCache`]: Plan cache keyed by operation fingerprint.
//! - [`FederatedDataLoader`]: One [`DataLoader`] per subgraph.
//! - [`MetricsCollector`]: Shared metrics sink.
//!
//! ## Example
//!
//! ```rust,no_run
//! use federation_resilience::{FederationRuntime, PlanFetch, ResolveInfo};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = FederationRuntime::builder()
//!         .subgraph("users", |_info: ResolveInfo| async move {
//!             Ok(serde_json::json!({ "me": { "id": "1", "name": "Ada" } }))
//!         })
//!         .subgraph("reviews", |_info: ResolveInfo| async move {
//!             Ok(serde_json::json!({ "me": { "reviews": [] } }))
//!         })
//!         .critical_subgraph("users")
//!         .build()?;
//!
//!     let result = runtime
//!         .execute("{ me { name reviews { body } } }", None, || async {
//!             Ok(vec![
//!                 PlanFetch::new("users", vec!["me".into()]),
//!                 PlanFetch::new("reviews", vec!["me".into(), "reviews".into()]),
//!             ])
//!         })
//!         .await;
//!
//!     let response = runtime.response(result);
//!     println!("{}", serde_json::to_string(&response)?);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod dataloader;
pub mod error;
pub mod error_boundary;
pub mod health;
pub mod metrics;
pub mod runtime;
pub mod types;

pub use cache::{CacheStats, CachedQueryPlan, QueryPlanCache, QueryPlanCacheConfig};
pub use circuit_breaker::{
    create_circuit_breaker_registry, CallPermit, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
    SharedCircuitBreakerRegistry,
};
pub use config::ResilienceConfig;
pub use dataloader::{
    batch_fn, BatchFn, BatchFuture, BatchWindow, CacheKeyFn, DataLoader, DataLoaderBuilder,
    DataLoaderConfig, DataLoaderStats, FederatedDataLoader, RepresentationKey,
};
pub use error::{Error, GraphQLError, Result, SubgraphError, SubgraphErrorKind};
pub use error_boundary::{
    merge_json, BoundedResolver, ErrorBoundary, ErrorBoundaryConfig, ErrorContext,
    ErrorTransformationConfig, PartialFailureConfig, Resolver,
};
pub use health::{ComponentHealth, HealthResponse, HealthStatus};
pub use metrics::{
    CacheMetrics, CacheOperation, ExecutionMetrics, ExecutionStats, MetricsCollector,
    MetricsConfig, PerformanceMetrics, SharedMetricsCollector,
};
pub use runtime::{FederationRuntime, FederationRuntimeBuilder, PlanFetch, QueryPlan};
pub use types::{
    GraphQLResponse, OperationType, ProcessedResults, ResolveInfo, SubgraphResult,
    SubgraphResults,
};
