//! Aggregate configuration for the resilience layer
//!
//! Every component has its own config struct next to its implementation;
//! [`ResilienceConfig`] bundles them so a whole runtime can be described (and
//! deserialized) as one value. Loading the value from files or the environment
//! is left to the embedding application.
//!
//! # Example
//!
//! ```rust
//! use federation_resilience::ResilienceConfig;
//!
//! let config: ResilienceConfig = serde_json::from_str(r#"{
//!     "query_plan_cache": { "max_size": 500 },
//!     "data_loader": { "max_batch_size": 50 }
//! }"#).unwrap();
//!
//! assert_eq!(config.query_plan_cache.max_size, 500);
//! assert!(config.validate().is_ok());
//! ```

use crate::cache::QueryPlanCacheConfig;
use crate::dataloader::DataLoaderConfig;
use crate::error_boundary::{ErrorBoundaryConfig, ErrorTransformationConfig};
use crate::metrics::MetricsConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of every resilience component
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Timeouts, circuit breakers, partial failure and error presentation
    pub error_boundary: ErrorBoundaryConfig,
    pub query_plan_cache: QueryPlanCacheConfig,
    pub data_loader: DataLoaderConfig,
    pub metrics: MetricsConfig,
}

impl ResilienceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Production preset: sanitized errors, large long-lived plan cache
    pub fn production() -> Self {
        let mut config = Self::default();
        config.error_boundary.error_transformation = ErrorTransformationConfig {
            sanitize_errors: true,
            include_stack_trace: false,
        };
        config.query_plan_cache = QueryPlanCacheConfig {
            max_size: 10_000,
            ttl: Some(Duration::from_secs(3600)),
        };
        config
    }

    /// Development preset: full error details, short-lived plans
    pub fn development() -> Self {
        let mut config = Self::default();
        config.error_boundary.error_transformation = ErrorTransformationConfig {
            sanitize_errors: false,
            include_stack_trace: true,
        };
        config.query_plan_cache.ttl = Some(Duration::from_secs(60));
        config
    }

    /// Validate every component configuration
    pub fn validate(&self) -> Result<()> {
        self.error_boundary.validate()?;
        self.query_plan_cache.validate()?;
        self.data_loader.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataloader::BatchWindow;
    use crate::Error;

    #[test]
    fn test_default_is_valid() {
        assert!(ResilienceConfig::default().validate().is_ok());
        assert!(ResilienceConfig::production().validate().is_ok());
        assert!(ResilienceConfig::development().validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let production = ResilienceConfig::production();
        assert!(production.error_boundary.error_transformation.sanitize_errors);
        assert_eq!(production.query_plan_cache.max_size, 10_000);

        let development = ResilienceConfig::development();
        assert!(!development.error_boundary.error_transformation.sanitize_errors);
        assert!(development.error_boundary.error_transformation.include_stack_trace);
    }

    #[test]
    fn test_validation_reports_the_broken_component() {
        let mut config = ResilienceConfig::default();
        config.data_loader.max_batch_size = 0;
        match config.validate() {
            Err(Error::Validation(message)) => assert!(message.contains("max_batch_size")),
            other => panic!("unexpected result {other:?}"),
        }

        let mut config = ResilienceConfig::default();
        config.error_boundary.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ResilienceConfig = serde_json::from_value(serde_json::json!({
            "error_boundary": {
                "subgraph_timeouts": { "reviews": { "secs": 2, "nanos": 0 } },
                "partial_failure": {
                    "critical_subgraphs": ["accounts"],
                    "fallback_values": { "reviews": { "reviews": [] } }
                }
            },
            "data_loader": { "batch_window": { "delay": { "secs": 0, "nanos": 5000000 } } },
            "metrics": { "window_size": 100 }
        }))
        .unwrap();

        assert_eq!(
            config.error_boundary.subgraph_timeouts["reviews"],
            Duration::from_secs(2)
        );
        assert!(config
            .error_boundary
            .partial_failure
            .critical_subgraphs
            .contains("accounts"));
        assert!(config.error_boundary.partial_failure.allow_partial_failure);
        assert_eq!(
            config.data_loader.batch_window,
            BatchWindow::Delay(Duration::from_millis(5))
        );
        assert_eq!(config.data_loader.max_batch_size, 100);
        assert_eq!(config.metrics.window_size, 100);
        assert!(config.metrics.enabled);
    }
}
