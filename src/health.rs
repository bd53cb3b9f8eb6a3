//! Subgraph health derived from circuit breaker state.
//!
//! A subgraph is `healthy` while its breaker is closed, `degraded` while the
//! breaker is probing recovery (half-open) and `unhealthy` while it is open.
//! The overall status is the worst status of any subgraph.
//!
//! # Example
//!
//! ```rust
//! use federation_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, HealthResponse, HealthStatus};
//!
//! let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
//! registry.get_or_create("users");
//!
//! let health = HealthResponse::from_registry(&registry);
//! assert_eq!(health.status, HealthStatus::Healthy);
//! ```

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall health status
    pub status: HealthStatus,
    /// Individual subgraph checks
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub checks: Vec<ComponentHealth>,
}

/// Health status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl From<CircuitState> for HealthStatus {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Open => HealthStatus::Unhealthy,
        }
    }
}

/// Health of one subgraph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Subgraph id
    pub name: String,
    pub status: HealthStatus,
    /// Breaker state and failure count, for operators
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthResponse {
    /// Create a healthy response
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Add a component check; the overall status only ever gets worse
    pub fn with_check(mut self, check: ComponentHealth) -> Self {
        self.status = self.status.max(check.status);
        self.checks.push(check);
        self
    }

    /// Health of every subgraph known to `registry`, ordered by subgraph id
    pub fn from_registry(registry: &CircuitBreakerRegistry) -> Self {
        let mut breakers = registry.all();
        breakers.sort_by(|a, b| a.service_name().cmp(b.service_name()));

        breakers.into_iter().fold(Self::healthy(), |response, breaker| {
            let snapshot = breaker.snapshot();
            response.with_check(ComponentHealth {
                name: breaker.service_name().to_string(),
                status: snapshot.state.into(),
                message: Some(format!(
                    "circuit {} ({} failures)",
                    snapshot.state, snapshot.failure_count
                )),
            })
        })
    }
}
