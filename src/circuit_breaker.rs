//! Circuit Breaker pattern for subgraph resilience
//!
//! The Circuit Breaker prevents cascading failures by "breaking" the circuit when a
//! subgraph is unhealthy. This stops sending requests to failing subgraphs,
//! giving them time to recover.
//!
//! ## States
//!
//! - **Closed**: Normal operation, requests flow through
//! - **Open**: Subgraph unhealthy, requests fail fast without calling it
//! - **Half-Open**: Testing recovery, limited requests allowed through
//!
//! ## How It Works
//!
//! 1. Circuit starts **Closed** - all requests go through
//! 2. Failures accumulate; once `failure_threshold` is reached the circuit **Opens**.
//!    Successes while closed do not clear the count, so intermittent failures still
//!    add up.
//! 3. After `reset_timeout` the *next* call moves the circuit to **Half-Open**
//! 4. If `half_open_max_calls` calls succeed → Circuit **Closes** and the count resets
//! 5. If any half-open call fails → Circuit **Opens** again and the timeout restarts
//!
//! ## Example
//!
//! ```rust,no_run
//! use federation_resilience::{CircuitBreaker, CircuitBreakerConfig, Error};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Error> {
//! let breaker = CircuitBreaker::new("reviews", CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     reset_timeout: Duration::from_secs(30),
//!     half_open_max_calls: 3,
//! });
//!
//! let value = breaker
//!     .protect(|| async { Ok::<_, Error>(serde_json::json!({"reviews": []})) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - requests flow through
    Closed,
    /// Subgraph unhealthy - requests fail fast
    Open,
    /// Testing recovery - limited requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the Circuit Breaker
///
/// # Example
///
/// ```rust
/// use federation_resilience::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig {
///     failure_threshold: 5,                   // Open after 5 failures
///     reset_timeout: Duration::from_secs(30), // Try recovery after 30s
///     half_open_max_calls: 3,                 // Allow 3 test requests
/// };
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait after the last failure before allowing a test call
    pub reset_timeout: Duration,
    /// Calls allowed (and successes required) in Half-Open state
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Check that the thresholds are usable
    pub fn validate(&self) -> crate::Result<()> {
        if self.failure_threshold == 0 {
            return Err(crate::Error::Validation(
                "circuit breaker failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(crate::Error::Validation(
                "circuit breaker half_open_max_calls must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
    pub half_open_call_count: u32,
}

/// Mutable breaker state, only touched under the breaker's lock
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_call_count: u32,
    half_open_successes: u32,
    /// Bumped on every transition; permits from older generations are ignored
    generation: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_call_count: 0,
            half_open_successes: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.half_open_call_count = 0;
        self.half_open_successes = 0;
        self.generation += 1;
    }
}

/// Circuit breaker for a single subgraph
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    /// Subgraph name for logging
    service_name: String,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a subgraph
    pub fn new(service_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::new()),
            service_name: service_name.into(),
        }
    }

    /// Run `operation` if the breaker permits it
    ///
    /// The operation's own result is returned unchanged. If the circuit is open
    /// the operation is never invoked and a [`CircuitBreakerError`] is returned
    /// through `E`.
    pub async fn protect<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitBreakerError>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(err) => {
                permit.record_failure();
                Err(err)
            }
        }
    }

    /// Ask to make one call
    ///
    /// Returns a permit that must be resolved with the call's outcome. An open
    /// circuit whose reset timeout has elapsed moves to half-open here.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitBreakerError> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_time
                .map(|at| Instant::now().saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
            if elapsed < self.config.reset_timeout {
                tracing::debug!(
                    service = %self.service_name,
                    "Circuit breaker OPEN - rejecting request"
                );
                return Err(CircuitBreakerError::CircuitOpen {
                    service: self.service_name.clone(),
                    retry_after: Some(self.config.reset_timeout - elapsed),
                });
            }
            inner.transition(CircuitState::HalfOpen);
            tracing::info!(
                service = %self.service_name,
                "Circuit breaker HALF-OPEN - testing recovery"
            );
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_call_count >= self.config.half_open_max_calls {
                tracing::debug!(
                    service = %self.service_name,
                    "Circuit breaker HALF-OPEN - max test requests reached"
                );
                return Err(CircuitBreakerError::CircuitOpen {
                    service: self.service_name.clone(),
                    retry_after: None,
                });
            }
            inner.half_open_call_count += 1;
            tracing::debug!(
                service = %self.service_name,
                request = inner.half_open_call_count,
                max = self.config.half_open_max_calls,
                "Circuit breaker HALF-OPEN - allowing test request"
            );
        }

        Ok(CallPermit {
            breaker: self,
            generation: inner.generation,
            resolved: false,
        })
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_max_calls {
                inner.failure_count = 0;
                inner.transition(CircuitState::Closed);
                tracing::info!(
                    service = %self.service_name,
                    "Circuit breaker CLOSED - service recovered"
                );
            }
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.last_failure_time = Some(Instant::now());
                    inner.transition(CircuitState::Open);
                    tracing::warn!(
                        service = %self.service_name,
                        failures = inner.failure_count,
                        "Circuit breaker OPENED - too many failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                inner.transition(CircuitState::Open);
                tracing::warn!(
                    service = %self.service_name,
                    "Circuit breaker REOPENED - test request failed"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// A permit was dropped without an outcome (the caller went away)
    fn on_abandoned(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation
            && inner.state == CircuitState::HalfOpen
            && inner.half_open_call_count > 0
        {
            inner.half_open_call_count -= 1;
        }
    }

    /// Get current circuit state
    ///
    /// An open circuit keeps reporting `Open` after its reset timeout until the
    /// next call attempt moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get a snapshot of the breaker
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time,
            failure_threshold: self.config.failure_threshold,
            reset_timeout: self.config.reset_timeout,
            half_open_max_calls: self.config.half_open_max_calls,
            half_open_call_count: inner.half_open_call_count,
        }
    }

    /// Get the subgraph name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Get failure count
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Force reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.transition(CircuitState::Closed);
        tracing::info!(
            service = %self.service_name,
            "Circuit breaker manually RESET"
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service_name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}

/// Admission for a single call through a [`CircuitBreaker`]
///
/// Resolve it with [`CallPermit::record_success`] or [`CallPermit::record_failure`].
/// Dropping it unresolved gives a half-open slot back without counting an outcome.
#[must_use = "the call outcome must be recorded on the permit"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    resolved: bool,
}

impl CallPermit<'_> {
    /// Record that the call succeeded
    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.generation);
    }

    /// Record that the call failed
    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandoned(self.generation);
        }
    }
}

/// Registry of circuit breakers for all subgraphs
///
/// Each subgraph gets its own breaker (and its own lock), so a failing
/// subgraph never serializes traffic to the healthy ones.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a new registry with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use a different configuration for one subgraph
    pub fn with_override(
        mut self,
        subgraph_id: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.overrides.insert(subgraph_id.into(), config);
        self
    }

    /// Get or create a circuit breaker for a subgraph
    pub fn get_or_create(&self, subgraph_id: &str) -> Arc<CircuitBreaker> {
        // Fast path: check if exists
        if let Some(breaker) = self.breakers.read().get(subgraph_id) {
            return breaker.clone();
        }

        // Slow path: create new breaker
        let mut breakers = self.breakers.write();
        breakers
            .entry(subgraph_id.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(subgraph_id)
                    .cloned()
                    .unwrap_or_else(|| self.config.clone());
                Arc::new(CircuitBreaker::new(subgraph_id, config))
            })
            .clone()
    }

    /// Get a circuit breaker for a subgraph (if exists)
    pub fn get(&self, subgraph_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(subgraph_id).cloned()
    }

    /// Get all circuit breakers
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }

    /// Get status of all circuit breakers
    pub fn status(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.state()))
            .collect()
    }

    /// Reset all circuit breakers
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("services", &self.breakers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Shared circuit breaker registry
pub type SharedCircuitBreakerRegistry = Arc<CircuitBreakerRegistry>;

/// Create a new shared circuit breaker registry
pub fn create_circuit_breaker_registry(config: CircuitBreakerConfig) -> SharedCircuitBreakerRegistry {
    Arc::new(CircuitBreakerRegistry::new(config))
}

/// Error types for circuit breaker
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open - subgraph is unavailable
    #[error("Circuit breaker open for service '{service}'. Retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Option<Duration>,
    },
}

impl CircuitBreakerError {
    /// Convert to GraphQL error extensions
    pub fn to_extensions(&self) -> HashMap<String, serde_json::Value> {
        let mut extensions = HashMap::new();
        match self {
            CircuitBreakerError::CircuitOpen { service, retry_after } => {
                extensions.insert("code".to_string(), serde_json::json!("SERVICE_UNAVAILABLE"));
                extensions.insert("service".to_string(), serde_json::json!(service));
                if let Some(retry) = retry_after {
                    extensions.insert("retryAfter".to_string(), serde_json::json!(retry.as_secs()));
                }
            }
        }
        extensions
    }
}
