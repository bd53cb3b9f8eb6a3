//! Error types for the federation resilience layer

use crate::circuit_breaker::CircuitBreakerError;
use crate::types::OperationType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the resilience layer
///
/// Subgraph-local failures are normally folded into [`crate::ProcessedResults`]
/// by the error boundary. The variants that reach a caller directly are the
/// hard failures: a critical subgraph failing, partial failure being disabled,
/// or a configuration that does not validate.
#[derive(Error, Debug)]
pub enum Error {
    /// The subgraph's circuit breaker rejected the call without attempting it
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerError),

    /// A subgraph call exceeded its configured timeout
    #[error("Subgraph '{subgraph_id}' timed out after {timeout:?}")]
    Timeout {
        subgraph_id: String,
        timeout: Duration,
    },

    /// Malformed configuration
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// A failure attributed to one subgraph, tagged by the error boundary
    #[error(transparent)]
    Subgraph(#[from] SubgraphError),

    /// Some subgraphs failed and partial results are not allowed
    #[error("Partial failure is disabled; failed subgraphs: {}", .subgraphs.join(", "))]
    PartialFailureDisabled { subgraphs: Vec<String> },

    /// A subgraph marked critical failed, so the whole operation fails
    #[error("Critical subgraph failed: {}", .subgraphs.join(", "))]
    CriticalSubgraphFailed { subgraphs: Vec<String> },

    /// A DataLoader batch (or a single key of it) failed
    #[error("Batch load failed for subgraph '{subgraph_id}': {source}")]
    BatchLoad {
        subgraph_id: String,
        #[source]
        source: Arc<Error>,
    },

    /// Error reported by a downstream resolver
    #[error("Resolver error: {0}")]
    Resolver(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Prometheus registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Any other error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Stable, machine readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::CircuitOpen(_) => "SERVICE_UNAVAILABLE",
            Error::Timeout { .. } => "SUBGRAPH_TIMEOUT",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Subgraph(err) => err.kind.code(),
            Error::PartialFailureDisabled { .. } => "PARTIAL_FAILURE_DISABLED",
            Error::CriticalSubgraphFailed { .. } => "CRITICAL_SUBGRAPH_FAILED",
            Error::BatchLoad { .. } => "BATCH_LOAD_ERROR",
            Error::Resolver(_) => "RESOLVER_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Metrics(_) => "METRICS_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// Message that is safe to show to clients in production
    ///
    /// Only errors produced by this layer itself keep their text; anything
    /// that may carry downstream details is replaced by a generic message.
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::CircuitOpen(_) => "Service temporarily unavailable".to_string(),
            Error::Timeout { .. } => "Service did not respond in time".to_string(),
            Error::Validation(msg) => format!("Invalid configuration: {}", msg),
            Error::Subgraph(err) => err.kind.sanitized_message().to_string(),
            Error::PartialFailureDisabled { .. } | Error::CriticalSubgraphFailed { .. } => {
                "Operation failed".to_string()
            }
            Error::BatchLoad { .. } => "Failed to load entities".to_string(),
            Error::Resolver(_) => "Backend service error".to_string(),
            Error::Serialization(_) => "Data processing error".to_string(),
            Error::Metrics(_) | Error::Internal(_) => "Internal server error".to_string(),
            Error::Other(_) => "An unexpected error occurred".to_string(),
        }
    }

    /// Convert error to GraphQL error format
    ///
    /// # Security
    ///
    /// In production (ENV=production), internal error details are sanitized
    /// to prevent information disclosure.
    pub fn to_graphql_error(&self) -> GraphQLError {
        let message = if is_production() {
            self.sanitized_message()
        } else {
            self.to_string()
        };

        let mut extensions = HashMap::new();
        if let Error::CircuitOpen(err) = self {
            extensions.extend(err.to_extensions());
        }

        GraphQLError {
            message,
            code: self.code().to_string(),
            path: self.path().map(<[String]>::to_vec),
            extensions,
        }
    }

    /// Field path carried by the error, if any
    pub fn path(&self) -> Option<&[String]> {
        match self {
            Error::Subgraph(err) if !err.path.is_empty() => Some(err.path.as_slice()),
            _ => None,
        }
    }

    /// Subgraph the error is attributed to, if any
    pub fn subgraph_id(&self) -> Option<&str> {
        match self {
            Error::CircuitOpen(CircuitBreakerError::CircuitOpen { service, .. }) => {
                Some(service.as_str())
            }
            Error::Timeout { subgraph_id, .. } | Error::BatchLoad { subgraph_id, .. } => {
                Some(subgraph_id.as_str())
            }
            Error::Subgraph(err) => Some(err.subgraph_id.as_str()),
            _ => None,
        }
    }
}

/// Whether the process runs in production mode (`ENV=production` or `ENV=prod`)
pub fn is_production() -> bool {
    std::env::var("ENV")
        .map(|e| e == "production" || e == "prod")
        .unwrap_or(false)
}

/// Why a subgraph call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubgraphErrorKind {
    /// The call exceeded its timeout
    Timeout,
    /// The circuit breaker rejected the call
    CircuitOpen,
    /// The subgraph (or its transport) returned an error
    Downstream,
}

impl SubgraphErrorKind {
    fn code(self) -> &'static str {
        match self {
            SubgraphErrorKind::Timeout => "SUBGRAPH_TIMEOUT",
            SubgraphErrorKind::CircuitOpen => "SERVICE_UNAVAILABLE",
            SubgraphErrorKind::Downstream => "SUBGRAPH_ERROR",
        }
    }

    fn sanitized_message(self) -> &'static str {
        match self {
            SubgraphErrorKind::Timeout => "Service did not respond in time",
            SubgraphErrorKind::CircuitOpen => "Service temporarily unavailable",
            SubgraphErrorKind::Downstream => "Backend service error",
        }
    }
}

/// A failure attributed to a single subgraph call
///
/// Produced by [`crate::BoundedResolver`] so that callers see which subgraph,
/// field and operation failed instead of the raw transport error. The raw
/// cause is kept for logging and debug output only.
#[derive(Error, Debug)]
#[error("Subgraph '{subgraph_id}' failed ({operation_type} at {}): {message}", display_path(.path))]
pub struct SubgraphError {
    pub subgraph_id: String,
    pub path: Vec<String>,
    pub operation_type: OperationType,
    /// Milliseconds since the UNIX epoch
    pub timestamp: u64,
    pub kind: SubgraphErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<Error>>,
}

impl SubgraphError {
    /// Tag `cause` with the subgraph and resolver context it happened in
    pub fn new(
        subgraph_id: impl Into<String>,
        path: Vec<String>,
        operation_type: OperationType,
        cause: Error,
    ) -> Self {
        let kind = match &cause {
            Error::Timeout { .. } => SubgraphErrorKind::Timeout,
            Error::CircuitOpen(_) => SubgraphErrorKind::CircuitOpen,
            _ => SubgraphErrorKind::Downstream,
        };
        Self {
            subgraph_id: subgraph_id.into(),
            path,
            operation_type,
            timestamp: now_millis(),
            kind,
            message: cause.to_string(),
            cause: Some(Box::new(cause)),
        }
    }
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// GraphQL error response format
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphQLError {
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<Vec<String>>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl From<Error> for GraphQLError {
    fn from(err: Error) -> Self {
        err.to_graphql_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn downstream(path: &[&str]) -> Error {
        Error::Subgraph(SubgraphError::new(
            "products",
            path.iter().map(|s| s.to_string()).collect(),
            OperationType::Query,
            Error::Resolver("connection reset by peer".to_string()),
        ))
    }

    #[test]
    fn test_error_display() {
        let err = Error::Validation("max_size must be greater than 0".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_size must be greater than 0"
        );

        let err = Error::Timeout {
            subgraph_id: "users".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Subgraph 'users' timed out after 250ms");

        let err = Error::CriticalSubgraphFailed {
            subgraphs: vec!["accounts".to_string(), "billing".to_string()],
        };
        assert_eq!(err.to_string(), "Critical subgraph failed: accounts, billing");
    }

    #[test]
    fn test_subgraph_error_display_and_tags() {
        let err = downstream(&["topProducts", "price"]);
        assert!(err
            .to_string()
            .starts_with("Subgraph 'products' failed (query at topProducts.price)"));
        assert_eq!(err.code(), "SUBGRAPH_ERROR");
        assert_eq!(err.subgraph_id(), Some("products"));
        assert_eq!(
            err.path(),
            Some(&["topProducts".to_string(), "price".to_string()][..])
        );

        match &err {
            Error::Subgraph(inner) => {
                assert_eq!(inner.kind, SubgraphErrorKind::Downstream);
                assert!(inner.timestamp > 0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_subgraph_error_kind_from_cause() {
        let err = SubgraphError::new(
            "users",
            vec![],
            OperationType::Query,
            Error::Timeout {
                subgraph_id: "users".to_string(),
                timeout: Duration::from_secs(1),
            },
        );
        assert_eq!(err.kind, SubgraphErrorKind::Timeout);
        assert_eq!(Error::from(err).code(), "SUBGRAPH_TIMEOUT");
    }

    #[test]
    fn test_graphql_error_conversion_development() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("ENV");

        let err = Error::Internal("database connection failed".to_string());
        let gql_err = err.to_graphql_error();
        assert_eq!(gql_err.message, "Internal error: database connection failed");
        assert_eq!(gql_err.code, "INTERNAL_ERROR");
    }

    #[test]
    fn test_graphql_error_conversion_production_sanitized() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("ENV", "production");

        let gql_err = downstream(&["me"]).to_graphql_error();
        assert_eq!(gql_err.message, "Backend service error");
        assert!(!gql_err.message.contains("connection reset"));
        assert_eq!(gql_err.path, Some(vec!["me".to_string()]));

        std::env::remove_var("ENV");
    }

    #[test]
    fn test_circuit_open_extensions_carried() {
        let err = Error::CircuitOpen(CircuitBreakerError::CircuitOpen {
            service: "reviews".to_string(),
            retry_after: Some(Duration::from_secs(12)),
        });
        let gql_err = err.to_graphql_error();
        assert_eq!(gql_err.code, "SERVICE_UNAVAILABLE");
        assert_eq!(
            gql_err.extensions.get("service"),
            Some(&serde_json::json!("reviews"))
        );
        assert_eq!(
            gql_err.extensions.get("retryAfter"),
            Some(&serde_json::json!(12))
        );
    }

    #[test]
    fn test_graphql_error_serialization_skips_empty_fields() {
        let gql_err = GraphQLError {
            message: "Test".to_string(),
            code: "TEST".to_string(),
            path: None,
            extensions: HashMap::new(),
        };

        let json = serde_json::to_string(&gql_err).unwrap();
        assert!(!json.contains("extensions"));
        assert!(!json.contains("path"));

        let back: GraphQLError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, gql_err);
    }

    #[test]
    fn test_batch_load_error_keeps_source() {
        let source = Arc::new(Error::Resolver("upstream 502".to_string()));
        let err = Error::BatchLoad {
            subgraph_id: "inventory".to_string(),
            source,
        };
        assert_eq!(err.code(), "BATCH_LOAD_ERROR");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.subgraph_id(), Some("inventory"));
    }
}
