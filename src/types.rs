//! Value types shared by the error boundary, the runtime and their callers

use crate::error::{GraphQLError, SubgraphError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// GraphQL operation type (Query, Mutation, or Subscription)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Query => write!(f, "query"),
            OperationType::Mutation => write!(f, "mutation"),
            OperationType::Subscription => write!(f, "subscription"),
        }
    }
}

impl OperationType {
    /// Detect the operation type from a GraphQL document
    ///
    /// Only looks at the leading keyword; anonymous `{ ... }` documents are queries.
    pub fn detect(document: &str) -> Self {
        let trimmed = document.trim_start();
        if trimmed.starts_with("mutation") {
            OperationType::Mutation
        } else if trimmed.starts_with("subscription") {
            OperationType::Subscription
        } else {
            OperationType::Query
        }
    }
}

/// What a resolver is being asked to resolve
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveInfo {
    /// Response path of the field, e.g. `["me", "reviews"]`
    pub path: Vec<String>,
    /// Type of the operation the field belongs to
    pub operation_type: OperationType,
    /// Subgraph operation text, as produced by the planner
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,
    /// Variables forwarded to the subgraph
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub variables: serde_json::Value,
}

impl ResolveInfo {
    /// Create resolve info for a field path
    pub fn new(path: Vec<String>, operation_type: OperationType) -> Self {
        Self {
            path,
            operation_type,
            ..Default::default()
        }
    }

    /// Set the subgraph operation text
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Set the variables
    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }
}

/// Outcome of one subgraph call for one operation
#[derive(Debug)]
pub struct SubgraphResult {
    subgraph_id: String,
    data: Option<serde_json::Value>,
    error: Option<SubgraphError>,
}

impl SubgraphResult {
    /// Successful subgraph result
    pub fn success(subgraph_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            subgraph_id: subgraph_id.into(),
            data: Some(data),
            error: None,
        }
    }

    /// Failed subgraph result
    pub fn failure(subgraph_id: impl Into<String>, error: SubgraphError) -> Self {
        Self {
            subgraph_id: subgraph_id.into(),
            data: None,
            error: Some(error),
        }
    }

    pub fn subgraph_id(&self) -> &str {
        &self.subgraph_id
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&SubgraphError> {
        self.error.as_ref()
    }

    /// Consume the result, yielding its data or its error
    pub fn into_outcome(self) -> Result<serde_json::Value, SubgraphError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.data.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// One result per subgraph, keyed by subgraph id
///
/// Ordered by id so that merging is deterministic regardless of arrival order.
pub type SubgraphResults = BTreeMap<String, SubgraphResult>;

/// Data and errors of an operation after partial-failure handling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResults {
    pub data: serde_json::Value,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

impl ProcessedResults {
    /// Whether any subgraph failed
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// GraphQL response to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// Response data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Errors if any
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    /// Create a successful response
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Create an error response
    pub fn error(error: GraphQLError) -> Self {
        Self {
            data: None,
            errors: vec![error],
        }
    }
}

impl From<ProcessedResults> for GraphQLResponse {
    fn from(results: ProcessedResults) -> Self {
        Self {
            data: Some(results.data),
            errors: results.errors,
        }
    }
}
