//! Error types for the aggregation layer

/// Aggregation layer errors
#[derive(Debug, thiserror::Error)]
pub enum AggError {
    #[error("Invalid aggregation spec: {0}")]
    InvalidAggregationSpec(String),

    #[error("No index metadata registered for entity type: {0}")]
    UnresolvedEntity(String),

    #[error("Aggregation not found in response: {0}")]
    AggregationNotFound(String),

    #[error("Document store communication failed: {0}")]
    EngineCommunication(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AggError {
    /// Elasticsearch-style error type name.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidAggregationSpec(_) => "aggregation_initialization_exception",
            Self::UnresolvedEntity(_) => "illegal_argument_exception",
            Self::AggregationNotFound(_) => "aggregation_execution_exception",
            Self::EngineCommunication(_) => "connect_exception",
            Self::IndexNotFound(_) => "index_not_found_exception",
            Self::InvalidQuery(_) => "query_shard_exception",
            Self::Config(_) => "settings_exception",
            Self::Json(_) => "parse_exception",
        }
    }

    /// Whether a higher layer may retry the same call unchanged.
    ///
    /// Only transport failures qualify; everything else is a caller or
    /// configuration bug, or a response that will not change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::EngineCommunication(_))
    }
}
