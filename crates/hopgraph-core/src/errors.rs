use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("schema not found: {0}")]
    SchemaNotFound(String),
    #[error("no relationship path from {from} to {to}")]
    PathNotFound { from: String, to: String },
    #[error("unauthorized access to {collection}: {rejected} id(s) outside tenant {tenant}")]
    UnauthorizedAccess {
        collection: String,
        tenant: String,
        rejected: usize,
    },
    #[error("invalid filter value for {field}: {reason}")]
    InvalidFilterValue { field: String, reason: String },
    #[error("search failed on {collection}: {reason}")]
    SearchExecutionFailure { collection: String, reason: String },
    #[error("index unavailable on {collection}: {kind}")]
    IndexUnavailable { collection: String, kind: String },
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("collaborator failed: {0}")]
    Collaborator(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn search(collection: &str, reason: impl ToString) -> Self {
        EngineError::SearchExecutionFailure {
            collection: collection.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that should abort the process rather than degrade a request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
