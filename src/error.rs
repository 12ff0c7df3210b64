use thiserror::Error;

/// Main error type for the Crucible runtime
#[derive(Error, Debug, Clone)]
pub enum CrucibleError {
    /// Programmer error: the engine API was used incorrectly (fatal, not retried)
    #[error("Usage error: {0}")]
    UsageError(String),

    /// The recorded computation graph cannot satisfy the request
    #[error("Graph error: {0}")]
    GraphError(String),

    /// Propagated unchanged from a compute backend
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Shape-related errors
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Unsupported operation errors
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal errors that shouldn't happen
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CrucibleError {
    /// Create a usage error tagged with the operation that detected it
    pub fn usage(operation: &str, message: &str) -> Self {
        CrucibleError::UsageError(format!("{}: {}", operation, message))
    }

    /// Create a graph error tagged with the operation that detected it
    pub fn graph(operation: &str, message: &str) -> Self {
        CrucibleError::GraphError(format!("{}: {}", operation, message))
    }

    /// Create a backend error with the backend name as context
    pub fn backend(backend: &str, message: &str) -> Self {
        CrucibleError::BackendError(format!("backend '{}': {}", backend, message))
    }

    /// Create a shape error with expected/actual details
    pub fn shape(operation: &str, expected: &str, got: &str) -> Self {
        CrucibleError::ShapeError(format!(
            "{}: expected {}, got {}",
            operation, expected, got
        ))
    }
}

impl From<serde_json::Error> for CrucibleError {
    fn from(err: serde_json::Error) -> Self {
        CrucibleError::SerializationError(err.to_string())
    }
}

/// Result type for Crucible operations
pub type CrucibleResult<T> = Result<T, CrucibleError>;
