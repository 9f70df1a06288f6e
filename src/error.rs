//! Error types for the inbox classifier.

use std::time::Duration;

/// Top-level error type for startup and batch entry points.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Taxonomy error: {0}")]
    Taxonomy(#[from] TaxonomyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),
}

/// Configuration-related errors. Raised at startup only.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Taxonomy load and lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum TaxonomyError {
    #[error("Failed to read taxonomy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse taxonomy JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Taxonomy has no centroid labels")]
    Empty,

    #[error("Taxonomy centroid labels and vectors are inconsistent: {labels} labels, {vectors} vectors")]
    CountMismatch { labels: usize, vectors: usize },

    #[error("Centroid {index} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("Centroid {index} contains a non-finite value")]
    NonFinite { index: usize },

    #[error("Taxonomy centroids must come from exactly one of `vectors` or `file`")]
    CentroidSource,

    #[error("Query embedding has dimension {found}, taxonomy expects {expected}")]
    QueryDimension { expected: usize, found: usize },
}

/// Blob storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The referenced object does not exist. Never resolved by retrying.
    #[error("Blob not found: {container}/{key}")]
    NotFound { container: String, key: String },

    #[error("Blob already exists: {container}/{key}")]
    AlreadyExists { container: String, key: String },

    #[error("Storage backend failure on {container}/{key}: {reason}")]
    Backend {
        container: String,
        key: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Queue transport errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue {queue} acknowledge failed for message {id}: {reason}")]
    AcknowledgeFailed {
        queue: String,
        id: String,
        reason: String,
    },

    #[error("Queue {queue} send failed: {reason}")]
    SendFailed { queue: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Embedding and classification model errors.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Embedding request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Invalid embedding response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Classifier error: {0}")]
    Classifier(#[from] TaxonomyError),
}

/// Inbound payload schema or invariant violations.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Field `{field}` must be a non-empty string")]
    EmptyField { field: &'static str },

    #[error("recipients must contain at least one email address")]
    NoRecipients,

    #[error("Either `conversation_id` or `thread_id` must be provided")]
    MissingThreadIdentifier,

    #[error("Payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("Unrecognized queue message: {0}")]
    UnrecognizedMessage(String),
}

/// Golden-set evaluation errors.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Failed to read golden set {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid golden set row at line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Embedding failed during evaluation: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
