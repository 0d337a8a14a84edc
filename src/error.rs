//! Error types for sciforge operations.
//!
//! Defines error types for the major subsystems:
//! - Blob persistence (memory and Redis stores)
//! - LLM API interactions
//! - Engine configuration
//! - Artifact production by capability backends
//! - Artifact execution under resource limits

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in a blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Blob '{0}' not found")]
    NotFound(String),

    #[error("Failed to decode blob '{key}': {reason}")]
    Decode { key: String, reason: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: SCIFORGE_LLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Whether the failure is a transport-level problem rather than a bad answer.
    ///
    /// Transport failures mean the backend is unavailable; a parse failure means
    /// the backend answered but the answer cannot be used.
    pub fn is_transport(&self) -> bool {
        !matches!(self, LlmError::ParseError(_))
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors a capability backend can return instead of an artifact.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// The backend does not cover this task shape or parameter set.
    #[error("Task not supported by backend: {0}")]
    Unsupported(String),

    /// The backend cannot be reached (network down, no credentials, ...).
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but produced no usable artifact.
    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    /// The backend did not answer within its deadline.
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled by the supervisor.
    #[error("Backend call cancelled")]
    Cancelled,
}

impl BackendError {
    /// Whether this backend should be skipped for the rest of the task.
    pub fn disables_backend(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Unsupported(_))
    }
}

/// Errors raised while interpreting an artifact against data.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Column '{column}' is not numeric: {detail}")]
    NotNumeric { column: String, detail: String },

    #[error("Invalid step parameters: {0}")]
    InvalidStep(String),

    #[error("Capability '{0}' is not available inside the executor")]
    CapabilityDenied(String),

    #[error("Memory ceiling exceeded: ~{used} bytes > {limit} bytes")]
    MemoryExceeded { used: usize, limit: usize },

    #[error("Row ceiling exceeded: {rows} rows > {limit}")]
    RowLimitExceeded { rows: usize, limit: usize },

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Artifact panicked: {0}")]
    Panicked(String),

    #[error("Input data unavailable: {0}")]
    InputUnavailable(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        ExecutionError::InputUnavailable(err.to_string())
    }
}
