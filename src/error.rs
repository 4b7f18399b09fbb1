//! Error types for the scan pipeline.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Ledger persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Classification backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Side-effect failures. Every variant leaves the message staged for retry.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("LMTP connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("LMTP temporary failure at {stage}: {code} {message}")]
    Temporary {
        stage: &'static str,
        code: u16,
        message: String,
    },

    #[error("LMTP permanent failure at {stage}: {code} {message}")]
    Permanent {
        stage: &'static str,
        code: u16,
        message: String,
    },

    #[error("LMTP protocol error at {stage}: {reason}")]
    Protocol { stage: &'static str, reason: String },

    #[error("LMTP I/O timed out after {0:?}")]
    Timeout(Duration),

    #[error("Quarantine move failed for {id}: {reason}")]
    Quarantine { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    /// Whether the mail store rejected the message outright (5xx).
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Staging-area errors.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Malformed staging filename: {0}")]
    MalformedName(String),

    #[error("Staged artifact {0} vanished")]
    Vanished(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
