use thiserror::Error;

/// Main error type for the monitoring agent
///
/// These errors stay inside the agent: the interception path never
/// surfaces them to the host application.
#[derive(Error, Debug)]
pub enum AgentError {
    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Emission errors
    #[error("Collector queue closed")]
    CollectorClosed,

    #[error("Sink delivery failed: {0}")]
    Delivery(String),

    #[error("Shutdown timed out after {elapsed_ms}ms")]
    ShutdownTimeout { elapsed_ms: u64 },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for AgentError
pub type Result<T> = std::result::Result<T, AgentError>;
