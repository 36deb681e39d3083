use thiserror::Error;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum TrellisError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Chain construction errors (rejected before anything is persisted)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Venue rejected an order submission
    #[error("Order submission failed: {0}")]
    Submission(String),

    // Retryable condition; the next reconciliation cycle tries again
    #[error("Transient error: {0}")]
    Transient(String),

    // Chain lock contention for non-blocking callers
    #[error("Conflict: {0}")]
    Conflict(String),

    // Webhook delivery failure; never affects order state
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TrellisError
pub type Result<T> = std::result::Result<T, TrellisError>;

impl TrellisError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TrellisError::Validation(msg.into())
    }

    pub fn submission(msg: impl Into<String>) -> Self {
        TrellisError::Submission(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        TrellisError::Transient(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        TrellisError::Conflict(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        TrellisError::Delivery(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        TrellisError::NotFound(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        TrellisError::Store(msg.into())
    }

    /// Whether the reconciler should swallow this error and retry next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, TrellisError::Transient(_) | TrellisError::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrellisError::validation("bracket requires exactly 3 orders");
        assert_eq!(
            err.to_string(),
            "Validation failed: bracket requires exactly 3 orders"
        );

        let err = TrellisError::InvalidStateTransition {
            from: "FILLED".to_string(),
            to: "ACTIVE".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: from FILLED to ACTIVE"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(TrellisError::transient("venue timeout").is_transient());
        assert!(!TrellisError::validation("bad shape").is_transient());
        assert!(!TrellisError::conflict("chain busy").is_transient());
    }
}
