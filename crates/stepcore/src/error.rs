use thiserror::Error;

/// Failure of a single step handler invocation.
///
/// Cloneable: a failure lands in both the event tap and the per-subscriber
/// outcome list of a fan-out round.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the failure was caused by the caller's input rather than the handler.
    pub fn is_client_error(&self) -> bool {
        matches!(self, StepError::MissingInput(_) | StepError::InvalidInput(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),
}
