use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid funnel: {0}")]
    InvalidFunnel(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid item: {0}")]
    InvalidItem(String),
}

/// Errors reported by the store and queue seams.
///
/// Retry eligibility is an allow-list: only the four transport conditions
/// below are considered transient. Anything else, including errors this
/// crate does not recognise, is surfaced on the first failure.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("provisioned throughput exceeded: {0}")]
    ThroughputExceeded(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error: {0}")]
    InternalServerError(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::ThroughputExceeded(_)
                | BackendError::Throttled(_)
                | BackendError::ServiceUnavailable(_)
                | BackendError::InternalServerError(_)
        )
    }

    /// Stable short code used in structured logs and batch-send failure
    /// reports.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::ThroughputExceeded(_) => "throughput_exceeded",
            BackendError::Throttled(_) => "throttled",
            BackendError::ServiceUnavailable(_) => "service_unavailable",
            BackendError::InternalServerError(_) => "internal_server_error",
            BackendError::Validation(_) => "validation",
            BackendError::Serialization(_) => "serialization",
            BackendError::NotFound(_) => "not_found",
            BackendError::Other(_) => "other",
        }
    }
}
