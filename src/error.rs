use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-level error taxonomy. Spam and routing failures degrade to
/// safe defaults before they surface; only `Consistency` is fatal to
/// the operation that produced it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed rule or configuration, rejected before use.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Queue full or no eligible agent. Resolved via fallback policy,
    /// never surfaced to the caller as a hard failure.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// Carrier or AI collaborator timeout/fault.
    #[error("external service failure: {0}")]
    ExternalService(String),

    /// Attempted transition from an unexpected prior state. Accepting
    /// it would corrupt the audit trail, so the operation is rejected.
    #[error("inconsistent state: expected {expected}, found {actual}")]
    Consistency { expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn invalid_rule(msg: impl Into<String>) -> Self {
        EngineError::Validation(format!("invalid spam rule: {}", msg.into()))
    }
}
