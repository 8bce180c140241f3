use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every colony component.
///
/// Storage and engine crates return `anyhow::Result` and wrap these values,
/// so callers recover the kind with [`ErrorEnvelope::from_anyhow`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ColonyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("corrupt record: {0}")]
    Corruption(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage write failed: {0}")]
    Storage(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl ColonyError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Corruption(_) => ErrorKind::Corruption,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Corruption,
    Conflict,
    NotFound,
    InvalidTransition,
    Storage,
    Execution,
    Timeout,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Corruption => "corruption_error",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::InvalidTransition => "invalid_transition",
            Self::Storage => "storage_write_error",
            Self::Execution => "execution_error",
            Self::Timeout => "timeout",
            Self::Internal => "internal_error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "validation_error" => Some(Self::Validation),
            "corruption_error" => Some(Self::Corruption),
            "conflict" => Some(Self::Conflict),
            "not_found" => Some(Self::NotFound),
            "invalid_transition" => Some(Self::InvalidTransition),
            "storage_write_error" => Some(Self::Storage),
            "execution_error" => Some(Self::Execution),
            "timeout" => Some(Self::Timeout),
            "internal_error" => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Structured error result handed across process boundaries instead of a panic
/// or an opaque message.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.as_str().to_string(),
            message: message.into(),
        }
    }

    /// Classify an `anyhow` chain, falling back to `internal_error` when no
    /// [`ColonyError`] is attached.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let kind = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<ColonyError>())
            .map_or(ErrorKind::Internal, ColonyError::kind);
        Self::new(kind, format!("{err:#}"))
    }
}

impl From<&ColonyError> for ErrorEnvelope {
    fn from(value: &ColonyError) -> Self {
        Self::new(value.kind(), value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{ColonyError, ErrorEnvelope, ErrorKind};
    use anyhow::Context;

    #[test]
    fn envelope_recovers_kind_through_context() {
        let result: anyhow::Result<()> = Err(ColonyError::Validation("bad id".to_string()))
            .context("failed to register agent");
        let err = match result {
            Ok(()) => unreachable!(),
            Err(err) => err,
        };
        let envelope = ErrorEnvelope::from_anyhow(&err);
        assert_eq!(envelope.kind, ErrorKind::Validation);
        assert_eq!(envelope.code, "validation_error");
        assert!(envelope.message.contains("bad id"));
    }

    #[test]
    fn untyped_errors_are_internal() {
        let err = anyhow::anyhow!("disk on fire");
        assert_eq!(ErrorEnvelope::from_anyhow(&err).kind, ErrorKind::Internal);
    }
}
