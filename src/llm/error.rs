//! LLM error types

use std::fmt;
use thiserror::Error;

/// Failure of one model call
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Transport failure, timeout, rate limit or 5xx
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Unavailable, message)
    }

    /// The provider refused the call: bad credentials or a bad request
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Rejected, message)
    }

    /// The provider answered, but not in the shape we asked for
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Malformed, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Unavailable,
    Rejected,
    Malformed,
}

impl LlmErrorKind {
    /// Likely to clear up on its own; anything else needs configuration or code changes
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
            Self::Malformed => "malformed",
        })
    }
}
