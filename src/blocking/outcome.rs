//! Classified attempt outcomes.
//!
//! A session attempt ends in exactly one of three states. The classification
//! is decided once, where the signal is observed, and carried unchanged up to
//! the retry controller and the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reason the remote site rejected or challenged an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    Captcha,
    RateLimited,
    AccessDenied,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::Captcha => "captcha",
            BlockReason::RateLimited => "rate_limited",
            BlockReason::AccessDenied => "access_denied",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause of an ordinary, non-blocking failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransientCause {
    NetworkTimeout,
    EmptyPayload,
    SessionUnavailable,
    Unknown,
}

impl TransientCause {
    pub fn as_str(self) -> &'static str {
        match self {
            TransientCause::NetworkTimeout => "network_timeout",
            TransientCause::EmptyPayload => "empty_payload",
            TransientCause::SessionUnavailable => "session_unavailable",
            TransientCause::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransientCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient failure together with a human-readable explanation.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientFailure {
    pub cause: TransientCause,
    pub message: String,
}

impl TransientFailure {
    pub fn new(cause: TransientCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransientFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.cause, self.message)
    }
}

/// The two API payloads captured while the product page renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    pub product_detail: Value,
    pub benefits: Value,
}

/// Result of a single session attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(ProductPayload),
    Blocked(BlockReason),
    Transient(TransientFailure),
}

impl AttemptOutcome {
    pub fn transient(cause: TransientCause, message: impl Into<String>) -> Self {
        AttemptOutcome::Transient(TransientFailure::new(cause, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }

    /// Metric/log tag for failed outcomes.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            AttemptOutcome::Success(_) => None,
            AttemptOutcome::Blocked(reason) => Some(reason.as_str()),
            AttemptOutcome::Transient(failure) => Some(failure.cause.as_str()),
        }
    }
}

/// Coarse classification surfaced on the final error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Blocked(BlockReason),
    Transient(TransientCause),
    Shutdown,
    InvalidInput,
}

impl FailureClass {
    pub fn is_blocked(self) -> bool {
        matches!(self, FailureClass::Blocked(_))
    }
}
