//! Error types for Verimail
//!
//! Provides the error surface returned to callers of the verification
//! service. Variants that could reveal whether a token, user or address
//! exists carry no detail in their `Display` output.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using VerificationError
pub type Result<T> = std::result::Result<T, VerificationError>;

/// Unified error type for verification operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Unknown, expired, malformed, user missing or email changed
    #[error("Verification token is invalid or has expired")]
    InvalidOrExpired,

    #[error("Too many verification requests, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("A verification email was sent recently, check your inbox")]
    TooSoon { retry_after: Duration },

    #[error("Email address is already verified")]
    AlreadyVerified,

    /// The user update failed after a successful claim. `forfeited` tells
    /// the caller to request a new token instead of retrying this one.
    #[error("Verification could not be completed, please try again")]
    InternalRetryable { forfeited: bool },

    // Detail is kept for logs only
    #[error("Verification store unavailable")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Stable, machine-readable error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidOrExpired,
    RateLimited,
    TooSoon,
    AlreadyVerified,
    InternalRetryable,
    StoreUnavailable,
    Configuration,
}

impl ErrorKind {
    /// Wire code for the HTTP layer
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidOrExpired => "INVALID_OR_EXPIRED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::TooSoon => "TOO_SOON",
            ErrorKind::AlreadyVerified => "ALREADY_VERIFIED",
            ErrorKind::InternalRetryable => "INTERNAL_RETRYABLE",
            ErrorKind::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorKind::Configuration => "CONFIGURATION",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VerificationError {
    /// Error kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VerificationError::InvalidOrExpired => ErrorKind::InvalidOrExpired,
            VerificationError::RateLimited { .. } => ErrorKind::RateLimited,
            VerificationError::TooSoon { .. } => ErrorKind::TooSoon,
            VerificationError::AlreadyVerified => ErrorKind::AlreadyVerified,
            VerificationError::InternalRetryable { .. } => ErrorKind::InternalRetryable,
            VerificationError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            VerificationError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Retry-after hint, if the error carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            VerificationError::RateLimited { retry_after }
            | VerificationError::TooSoon { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VerificationError::InternalRetryable { forfeited: false }
                | VerificationError::StoreUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for VerificationError {
    fn from(err: serde_json::Error) -> Self {
        VerificationError::StoreUnavailable(format!("serialization: {}", err))
    }
}
