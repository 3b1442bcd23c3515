//! # Verimail Common
//!
//! Shared types, errors, and token primitives for the Verimail email
//! verification service.
//!
//! ## Core Types
//!
//! - [`TokenMetadata`]: subject and validity window captured at issuance
//! - [`TokenRecord`]: the stored envelope carrying claim state
//! - [`User`]: the durable user record owned by the user store
//!
//! ## Crypto
//!
//! - [`crypto::token`]: token generation, hashing, metadata codec and
//!   constant-time comparison
//!
//! ## Time
//!
//! - [`clock`]: wall-clock abstraction shared by stores and services

pub mod clock;
pub mod crypto;
pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ErrorKind, Result, VerificationError};
pub use types::{
    token::{ClaimState, TokenInfo, TokenMetadata, TokenRecord},
    user::{User, UserStatus},
};

/// Verimail version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default token validity window in seconds (24 hours)
pub const DEFAULT_TOKEN_VALIDITY_SECS: u64 = 24 * 60 * 60;

/// Default number of resends allowed per window
pub const DEFAULT_RESEND_LIMIT: u64 = 3;

/// Default resend rate-limit window in seconds
pub const DEFAULT_RESEND_WINDOW_SECS: u64 = 60 * 60;

/// Default minimum age of the active token before a resend is allowed
pub const DEFAULT_MIN_RESEND_INTERVAL_SECS: u64 = 60 * 60;

/// Default window before expiry in which a resend is always allowed
pub const DEFAULT_EXPIRY_GRACE_SECS: u64 = 60 * 60;

/// Default claim lease in seconds
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 30;

/// Default number of rollbacks before a token is forfeited
pub const DEFAULT_MAX_ROLLBACK_RETRIES: u32 = 3;

/// Default deadline for a user store call made under a claim
pub const DEFAULT_USER_STORE_TIMEOUT_MS: u64 = 10_000;

/// Default lower bound of the normalized response time
pub const DEFAULT_MIN_DELAY_MS: u64 = 100;

/// Default upper bound of the normalized response time
pub const DEFAULT_MAX_DELAY_MS: u64 = 300;
