//! # Verimail Service
//!
//! Single-use email verification tokens over a shared key-value store.
//!
//! Tokens are random 256-bit values handed to the user once and stored only
//! by hash. Redemption is a claim/commit protocol on the store, so concurrent
//! redemptions of the same token produce exactly one success, and a failure
//! in the user store rolls the claim back instead of burning the token.
//!
//! ## Key Concepts
//!
//! - **Claim**: compare-and-set from AVAILABLE to CLAIMED with a lease
//! - **Rollback**: CLAIMED back to AVAILABLE after a transient failure, bounded
//! - **Resend policy**: fixed-window rate limit plus a minimum interval
//! - **Generic failure**: every invalid, expired, used or mismatched token
//!   answers `INVALID_OR_EXPIRED` after the same artificial delay
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  VerificationService                    │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐      │
//! │  │   Issue /   │  │   Verify    │  │  Cleanup &  │      │
//! │  │   Resend    │  │   Email     │  │   Stats     │      │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘      │
//! │         │                │                │             │
//! │  ┌──────┴──────┐  ┌──────┴────────────────┴──────┐      │
//! │  │ RateLimiter │  │         ClaimMachine         │      │
//! │  └──────┬──────┘  └──────────────┬───────────────┘      │
//! │         │                        │                      │
//! │  ┌──────┴────────────────────────┴───────────────┐      │
//! │  │          KeyValueStore (Redis / memory)       │      │
//! │  └───────────────────────────────────────────────┘      │
//! └────────────────────────────┬────────────────────────────┘
//!                              │
//!                    UserRepository (external)
//! ```

pub mod claim;
pub mod config;
pub mod keys;
pub mod metrics;
pub mod rate_limit;
pub mod service;
pub mod users;

pub use claim::{ClaimHandle, ClaimMachine, ClaimPolicy, RollbackOutcome, SweepReport};
pub use config::VerificationConfig;
pub use keys::KeySpace;
pub use metrics::VerificationMetrics;
pub use rate_limit::{RateDecision, RateLimiter};
pub use service::{VerificationOutcome, VerificationService, VerificationStats};
pub use users::{InMemoryUserRepository, UserRepository, UserStoreError};
