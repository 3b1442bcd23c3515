//! Per-user resend rate limiter
//!
//! Fixed window counter in the shared store. The window starts with the
//! first increment and its TTL is never refreshed, so repeated requests
//! cannot push the reset further out. The decision is taken after the
//! increment: denied attempts still count toward the current window.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};
use verimail_store::{KeyValueStore, StoreError};

use crate::keys::KeySpace;

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Attempts counted in the current window, including this one
    pub count: u64,
    /// Time until the window resets, zero when allowed
    pub retry_after: Duration,
}

/// Store-backed fixed window limiter
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    keys: KeySpace,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Count an attempt for `user_id` and decide whether it is allowed
    #[instrument(skip(self))]
    pub async fn check_and_increment(
        &self,
        user_id: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateDecision, StoreError> {
        let key = self.keys.resend(user_id);
        let count = self.store.increment_with_ttl(&key, window).await?;

        if count <= limit {
            return Ok(RateDecision {
                allowed: true,
                count,
                retry_after: Duration::ZERO,
            });
        }

        let retry_after = self.store.ttl(&key).await?.unwrap_or(window);
        debug!(user_id, count, limit, ?retry_after, "Resend rate limited");
        Ok(RateDecision {
            allowed: false,
            count,
            retry_after,
        })
    }
}
