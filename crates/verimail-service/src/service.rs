//! Verification service
//!
//! Orchestrates token issuance, redemption, resend policy and maintenance.
//! This is the only component that talks to the user store.
//!
//! ## Redemption
//!
//! 1. The whole body runs under a response-time floor drawn from the
//!    configured delay range, so every exit path takes the same time.
//! 2. Claim the token; anything short of a won claim is `INVALID_OR_EXPIRED`.
//! 3. Decode the metadata and check it belongs to this token.
//! 4. Load the user; a missing user or changed address forfeits the token
//!    with the same generic error.
//! 5. Already verified: commit and report idempotent success.
//! 6. Otherwise flip the user to verified; commit on success, roll back on
//!    failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use verimail_common::clock::{to_chrono, until};
use verimail_common::crypto::{
    constant_time_eq, decode_metadata, encode_metadata, generate_token, normalize_token,
    token_hash,
};
use verimail_common::{
    Clock, Result, SystemClock, TokenInfo, TokenMetadata, TokenRecord, User, VerificationError,
};
use verimail_store::KeyValueStore;

use crate::claim::{ClaimHandle, ClaimMachine, ClaimPolicy, RollbackOutcome};
use crate::config::VerificationConfig;
use crate::keys::{log_tag, KeySpace};
use crate::metrics::VerificationMetrics;
use crate::rate_limit::RateLimiter;
use crate::users::{UserRepository, UserStoreError};

/// Successful redemption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    /// User record after verification
    pub user: User,
    /// The user was verified before this token was redeemed
    pub already_verified: bool,
}

/// Snapshot of the token store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationStats {
    pub available_tokens: u64,
    pub claimed_tokens: u64,
    /// Past expiry but not yet reclaimed
    pub expired_tokens: u64,
    pub malformed_tokens: u64,
    /// Users with an index entry pointing at their newest token
    pub indexed_users: u64,
}

/// Email verification token service
pub struct VerificationService {
    config: VerificationConfig,
    store: Arc<dyn KeyValueStore>,
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    limiter: RateLimiter,
    claims: ClaimMachine,
    metrics: Arc<VerificationMetrics>,
}

impl VerificationService {
    /// Create a service using the system clock
    pub fn new(
        config: VerificationConfig,
        store: Arc<dyn KeyValueStore>,
        users: Arc<dyn UserRepository>,
    ) -> Result<Self> {
        Self::with_clock(config, store, users, Arc::new(SystemClock))
    }

    /// Create a service reading time from `clock`
    pub fn with_clock(
        config: VerificationConfig,
        store: Arc<dyn KeyValueStore>,
        users: Arc<dyn UserRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = VerificationMetrics::new()
            .map_err(|e| VerificationError::Config(format!("metrics: {}", e)))?;
        let keys = KeySpace::new(&config.storage.key_prefix);
        let limiter = RateLimiter::new(store.clone(), keys.clone());
        let claims = ClaimMachine::new(
            store.clone(),
            clock.clone(),
            keys.clone(),
            ClaimPolicy {
                lease: config.claim.lease(),
                max_rollback_retries: config.claim.max_rollback_retries,
            },
        );

        Ok(Self {
            config,
            store,
            users,
            clock,
            keys,
            limiter,
            claims,
            metrics: Arc::new(metrics),
        })
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Metrics handle, for registration with a registry
    pub fn metrics(&self) -> Arc<VerificationMetrics> {
        self.metrics.clone()
    }

    /// Issue a new token for `user_id` confirming `email`.
    ///
    /// The user index is repointed at the new token; the previous token is
    /// left to expire on its own TTL.
    #[instrument(skip(self, email))]
    pub async fn issue_token(&self, user_id: &str, email: &str) -> Result<String> {
        let token = generate_token();
        let hash = token_hash(&token);
        let now = self.clock.now();
        let validity = self.config.token_validity();

        let metadata = TokenMetadata {
            user_id: user_id.to_string(),
            email: email.trim().to_string(),
            token_hash: hash.clone(),
            created_at: now,
            expires_at: now + to_chrono(validity),
        };
        let encoded = encode_metadata(&metadata)
            .map_err(|e| VerificationError::StoreUnavailable(e.to_string()))?;
        let record = TokenRecord::available(metadata.expires_at, encoded);

        self.store
            .set_with_ttl(&self.keys.token(&hash), &record.to_json()?, validity)
            .await?;
        self.store
            .set_with_ttl(&self.keys.user_index(user_id), &hash, validity)
            .await?;

        self.metrics.tokens_issued.inc();
        info!(
            user_id,
            token = %log_tag(&hash),
            expires_at = %metadata.expires_at,
            "Issued verification token"
        );
        Ok(token)
    }

    /// Redeem a token and mark its user verified
    #[instrument(skip(self, token))]
    pub async fn verify_email(&self, token: &str) -> Result<VerificationOutcome> {
        let deadline = Instant::now() + self.delay_target();

        let result = self.redeem(token).await;
        match &result {
            Ok(_) => self.metrics.verifications_succeeded.inc(),
            Err(VerificationError::InvalidOrExpired) => self.metrics.verifications_rejected.inc(),
            Err(_) => {}
        }

        tokio::time::sleep_until(deadline).await;
        result
    }

    /// Issue a fresh token for `user_id`, subject to throttling
    #[instrument(skip(self))]
    pub async fn resend_verification_email(&self, user_id: &str) -> Result<String> {
        let resend = &self.config.resend;

        let decision = self
            .limiter
            .check_and_increment(user_id, resend.limit, resend.window())
            .await?;
        if !decision.allowed {
            self.metrics.resends_rate_limited.inc();
            return Err(VerificationError::RateLimited {
                retry_after: decision.retry_after,
            });
        }

        let user = match self.find_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) | Err(UserStoreError::NotFound) => {
                return Err(VerificationError::InvalidOrExpired)
            }
            Err(e) => {
                warn!(error = %e, "User lookup failed during resend");
                return Err(VerificationError::InternalRetryable { forfeited: false });
            }
        };
        if user.is_verified() {
            return Err(VerificationError::AlreadyVerified);
        }

        if let Some((active, _)) = self.active_token(user_id).await? {
            let now = self.clock.now();
            let min_interval = to_chrono(resend.min_interval());
            let grace = to_chrono(resend.expiry_grace());

            if active.age(now) < min_interval && active.remaining(now) > grace {
                let retry_after = until(now, active.created_at + min_interval)
                    .min(until(now, active.expires_at - grace));
                self.metrics.resends_too_soon.inc();
                debug!(user_id, ?retry_after, "Resend refused, active token is recent");
                return Err(VerificationError::TooSoon { retry_after });
            }
        }

        self.issue_token(user_id, &user.email).await
    }

    /// Release stuck claims, drop expired records and stale index entries.
    ///
    /// Best effort: failures are logged and the sweep continues. Returns the
    /// number of records repaired or removed.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_tokens(&self) -> u64 {
        let report = self.claims.sweep().await;
        let reconciled = self.reconcile_index().await;

        let total = report.repaired() + reconciled;
        self.metrics.sweep_repaired.inc_by(total);
        self.metrics
            .claims_forfeited
            .inc_by(report.leases_forfeited);
        if total > 0 {
            info!(
                repaired = report.repaired(),
                index_entries_removed = reconciled,
                "Cleanup finished"
            );
        }
        total
    }

    /// Token counts by state
    #[instrument(skip(self))]
    pub async fn get_verification_stats(&self) -> Result<VerificationStats> {
        let now = self.clock.now();
        let mut stats = VerificationStats::default();

        for key in self.store.scan_prefix(&self.keys.token_prefix()).await? {
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            match TokenRecord::from_json(&json) {
                Ok(record) if record.is_expired(now) => stats.expired_tokens += 1,
                Ok(record) if record.is_claimed() => stats.claimed_tokens += 1,
                Ok(_) => stats.available_tokens += 1,
                Err(_) => stats.malformed_tokens += 1,
            }
        }

        stats.indexed_users = self
            .store
            .scan_prefix(&self.keys.user_index_prefix())
            .await?
            .len() as u64;
        Ok(stats)
    }

    /// Whether `user_id` still has to confirm their address
    pub async fn is_verification_required(&self, user_id: &str) -> Result<bool> {
        match self.find_user(user_id).await {
            Ok(Some(user)) => Ok(!user.is_verified()),
            Ok(None) | Err(UserStoreError::NotFound) => Err(VerificationError::InvalidOrExpired),
            Err(e) => {
                warn!(error = %e, "User lookup failed");
                Err(VerificationError::InternalRetryable { forfeited: false })
            }
        }
    }

    /// Describe a token without claiming or consuming it
    pub async fn peek_token_info(&self, token: &str) -> Result<TokenInfo> {
        let hash = normalize_token(token)
            .map(|t| token_hash(&t))
            .ok_or(VerificationError::InvalidOrExpired)?;
        let record = self
            .claims
            .peek(&hash)
            .await?
            .ok_or(VerificationError::InvalidOrExpired)?;

        let metadata = self
            .bound_metadata(&record, &hash)
            .ok_or(VerificationError::InvalidOrExpired)?;
        if metadata.is_expired(self.clock.now()) {
            return Err(VerificationError::InvalidOrExpired);
        }
        Ok(TokenInfo::from_parts(metadata, &record))
    }

    /// The newest unexpired token issued to `user_id`, as seen by resend
    pub async fn active_token_info(&self, user_id: &str) -> Result<Option<TokenInfo>> {
        Ok(self
            .active_token(user_id)
            .await?
            .map(|(metadata, record)| TokenInfo::from_parts(metadata, &record)))
    }

    async fn redeem(&self, token: &str) -> Result<VerificationOutcome> {
        let Some(token) = normalize_token(token) else {
            debug!("Rejected malformed token");
            return Err(VerificationError::InvalidOrExpired);
        };
        let hash = token_hash(&token);

        let Some(handle) = self.claims.claim(&hash).await? else {
            debug!(token = %log_tag(&hash), "Token not claimable");
            return Err(VerificationError::InvalidOrExpired);
        };

        let Some(metadata) = self.bound_metadata_of(&handle) else {
            warn!(token = %log_tag(&hash), "Token metadata unreadable");
            return Err(self.reject(&handle).await);
        };

        let user = match self.find_user(&metadata.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) | Err(UserStoreError::NotFound) => {
                info!(user_id = %metadata.user_id, "Token subject no longer exists");
                return Err(self.reject(&handle).await);
            }
            Err(e) => {
                warn!(user_id = %metadata.user_id, error = %e, "User lookup failed");
                return Err(self.release(&handle).await);
            }
        };

        if !user.email_matches(&metadata.email) {
            info!(user_id = %user.id, "Token address no longer matches account");
            return Err(self.reject(&handle).await);
        }

        if user.is_verified() {
            self.finalize(&handle, &user.id).await;
            debug!(user_id = %user.id, "Token redeemed for already verified user");
            return Ok(VerificationOutcome {
                user,
                already_verified: true,
            });
        }

        let update = self
            .with_user_deadline(
                "update_verification_status",
                self.users.update_verification_status(&user.id),
            )
            .await;
        match update {
            Ok(updated) => {
                self.finalize(&handle, &updated.id).await;
                info!(user_id = %updated.id, "Email verified");
                Ok(VerificationOutcome {
                    user: updated,
                    already_verified: false,
                })
            }
            Err(UserStoreError::Retryable(e)) => {
                warn!(user_id = %user.id, error = %e, "User update failed, rolling back claim");
                Err(self.release(&handle).await)
            }
            Err(UserStoreError::NotFound) => {
                info!(user_id = %user.id, "User disappeared before update");
                Err(self.reject(&handle).await)
            }
            Err(UserStoreError::Fatal(e)) => {
                error!(user_id = %user.id, error = %e, "User update failed permanently");
                self.forfeit(&handle).await;
                Err(VerificationError::InternalRetryable { forfeited: true })
            }
        }
    }

    async fn find_user(
        &self,
        user_id: &str,
    ) -> std::result::Result<Option<User>, UserStoreError> {
        self.with_user_deadline("find_user", self.users.find_user(user_id))
            .await
    }

    /// Bound a user store call so a claim holder gives up before its lease
    /// can be taken over. A timeout is reported as retryable.
    async fn with_user_deadline<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = std::result::Result<T, UserStoreError>>,
    ) -> std::result::Result<T, UserStoreError> {
        let deadline = self.config.claim.user_store_timeout();
        match tokio::time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
                warn!(op, after_ms, "User store call timed out");
                Err(UserStoreError::Retryable(format!(
                    "{} timed out after {}ms",
                    op, after_ms
                )))
            }
        }
    }

    /// Metadata of a claimed token, if it decodes and belongs to the token
    fn bound_metadata_of(&self, handle: &ClaimHandle) -> Option<TokenMetadata> {
        let metadata = decode_metadata(handle.metadata()).ok()?;
        constant_time_eq(&metadata.token_hash, handle.token_hash()).then_some(metadata)
    }

    fn bound_metadata(&self, record: &TokenRecord, hash: &str) -> Option<TokenMetadata> {
        let metadata = decode_metadata(&record.metadata).ok()?;
        constant_time_eq(&metadata.token_hash, hash).then_some(metadata)
    }

    /// Newest token for a user via the index, if it is still live
    async fn active_token(&self, user_id: &str) -> Result<Option<(TokenMetadata, TokenRecord)>> {
        let Some(hash) = self.store.get(&self.keys.user_index(user_id)).await? else {
            return Ok(None);
        };
        let Some(record) = self.claims.peek(&hash).await? else {
            return Ok(None);
        };
        let Some(metadata) = self.bound_metadata(&record, &hash) else {
            return Ok(None);
        };
        if metadata.user_id != user_id || metadata.is_expired(self.clock.now()) {
            return Ok(None);
        }
        Ok(Some((metadata, record)))
    }

    /// Commit a redeemed claim and drop the user's index entry if it still
    /// points at this token
    async fn finalize(&self, handle: &ClaimHandle, user_id: &str) {
        // The user is already verified at this point; a failed commit leaves
        // the claim to the sweep and a later redemption is idempotent.
        if let Err(e) = self.claims.commit(handle).await {
            warn!(error = %e, "Commit failed after verification");
        }
        if let Err(e) = self
            .store
            .compare_and_delete(&self.keys.user_index(user_id), handle.token_hash())
            .await
        {
            debug!(error = %e, "Could not clear user index entry");
        }
    }

    /// Delete the claimed token
    async fn forfeit(&self, handle: &ClaimHandle) {
        match self.claims.forfeit(handle).await {
            Ok(_) => self.metrics.claims_forfeited.inc(),
            Err(e) => warn!(error = %e, "Failed to forfeit token, lease will expire"),
        }
    }

    /// Forfeit and answer with the generic error
    async fn reject(&self, handle: &ClaimHandle) -> VerificationError {
        self.forfeit(handle).await;
        VerificationError::InvalidOrExpired
    }

    /// Roll the claim back after a transient failure
    async fn release(&self, handle: &ClaimHandle) -> VerificationError {
        match self.claims.rollback(handle).await {
            Ok(RollbackOutcome::RolledBack { .. }) | Ok(RollbackOutcome::LeaseLost) => {
                self.metrics.claims_rolled_back.inc();
                VerificationError::InternalRetryable { forfeited: false }
            }
            Ok(RollbackOutcome::Forfeited) => {
                self.metrics.claims_forfeited.inc();
                VerificationError::InternalRetryable { forfeited: true }
            }
            Err(e) => {
                error!(error = %e, "Rollback failed, lease will expire");
                VerificationError::InternalRetryable { forfeited: false }
            }
        }
    }

    /// Remove index entries whose token record is gone
    async fn reconcile_index(&self) -> u64 {
        let keys = match self.store.scan_prefix(&self.keys.user_index_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "User index scan failed");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            let hash = match self.store.get(&key).await {
                Ok(Some(hash)) => hash,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to read user index entry");
                    continue;
                }
            };
            match self.claims.peek(&hash).await {
                Ok(Some(_)) => {}
                Ok(None) => match self.store.compare_and_delete(&key, &hash).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Failed to remove stale index entry"),
                },
                Err(e) => warn!(error = %e, "Failed to check indexed token"),
            }
        }
        removed
    }

    fn delay_target(&self) -> Duration {
        let timing = &self.config.timing;
        let ms = rand::thread_rng().gen_range(timing.min_delay_ms..=timing.max_delay_ms);
        Duration::from_millis(ms)
    }
}
