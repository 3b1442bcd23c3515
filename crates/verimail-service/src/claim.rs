//! Single-use claim protocol
//!
//! ```text
//!              claim (CAS)              commit (CAD)
//!  AVAILABLE ─────────────► CLAIMED ─────────────────► deleted
//!      ▲                      │  │
//!      │   rollback (CAS)     │  │ rollback with retries exhausted,
//!      └──────────────────────┘  │ forfeit, or expired on claim
//!         retries + 1            └──────────────────► deleted
//! ```
//!
//! Every transition is a compare-and-set against the exact value the caller
//! observed, so of N concurrent claimers exactly one wins and a stale handle
//! can never finalize a record somebody else has since re-claimed. A claim
//! carries a lease; the sweep (or the next claimer) releases claims whose
//! holder vanished without committing or rolling back.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};
use verimail_common::clock::to_chrono;
use verimail_common::{Clock, TokenRecord};
use verimail_store::{KeyValueStore, StoreError};

use crate::keys::{log_tag, KeySpace};

/// Lease and retry bounds of the claim protocol
#[derive(Debug, Clone, Copy)]
pub struct ClaimPolicy {
    pub lease: Duration,
    pub max_rollback_retries: u32,
}

/// Exclusive reservation of a token, returned by a won claim
#[derive(Debug)]
pub struct ClaimHandle {
    key: String,
    token_hash: String,
    claimed_json: String,
    record: TokenRecord,
}

impl ClaimHandle {
    /// Encoded token metadata
    pub fn metadata(&self) -> &str {
        &self.record.metadata
    }

    pub fn token_hash(&self) -> &str {
        &self.token_hash
    }

    /// Rollbacks this token has been through before this claim
    pub fn retries(&self) -> u32 {
        self.record.retries
    }
}

/// Result of rolling back a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Token is redeemable again
    RolledBack { retries: u32 },
    /// Retries exhausted, token deleted
    Forfeited,
    /// The lease elapsed and the record changed hands before the rollback
    LeaseLost,
}

/// Counts from one maintenance sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: u64,
    pub leases_released: u64,
    pub leases_forfeited: u64,
    pub expired_removed: u64,
    pub malformed_removed: u64,
    pub errors: u64,
}

impl SweepReport {
    /// Records repaired or removed
    pub fn repaired(&self) -> u64 {
        self.leases_released + self.leases_forfeited + self.expired_removed + self.malformed_removed
    }
}

enum SweepAction {
    Untouched,
    ExpiredRemoved,
    MalformedRemoved,
    LeaseReleased,
    LeaseForfeited,
}

/// Claim state machine over the token records in the store
pub struct ClaimMachine {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    policy: ClaimPolicy,
}

impl ClaimMachine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        policy: ClaimPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            policy,
        }
    }

    /// Try to reserve the token stored under `token_hash`.
    ///
    /// `None` covers every reason the caller cannot have the token: it never
    /// existed, it expired, its record is unreadable, or another caller holds
    /// or just won it.
    #[instrument(skip(self, token_hash), fields(token = %log_tag(token_hash)))]
    pub async fn claim(&self, token_hash: &str) -> Result<Option<ClaimHandle>, StoreError> {
        let key = self.keys.token(token_hash);
        let Some(current_json) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let record = match TokenRecord::from_json(&current_json) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Unreadable token record");
                return Ok(None);
            }
        };

        let now = self.clock.now();
        let base = if !record.is_claimed() {
            record
        } else if record.lease_elapsed(now) {
            // Previous holder vanished: its attempt counts as a rollback
            if record.retries >= self.policy.max_rollback_retries {
                self.store.compare_and_delete(&key, &current_json).await?;
                info!("Forfeited token after abandoned claims");
                return Ok(None);
            }
            debug!("Taking over claim with elapsed lease");
            record.released()
        } else {
            return Ok(None);
        };

        let claimed = base.claimed(new_claim_id(), now, now + to_chrono(self.policy.lease));
        let claimed_json = claimed
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        match self
            .store
            .compare_and_swap(&key, &current_json, &claimed_json)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e @ StoreError::Timeout { .. }) => {
                // The swap may still land; put the observed value back if it did
                if let Err(release_err) = self
                    .store
                    .compare_and_swap(&key, &claimed_json, &current_json)
                    .await
                {
                    warn!(error = %release_err, "Could not release timed-out claim, lease will expire");
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let handle = ClaimHandle {
            key,
            token_hash: token_hash.to_string(),
            claimed_json,
            record: claimed,
        };

        if handle.record.is_expired(now) {
            debug!("Claimed token is expired, forfeiting");
            if let Err(e) = self.forfeit(&handle).await {
                warn!(error = %e, "Failed to delete expired token");
            }
            return Ok(None);
        }

        Ok(Some(handle))
    }

    /// Finalize a successful redemption by deleting the record.
    ///
    /// Returns `false` if the claim was no longer held.
    #[instrument(skip(self, handle), fields(token = %log_tag(&handle.token_hash)))]
    pub async fn commit(&self, handle: &ClaimHandle) -> Result<bool, StoreError> {
        let committed = self
            .store
            .compare_and_delete(&handle.key, &handle.claimed_json)
            .await?;
        if !committed {
            warn!("Commit found the claim no longer held");
        }
        Ok(committed)
    }

    /// Release a claim after a downstream failure
    #[instrument(skip(self, handle), fields(token = %log_tag(&handle.token_hash)))]
    pub async fn rollback(&self, handle: &ClaimHandle) -> Result<RollbackOutcome, StoreError> {
        if handle.record.retries >= self.policy.max_rollback_retries {
            return Ok(if self.forfeit(handle).await? {
                info!(retries = handle.record.retries, "Rollback retries exhausted, token forfeited");
                RollbackOutcome::Forfeited
            } else {
                RollbackOutcome::LeaseLost
            });
        }

        let released = handle.record.released();
        let released_json = released
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if self
            .store
            .compare_and_swap(&handle.key, &handle.claimed_json, &released_json)
            .await?
        {
            debug!(retries = released.retries, "Claim rolled back");
            Ok(RollbackOutcome::RolledBack {
                retries: released.retries,
            })
        } else {
            warn!("Rollback found the claim no longer held");
            Ok(RollbackOutcome::LeaseLost)
        }
    }

    /// Permanently delete a claimed token
    pub async fn forfeit(&self, handle: &ClaimHandle) -> Result<bool, StoreError> {
        self.store
            .compare_and_delete(&handle.key, &handle.claimed_json)
            .await
    }

    /// Read a token record without claiming it
    pub async fn peek(&self, token_hash: &str) -> Result<Option<TokenRecord>, StoreError> {
        let key = self.keys.token(token_hash);
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|json| TokenRecord::from_json(&json).ok()))
    }

    /// Release elapsed leases and drop expired or unreadable records.
    ///
    /// Failures on individual records are logged and the sweep moves on.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let keys = match self.store.scan_prefix(&self.keys.token_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Token scan failed");
                report.errors += 1;
                return report;
            }
        };

        for key in keys {
            report.scanned += 1;
            match self.sweep_one(&key).await {
                Ok(SweepAction::Untouched) => {}
                Ok(SweepAction::ExpiredRemoved) => report.expired_removed += 1,
                Ok(SweepAction::MalformedRemoved) => report.malformed_removed += 1,
                Ok(SweepAction::LeaseReleased) => report.leases_released += 1,
                Ok(SweepAction::LeaseForfeited) => report.leases_forfeited += 1,
                Err(e) => {
                    warn!(error = %e, "Failed to sweep token record");
                    report.errors += 1;
                }
            }
        }

        if report.repaired() > 0 || report.errors > 0 {
            info!(
                scanned = report.scanned,
                released = report.leases_released,
                forfeited = report.leases_forfeited,
                expired = report.expired_removed,
                malformed = report.malformed_removed,
                errors = report.errors,
                "Token sweep finished"
            );
        }
        report
    }

    async fn sweep_one(&self, key: &str) -> Result<SweepAction, StoreError> {
        let Some(json) = self.store.get(key).await? else {
            return Ok(SweepAction::Untouched);
        };

        let record = match TokenRecord::from_json(&json) {
            Ok(record) => record,
            Err(_) => {
                return Ok(if self.store.compare_and_delete(key, &json).await? {
                    SweepAction::MalformedRemoved
                } else {
                    SweepAction::Untouched
                });
            }
        };

        let now = self.clock.now();
        if record.is_expired(now) {
            return Ok(if self.store.compare_and_delete(key, &json).await? {
                SweepAction::ExpiredRemoved
            } else {
                SweepAction::Untouched
            });
        }

        if !record.lease_elapsed(now) {
            return Ok(SweepAction::Untouched);
        }

        if record.retries >= self.policy.max_rollback_retries {
            return Ok(if self.store.compare_and_delete(key, &json).await? {
                SweepAction::LeaseForfeited
            } else {
                SweepAction::Untouched
            });
        }

        let released = record
            .released()
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(if self.store.compare_and_swap(key, &json, &released).await? {
            SweepAction::LeaseReleased
        } else {
            SweepAction::Untouched
        })
    }
}

fn new_claim_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
