//! End-to-end verification flows
//!
//! Runs the service over the in-memory store and user repository with a
//! mock clock:
//! - concurrent redemption
//! - reissue and resend throttling
//! - response uniformity for failed redemptions
//! - rollback, forfeiture and abandoned-claim recovery
//! - maintenance and stats

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use verimail_common::crypto::token_hash;
use verimail_common::{MockClock, User, UserStatus, VerificationError};
use verimail_service::{
    ClaimMachine, ClaimPolicy, InMemoryUserRepository, KeySpace, UserRepository,
    UserStoreError, VerificationConfig, VerificationService,
};
use verimail_store::{InMemoryStore, KeyValueStore};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

struct Harness {
    service: Arc<VerificationService>,
    store: Arc<InMemoryStore>,
    clock: MockClock,
}

impl Harness {
    /// A second claim machine over the same records, standing in for a
    /// process that claims and then disappears
    fn rogue_claimer(&self) -> ClaimMachine {
        ClaimMachine::new(
            self.store.clone(),
            Arc::new(self.clock.clone()),
            KeySpace::new(&self.service.config().storage.key_prefix),
            ClaimPolicy {
                lease: self.service.config().claim.lease(),
                max_rollback_retries: self.service.config().claim.max_rollback_retries,
            },
        )
    }
}

fn test_config() -> VerificationConfig {
    let mut config = VerificationConfig::default();
    config.timing.min_delay_ms = 0;
    config.timing.max_delay_ms = 2;
    config
}

fn harness_with(config: VerificationConfig, users: Arc<dyn UserRepository>) -> Harness {
    let clock = MockClock::default();
    let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
    let service =
        VerificationService::with_clock(config, store.clone(), users, Arc::new(clock.clone()))
            .unwrap();
    Harness {
        service: Arc::new(service),
        store,
        clock,
    }
}

fn harness(config: VerificationConfig) -> (Harness, Arc<InMemoryUserRepository>) {
    let users = Arc::new(InMemoryUserRepository::new());
    (harness_with(config, users.clone()), users)
}

/// Fails the next `failures` verification updates with a retryable error
struct FlakyUsers {
    inner: InMemoryUserRepository,
    failures: AtomicUsize,
    updates: AtomicUsize,
}

impl FlakyUsers {
    fn new(failures: usize) -> Self {
        let inner = InMemoryUserRepository::new();
        inner.insert(User::new("u1", "a@x.com"));
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            updates: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl UserRepository for FlakyUsers {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, UserStoreError> {
        self.inner.find_user(user_id).await
    }

    async fn update_verification_status(&self, user_id: &str) -> Result<User, UserStoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(UserStoreError::Retryable("serialization failure".to_string()));
        }
        self.inner.update_verification_status(user_id).await
    }
}

/// Stalls the first verification update until released
struct StalledUsers {
    inner: InMemoryUserRepository,
    stall_next: AtomicBool,
    entered: Notify,
    release: Notify,
    updates: AtomicUsize,
}

impl StalledUsers {
    fn new() -> Self {
        let inner = InMemoryUserRepository::new();
        inner.insert(User::new("u1", "a@x.com"));
        Self {
            inner,
            stall_next: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
            updates: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl UserRepository for StalledUsers {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, UserStoreError> {
        self.inner.find_user(user_id).await
    }

    async fn update_verification_status(&self, user_id: &str) -> Result<User, UserStoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.stall_next.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.update_verification_status(user_id).await
    }
}

fn is_invalid(result: &Result<impl std::fmt::Debug, VerificationError>) -> bool {
    matches!(result, Err(VerificationError::InvalidOrExpired))
}

// =============================================================================
// Redemption
// =============================================================================

#[tokio::test]
async fn test_verify_marks_user_active() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "Alice@Example.com"));

    let token = h.service.issue_token("u1", " alice@example.com").await.unwrap();
    assert!(h.service.is_verification_required("u1").await.unwrap());

    let outcome = h.service.verify_email(&token).await.unwrap();
    assert!(!outcome.already_verified);
    assert_eq!(outcome.user.status, UserStatus::Active);
    assert!(outcome.user.email_verified_at.is_some());

    assert!(!h.service.is_verification_required("u1").await.unwrap());
    assert!(is_invalid(&h.service.verify_email(&token).await));
    assert_eq!(h.service.metrics().verifications_succeeded.get(), 1);
    assert_eq!(h.service.metrics().verifications_rejected.get(), 1);
}

#[tokio::test]
async fn test_token_input_is_normalized() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));

    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();
    let shouted = format!("  {}\n", token.to_uppercase());

    assert!(h.service.verify_email(&shouted).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemption_single_success() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let service = h.service.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move { service.verify_email(&token).await }));
    }

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(outcome) => {
                assert!(!outcome.already_verified);
                successes += 1;
            }
            Err(e) => assert_eq!(e, VerificationError::InvalidOrExpired),
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn test_reissue_keeps_previous_token_redeemable() {
    let mut config = test_config();
    config.resend.min_interval_secs = 0;
    let (h, users) = harness(config);
    users.insert(User::new("u1", "a@x.com"));

    let first = h.service.issue_token("u1", "a@x.com").await.unwrap();
    let second = h.service.resend_verification_email("u1").await.unwrap();
    assert_ne!(first, second);

    // The index follows the newest token
    let active = h.service.active_token_info("u1").await.unwrap().unwrap();
    assert_eq!(
        active,
        h.service.peek_token_info(&second).await.unwrap()
    );

    assert!(!h.service.verify_email(&first).await.unwrap().already_verified);
    assert!(h.service.verify_email(&second).await.unwrap().already_verified);
    assert!(h.service.active_token_info("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_redemptions_look_identical() {
    let mut config = test_config();
    config.timing.min_delay_ms = 60;
    config.timing.max_delay_ms = 80;
    let (h, users) = harness(config);

    users.insert(User::new("expired", "e@x.com"));
    let expired = h.service.issue_token("expired", "e@x.com").await.unwrap();
    h.clock.advance(25 * HOUR);

    users.insert(User::new("gone", "g@x.com"));
    let deleted = h.service.issue_token("gone", "g@x.com").await.unwrap();
    users.remove("gone");

    users.insert(User::new("moved", "old@x.com"));
    let changed = h.service.issue_token("moved", "old@x.com").await.unwrap();
    users.set_email("moved", "new@x.com");

    let unknown = "ab".repeat(32);
    let cases = [
        unknown.as_str(),
        "not-a-token",
        expired.as_str(),
        deleted.as_str(),
        changed.as_str(),
    ];

    let mut latencies = Vec::new();
    for token in cases {
        let started = Instant::now();
        let result = h.service.verify_email(token).await;
        latencies.push(started.elapsed());
        assert!(is_invalid(&result), "{:?}", result);
    }

    let fastest = latencies.iter().min().copied().unwrap();
    let slowest = latencies.iter().max().copied().unwrap();
    assert!(fastest >= Duration::from_millis(60), "{:?}", latencies);
    assert!(slowest - fastest < Duration::from_millis(50), "{:?}", latencies);
}

#[tokio::test]
async fn test_deleted_user_forfeits_token() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();
    users.remove("u1");

    assert!(is_invalid(&h.service.verify_email(&token).await));

    // Recreating the account does not revive the token
    users.insert(User::new("u1", "a@x.com"));
    assert!(is_invalid(&h.service.verify_email(&token).await));
}

// =============================================================================
// Rollback and recovery
// =============================================================================

#[tokio::test]
async fn test_transient_failures_roll_back() {
    let users = Arc::new(FlakyUsers::new(2));
    let h = harness_with(test_config(), users.clone());
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();

    for _ in 0..2 {
        assert_eq!(
            h.service.verify_email(&token).await.unwrap_err(),
            VerificationError::InternalRetryable { forfeited: false }
        );
    }

    let outcome = h.service.verify_email(&token).await.unwrap();
    assert!(!outcome.already_verified);
    assert_eq!(users.updates.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_retries_forfeit_token() {
    let users = Arc::new(FlakyUsers::new(usize::MAX));
    let h = harness_with(test_config(), users.clone());
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();

    for _ in 0..3 {
        assert_eq!(
            h.service.verify_email(&token).await.unwrap_err(),
            VerificationError::InternalRetryable { forfeited: false }
        );
    }
    assert_eq!(
        h.service.verify_email(&token).await.unwrap_err(),
        VerificationError::InternalRetryable { forfeited: true }
    );
    assert!(is_invalid(&h.service.verify_email(&token).await));
    assert_eq!(users.updates.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_update_gives_up_before_lease() {
    let users = Arc::new(StalledUsers::new());
    let h = harness_with(test_config(), users.clone());
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();

    let first = {
        let service = h.service.clone();
        let token = token.clone();
        tokio::spawn(async move { service.verify_email(&token).await })
    };
    users.entered.notified().await;

    // Wall time and the store's clock move past the lease together
    let past_lease = h.service.config().claim.lease() + Duration::from_secs(1);
    h.clock.advance(past_lease);
    tokio::time::advance(past_lease).await;

    let second = h.service.verify_email(&token).await;
    let first = first.await.unwrap();
    // A late reply from the stalled call has no caller left to report to
    users.release.notify_one();

    assert_eq!(
        first.unwrap_err(),
        VerificationError::InternalRetryable { forfeited: false }
    );
    assert!(!second.unwrap().already_verified);
    assert!(is_invalid(&h.service.verify_email(&token).await));
    assert_eq!(users.updates.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_update_rolls_back_claim() {
    let users = Arc::new(StalledUsers::new());
    let h = harness_with(test_config(), users.clone());
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(
        h.service.verify_email(&token).await.unwrap_err(),
        VerificationError::InternalRetryable { forfeited: false }
    );
    assert!(started.elapsed() < h.service.config().claim.lease());

    // Released at once, no need to wait out the lease
    let info = h.service.peek_token_info(&token).await.unwrap();
    assert!(!info.claimed);
    assert!(h.service.verify_email(&token).await.is_ok());
}

#[tokio::test]
async fn test_abandoned_claim_recovered_after_lease() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();

    let _abandoned = h
        .rogue_claimer()
        .claim(&token_hash(&token))
        .await
        .unwrap()
        .unwrap();

    // Held by someone else
    assert!(is_invalid(&h.service.verify_email(&token).await));
    assert!(h.service.peek_token_info(&token).await.unwrap().claimed);

    h.clock.advance(31 * Duration::from_secs(1));
    assert!(h.service.verify_email(&token).await.is_ok());
}

#[tokio::test]
async fn test_cleanup_releases_abandoned_claim() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();

    let _abandoned = h
        .rogue_claimer()
        .claim(&token_hash(&token))
        .await
        .unwrap()
        .unwrap();
    h.clock.advance(MINUTE);

    assert_eq!(h.service.cleanup_expired_tokens().await, 1);

    let stats = h.service.get_verification_stats().await.unwrap();
    assert_eq!(stats.available_tokens, 1);
    assert_eq!(stats.claimed_tokens, 0);
    assert!(!h.service.peek_token_info(&token).await.unwrap().claimed);
}

// =============================================================================
// Resend policy
// =============================================================================

#[tokio::test]
async fn test_resend_rate_limit_is_exact() {
    let mut config = test_config();
    config.resend.min_interval_secs = 0;
    let (h, users) = harness(config);
    users.insert(User::new("u1", "a@x.com"));

    let mut tokens = Vec::new();
    for _ in 0..3 {
        tokens.push(h.service.resend_verification_email("u1").await.unwrap());
    }
    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 3);

    assert_eq!(
        h.service.resend_verification_email("u1").await.unwrap_err(),
        VerificationError::RateLimited { retry_after: HOUR }
    );

    h.clock.advance(HOUR + Duration::from_secs(1));
    assert!(h.service.resend_verification_email("u1").await.is_ok());
    assert_eq!(h.service.metrics().resends_rate_limited.get(), 1);
}

#[tokio::test]
async fn test_resend_too_soon_until_interval() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));
    h.service.issue_token("u1", "a@x.com").await.unwrap();

    h.clock.advance(59 * MINUTE);
    assert_eq!(
        h.service.resend_verification_email("u1").await.unwrap_err(),
        VerificationError::TooSoon { retry_after: MINUTE }
    );

    h.clock.advance(MINUTE);
    assert!(h.service.resend_verification_email("u1").await.is_ok());
}

#[tokio::test]
async fn test_resend_allowed_near_expiry() {
    let mut config = test_config();
    config.token_validity_secs = 150 * 60;
    let (h, users) = harness(config);
    users.insert(User::new("u1", "a@x.com"));
    h.service.issue_token("u1", "a@x.com").await.unwrap();

    h.clock.advance(2 * HOUR);
    assert!(h.service.resend_verification_email("u1").await.is_ok());
}

#[tokio::test]
async fn test_resend_grace_overrides_interval() {
    let mut config = test_config();
    config.token_validity_secs = 90 * 60;
    let (h, users) = harness(config);
    users.insert(User::new("u1", "a@x.com"));
    h.service.issue_token("u1", "a@x.com").await.unwrap();

    // 70 minutes left: outside the grace window, wait for it
    h.clock.advance(20 * MINUTE);
    assert_eq!(
        h.service.resend_verification_email("u1").await.unwrap_err(),
        VerificationError::TooSoon {
            retry_after: 10 * MINUTE
        }
    );

    // 59 minutes left, still younger than the interval
    h.clock.advance(11 * MINUTE);
    assert!(h.service.resend_verification_email("u1").await.is_ok());
}

#[tokio::test]
async fn test_resend_for_verified_and_unknown_users() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();
    h.service.verify_email(&token).await.unwrap();

    assert_eq!(
        h.service.resend_verification_email("u1").await.unwrap_err(),
        VerificationError::AlreadyVerified
    );
    assert!(is_invalid(&h.service.resend_verification_email("ghost").await));
}

// =============================================================================
// Maintenance and introspection
// =============================================================================

#[tokio::test]
async fn test_cleanup_removes_stale_index_entries() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));
    users.insert(User::new("u2", "b@x.com"));
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();
    h.service.issue_token("u2", "b@x.com").await.unwrap();

    let keys = KeySpace::new(&h.service.config().storage.key_prefix);
    assert!(h.store.delete(&keys.token(&token_hash(&token))).await.unwrap());

    assert_eq!(h.service.get_verification_stats().await.unwrap().indexed_users, 2);
    assert_eq!(h.service.cleanup_expired_tokens().await, 1);

    let stats = h.service.get_verification_stats().await.unwrap();
    assert_eq!(stats.indexed_users, 1);
    assert_eq!(stats.available_tokens, 1);
    assert!(h.service.active_token_info("u1").await.unwrap().is_none());
    assert!(h.service.active_token_info("u2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_stats_by_state() {
    let (h, users) = harness(test_config());
    for id in ["u1", "u2", "u3"] {
        users.insert(User::new(id, "a@x.com"));
    }
    let first = h.service.issue_token("u1", "a@x.com").await.unwrap();
    h.service.issue_token("u2", "a@x.com").await.unwrap();
    h.service.issue_token("u3", "a@x.com").await.unwrap();

    let _held = h
        .rogue_claimer()
        .claim(&token_hash(&first))
        .await
        .unwrap()
        .unwrap();

    let stats = h.service.get_verification_stats().await.unwrap();
    assert_eq!(stats.available_tokens, 2);
    assert_eq!(stats.claimed_tokens, 1);
    assert_eq!(stats.expired_tokens, 0);
    assert_eq!(stats.malformed_tokens, 0);
    assert_eq!(stats.indexed_users, 3);
}

#[tokio::test]
async fn test_peek_leaves_token_untouched() {
    let (h, users) = harness(test_config());
    users.insert(User::new("u1", "a@x.com"));
    let token = h.service.issue_token("u1", "a@x.com").await.unwrap();

    for _ in 0..3 {
        let info = h.service.peek_token_info(&token).await.unwrap();
        assert_eq!(info.user_id, "u1");
        assert!(!info.claimed);
        assert_eq!(info.expires_at - info.created_at, chrono::Duration::hours(24));
    }

    assert!(h.service.verify_email(&token).await.is_ok());
    assert!(is_invalid(&h.service.peek_token_info(&token).await));
}
