//! User store collaborator
//!
//! The durable user record belongs to another system. The service reads it
//! and asks for the verified transition; it never writes it any other way.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use verimail_common::{Clock, SystemClock, User};

/// Errors reported by the user store
#[derive(Debug, Clone, Error)]
pub enum UserStoreError {
    #[error("User not found")]
    NotFound,

    /// Transient failure, the same call may succeed later
    #[error("Retryable user store failure: {0}")]
    Retryable(String),

    #[error("User store failure: {0}")]
    Fatal(String),
}

/// Durable user store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Load a user by id
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, UserStoreError>;

    /// Set `email_verified_at = now` and `status = ACTIVE` in one transaction
    async fn update_verification_status(&self, user_id: &str) -> Result<User, UserStoreError>;
}

/// In-memory user store
///
/// Each update runs under the user's shard lock, so both fields change
/// together.
pub struct InMemoryUserRepository {
    users: DashMap<String, User>,
    clock: Arc<dyn Clock>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            users: DashMap::new(),
            clock,
        }
    }

    /// Insert or replace a user
    pub fn insert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Change a user's address, leaving verification state untouched
    pub fn set_email(&self, user_id: &str, email: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(mut user) => {
                user.email = email.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, user_id: &str) -> Option<User> {
        self.users.remove(user_id).map(|(_, user)| user)
    }

    pub fn get(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).map(|u| u.clone())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Default for InMemoryUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, UserStoreError> {
        Ok(self.get(user_id))
    }

    async fn update_verification_status(&self, user_id: &str) -> Result<User, UserStoreError> {
        let now = self.clock.now();
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or(UserStoreError::NotFound)?;
        user.mark_verified(now);
        Ok(user.clone())
    }
}
