//! User record as seen by the verification service
//!
//! The record is owned by the external user store; the service only reads
//! it and asks the store to flip it to verified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Inactive,
    Active,
}

/// Durable user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub status: UserStatus,
}

impl User {
    /// Create a new unverified, inactive user
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            email_verified_at: None,
            status: UserStatus::Inactive,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }

    /// Case-insensitive comparison against the current address
    pub fn email_matches(&self, email: &str) -> bool {
        self.email.trim().eq_ignore_ascii_case(email.trim())
    }

    /// Apply the verified transition: both fields change together
    pub fn mark_verified(&mut self, at: DateTime<Utc>) {
        self.email_verified_at = Some(at);
        self.status = UserStatus::Active;
    }
}
