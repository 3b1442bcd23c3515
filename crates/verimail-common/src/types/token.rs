//! Verification token records
//!
//! A token lives in the key-value store as a [`TokenRecord`]: a small JSON
//! envelope holding the claim state and retry count next to the encoded
//! [`TokenMetadata`]. The envelope is what the claim protocol swaps
//! atomically; the metadata is only decoded once a claim has been won.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subject and validity window captured when the token was issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    /// Subject of the verification
    pub user_id: String,
    /// Address being confirmed, as it was at issuance
    pub email: String,
    /// blake3 hex digest of the token this metadata was issued for
    pub token_hash: String,
    /// Issuance time
    pub created_at: DateTime<Utc>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
}

impl TokenMetadata {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time since issuance
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// Time left before expiry (negative once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

/// Claim state of a stored token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimState {
    /// Redeemable
    Available,
    /// Reserved by an in-flight redemption until `lease_expires_at`
    Claimed {
        claim_id: String,
        claimed_at: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    },
}

/// Stored envelope for a verification token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub state: ClaimState,
    /// Number of rollbacks so far
    pub retries: u32,
    /// Absolute expiry, duplicated from the metadata so the claim protocol
    /// can reject expired tokens without decoding the payload
    pub expires_at: DateTime<Utc>,
    /// Codec-encoded [`TokenMetadata`]
    pub metadata: String,
}

impl TokenRecord {
    /// Create an available record
    pub fn available(expires_at: DateTime<Utc>, metadata: String) -> Self {
        Self {
            state: ClaimState::Available,
            retries: 0,
            expires_at,
            metadata,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self.state, ClaimState::Claimed { .. })
    }

    /// Whether a claim on this record has outlived its lease
    pub fn lease_elapsed(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            ClaimState::Available => false,
            ClaimState::Claimed {
                lease_expires_at, ..
            } => now >= *lease_expires_at,
        }
    }

    /// Copy of this record in the claimed state
    pub fn claimed(
        &self,
        claim_id: String,
        claimed_at: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            state: ClaimState::Claimed {
                claim_id,
                claimed_at,
                lease_expires_at,
            },
            ..self.clone()
        }
    }

    /// Copy of this record released back to available with one more retry
    pub fn released(&self) -> Self {
        Self {
            state: ClaimState::Available,
            retries: self.retries.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Read-only view of a token, returned by peeks and index lookups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub user_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Whether a redemption currently holds the token
    pub claimed: bool,
}

impl TokenInfo {
    pub fn from_parts(metadata: TokenMetadata, record: &TokenRecord) -> Self {
        Self {
            user_id: metadata.user_id,
            email: metadata.email,
            created_at: metadata.created_at,
            expires_at: metadata.expires_at,
            claimed: record.is_claimed(),
        }
    }
}
