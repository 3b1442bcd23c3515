//! Verification service configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use verimail_common::{Result, VerificationError};

/// Verification service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// How long an issued token stays redeemable
    pub token_validity_secs: u64,
    /// Resend throttling
    pub resend: ResendSettings,
    /// Claim protocol
    pub claim: ClaimSettings,
    /// Response-time normalization
    pub timing: TimingSettings,
    /// Store connection and key layout
    pub storage: StorageSettings,
    /// Interval between maintenance sweeps in the sweeper binary
    pub sweep_interval_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            token_validity_secs: verimail_common::DEFAULT_TOKEN_VALIDITY_SECS,
            resend: ResendSettings::default(),
            claim: ClaimSettings::default(),
            timing: TimingSettings::default(),
            storage: StorageSettings::default(),
            sweep_interval_secs: 60,
        }
    }
}

impl VerificationConfig {
    /// Load configuration from environment and `.env`
    pub fn load() -> Result<Self> {
        // Try to load .env file
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();

        env_override("VERIMAIL_TOKEN_VALIDITY_SECS", &mut cfg.token_validity_secs)?;
        env_override("VERIMAIL_SWEEP_INTERVAL_SECS", &mut cfg.sweep_interval_secs)?;

        // Resend settings
        env_override("VERIMAIL_RESEND_LIMIT", &mut cfg.resend.limit)?;
        env_override("VERIMAIL_RESEND_WINDOW_SECS", &mut cfg.resend.window_secs)?;
        env_override(
            "VERIMAIL_MIN_RESEND_INTERVAL_SECS",
            &mut cfg.resend.min_interval_secs,
        )?;
        env_override(
            "VERIMAIL_EXPIRY_GRACE_SECS",
            &mut cfg.resend.expiry_grace_secs,
        )?;

        // Claim settings
        env_override("VERIMAIL_CLAIM_LEASE_SECS", &mut cfg.claim.lease_secs)?;
        env_override(
            "VERIMAIL_MAX_ROLLBACK_RETRIES",
            &mut cfg.claim.max_rollback_retries,
        )?;
        env_override(
            "VERIMAIL_USER_STORE_TIMEOUT_MS",
            &mut cfg.claim.user_store_timeout_ms,
        )?;

        // Timing settings
        env_override("VERIMAIL_MIN_DELAY_MS", &mut cfg.timing.min_delay_ms)?;
        env_override("VERIMAIL_MAX_DELAY_MS", &mut cfg.timing.max_delay_ms)?;

        // Storage settings
        if let Ok(url) = std::env::var("VERIMAIL_REDIS_URL") {
            cfg.storage.redis_url = Some(url);
        }
        if let Ok(prefix) = std::env::var("VERIMAIL_KEY_PREFIX") {
            cfg.storage.key_prefix = prefix;
        }
        env_override("VERIMAIL_STORE_TIMEOUT_MS", &mut cfg.storage.timeout_ms)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.token_validity_secs == 0 {
            return Err(config_error("token validity must be positive"));
        }
        if self.resend.limit == 0 || self.resend.window_secs == 0 {
            return Err(config_error("resend limit and window must be positive"));
        }
        if self.claim.lease_secs == 0 {
            return Err(config_error("claim lease must be positive"));
        }
        if self.claim.lease_secs >= self.token_validity_secs {
            return Err(config_error("claim lease must be shorter than token validity"));
        }
        if self.claim.user_store_timeout_ms == 0
            || self.claim.user_store_timeout() >= self.claim.lease()
        {
            return Err(config_error(
                "user store timeout must be positive and shorter than the claim lease",
            ));
        }
        if self.timing.min_delay_ms > self.timing.max_delay_ms {
            return Err(config_error("min delay exceeds max delay"));
        }
        if self.storage.key_prefix.is_empty() || self.storage.key_prefix.contains('*') {
            return Err(config_error("key prefix must be non-empty and contain no wildcard"));
        }
        if self.storage.timeout_ms == 0 {
            return Err(config_error("store timeout must be positive"));
        }
        Ok(())
    }

    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn config_error(msg: &str) -> VerificationError {
    VerificationError::Config(msg.to_string())
}

fn env_override<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<()> {
    if let Ok(val) = std::env::var(name) {
        *target = val
            .trim()
            .parse()
            .map_err(|_| VerificationError::Config(format!("{} is not a valid value", name)))?;
    }
    Ok(())
}

/// Resend throttling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResendSettings {
    /// Resends allowed per window
    pub limit: u64,
    /// Rate-limit window in seconds
    pub window_secs: u64,
    /// Minimum age of the active token before another can be sent
    pub min_interval_secs: u64,
    /// Resends are always allowed this close to the active token's expiry
    pub expiry_grace_secs: u64,
}

impl Default for ResendSettings {
    fn default() -> Self {
        Self {
            limit: verimail_common::DEFAULT_RESEND_LIMIT,
            window_secs: verimail_common::DEFAULT_RESEND_WINDOW_SECS,
            min_interval_secs: verimail_common::DEFAULT_MIN_RESEND_INTERVAL_SECS,
            expiry_grace_secs: verimail_common::DEFAULT_EXPIRY_GRACE_SECS,
        }
    }
}

impl ResendSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn expiry_grace(&self) -> Duration {
        Duration::from_secs(self.expiry_grace_secs)
    }
}

/// Claim protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimSettings {
    /// How long a claim may be held before the sweep releases it
    pub lease_secs: u64,
    /// Rollbacks allowed before the token is forfeited
    pub max_rollback_retries: u32,
    /// Deadline for each user store call made while holding a claim, in
    /// milliseconds. Must be shorter than the lease.
    pub user_store_timeout_ms: u64,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            lease_secs: verimail_common::DEFAULT_CLAIM_LEASE_SECS,
            max_rollback_retries: verimail_common::DEFAULT_MAX_ROLLBACK_RETRIES,
            user_store_timeout_ms: verimail_common::DEFAULT_USER_STORE_TIMEOUT_MS,
        }
    }
}

impl ClaimSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn user_store_timeout(&self) -> Duration {
        Duration::from_millis(self.user_store_timeout_ms)
    }
}

/// Response-time normalization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Lower bound of the total verify duration in milliseconds
    pub min_delay_ms: u64,
    /// Upper bound of the total verify duration in milliseconds
    pub max_delay_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: verimail_common::DEFAULT_MIN_DELAY_MS,
            max_delay_ms: verimail_common::DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// Store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Redis connection URL (in-memory store when unset)
    pub redis_url: Option<String>,
    /// Namespace for every key this service writes
    pub key_prefix: String,
    /// Per-call store timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "verimail".to_string(),
            timeout_ms: 2000,
        }
    }
}

impl StorageSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
