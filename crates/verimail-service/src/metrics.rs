//! Prometheus metrics for the verification service

use prometheus::{IntCounter, Registry};

/// Counters for token lifecycle events
pub struct VerificationMetrics {
    pub tokens_issued: IntCounter,
    pub verifications_succeeded: IntCounter,
    pub verifications_rejected: IntCounter,
    pub resends_rate_limited: IntCounter,
    pub resends_too_soon: IntCounter,
    pub claims_rolled_back: IntCounter,
    pub claims_forfeited: IntCounter,
    pub sweep_repaired: IntCounter,
}

impl VerificationMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            tokens_issued: IntCounter::new(
                "verimail_tokens_issued_total",
                "Verification tokens issued",
            )?,
            verifications_succeeded: IntCounter::new(
                "verimail_verifications_succeeded_total",
                "Successful email verifications, including idempotent repeats",
            )?,
            verifications_rejected: IntCounter::new(
                "verimail_verifications_rejected_total",
                "Verifications rejected as invalid or expired",
            )?,
            resends_rate_limited: IntCounter::new(
                "verimail_resends_rate_limited_total",
                "Resend requests denied by the rate limiter",
            )?,
            resends_too_soon: IntCounter::new(
                "verimail_resends_too_soon_total",
                "Resend requests denied because a recent token is active",
            )?,
            claims_rolled_back: IntCounter::new(
                "verimail_claims_rolled_back_total",
                "Claims released after a user store failure",
            )?,
            claims_forfeited: IntCounter::new(
                "verimail_claims_forfeited_total",
                "Tokens deleted without a successful verification",
            )?,
            sweep_repaired: IntCounter::new(
                "verimail_sweep_repaired_total",
                "Records repaired or removed by maintenance sweeps",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.tokens_issued.clone()))?;
        registry.register(Box::new(self.verifications_succeeded.clone()))?;
        registry.register(Box::new(self.verifications_rejected.clone()))?;
        registry.register(Box::new(self.resends_rate_limited.clone()))?;
        registry.register(Box::new(self.resends_too_soon.clone()))?;
        registry.register(Box::new(self.claims_rolled_back.clone()))?;
        registry.register(Box::new(self.claims_forfeited.clone()))?;
        registry.register(Box::new(self.sweep_repaired.clone()))?;
        Ok(())
    }
}
