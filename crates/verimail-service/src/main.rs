//! Verimail sweeper
//!
//! Periodically releases abandoned claims and removes expired tokens and
//! stale user index entries.

use std::sync::Arc;

use anyhow::Result;
use prometheus::Registry;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use verimail_common::VERSION;
use verimail_service::{InMemoryUserRepository, VerificationConfig, VerificationService};
use verimail_store::{InMemoryStore, KeyValueStore, RedisStore, TimeoutStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting Verimail sweeper v{}", VERSION);

    let config = VerificationConfig::load()?;
    info!(
        prefix = %config.storage.key_prefix,
        interval_secs = config.sweep_interval_secs,
        lease_secs = config.claim.lease_secs,
        "Loaded configuration"
    );

    let backend: Arc<dyn KeyValueStore> = match &config.storage.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            info!("Connected to Redis");
            Arc::new(store)
        }
        None => {
            warn!("VERIMAIL_REDIS_URL not set, sweeping an in-process store");
            Arc::new(InMemoryStore::new())
        }
    };
    let store = Arc::new(TimeoutStore::new(backend, config.storage.timeout()));

    // Sweeps never consult the user store
    let users = Arc::new(InMemoryUserRepository::new());
    let service = VerificationService::new(config.clone(), store, users)?;

    let registry = Registry::new();
    service.metrics().register(&registry)?;

    let mut interval = tokio::time::interval(config.sweep_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let repaired = service.cleanup_expired_tokens().await;
                match service.get_verification_stats().await {
                    Ok(stats) => info!(
                        repaired,
                        available = stats.available_tokens,
                        claimed = stats.claimed_tokens,
                        expired = stats.expired_tokens,
                        indexed_users = stats.indexed_users,
                        "Sweep complete"
                    ),
                    Err(e) => warn!(repaired, error = %e, "Sweep complete, stats unavailable"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Shutting down Verimail sweeper");
    Ok(())
}
