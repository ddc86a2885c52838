//! Background sweeper for expired tokens.
//!
//! Lookups re-check expiry on their own; the sweeper just keeps the
//! maps from accumulating dead grants.

use crate::config::TokenConfig;
use crate::credentials::CredentialsManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn the sweeper task. Returns a handle that can be aborted.
pub fn spawn_sweeper(
    credentials: Arc<CredentialsManager>,
    config: TokenConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.sweep_enabled {
            tracing::info!("token sweeper disabled");
            return;
        }

        tracing::info!(
            "token sweeper started (interval: {}s)",
            config.sweep_interval_secs
        );
        let mut timer = interval(Duration::from_secs(config.sweep_interval_secs));

        loop {
            timer.tick().await;
            let removed = credentials.sweep();
            if removed > 0 {
                tracing::info!("sweeper removed {removed} expired tokens");
            } else {
                tracing::debug!("sweeper found no expired tokens");
            }
        }
    })
}
