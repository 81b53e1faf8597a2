//! Background jobs: periodic housekeeping that runs alongside the axum
//! server and the Delivery Worker. Grounded on the teacher's
//! `jobs/data_compaction.rs` loop shape (`tokio::time::interval`, one
//! `tracing::info!`/`error!` per tick) but retargeted at this schema: there
//! is no message/event retention policy here, so the sweep targets are the
//! `sessions` table's own `expires_at` column and the in-process rate
//! limiter's token-bucket map.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info};

use crate::db::Store;
use crate::middleware::RateLimiter;

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}

/// Periodically flips expired sessions to `is_active = false` (spec §6.4's
/// session lifecycle). `Session::is_logged_in` already treats an expired
/// session as logged out on read, so this only bounds the size of the
/// `sessions_user` partial index over time.
pub async fn run_session_sweep(store: Arc<Store>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let period = env_secs("SESSION_SWEEP_INTERVAL_SECS", 3600);
    let mut ticker = interval(period);
    info!(period_secs = period.as_secs(), "starting session sweep job");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }

        match store.deactivate_expired_sessions().await {
            Ok(0) => info!("session sweep: no expired sessions"),
            Ok(count) => info!(count, "session sweep: deactivated expired sessions"),
            Err(err) => error!(error = %err, "session sweep failed"),
        }
    }
}

/// Periodically evicts token buckets that haven't been touched recently, so
/// the rate limiter's map doesn't grow unbounded with one-shot callers.
pub async fn run_rate_limit_sweep(limiter: RateLimiter, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let period = env_secs("RATE_LIMIT_SWEEP_INTERVAL_SECS", 300);
    let max_age = env_secs("RATE_LIMIT_BUCKET_MAX_AGE_SECS", 1800);
    let mut ticker = interval(period);
    info!(period_secs = period.as_secs(), "starting rate limiter bucket sweep job");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }

        let evicted = limiter.sweep(max_age);
        if evicted > 0 {
            info!(evicted, "rate limiter sweep: evicted stale buckets");
        }
    }
}
