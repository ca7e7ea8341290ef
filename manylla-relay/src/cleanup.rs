//! Background cleanup: purge expired invites and shares, forget idle buckets.

use crate::rate_limit::RateLimiter;
use crate::storage::RelayStorage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

pub fn spawn_cleanup_task(
    storage: RelayStorage,
    limiters: Vec<RateLimiter>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            match storage.purge_expired(chrono::Utc::now().timestamp_millis()) {
                Ok(0) => {}
                Ok(removed) => tracing::info!("Purged {} expired invites/shares", removed),
                Err(e) => tracing::error!("Cleanup error: {}", e),
            }
            let idle: usize = limiters.iter().map(RateLimiter::prune).sum();
            tracing::debug!("Cleanup completed, dropped {} idle rate buckets", idle);
        }
    })
}
