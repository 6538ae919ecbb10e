//! Background cache cleanup task.
//!
//! Periodically evicts expired tokens so caches for rarely requested keys do
//! not hold dead entries until the next insert.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::store::TokenCache;
use crate::token::Expiring;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// A cache the cleanup task can sweep.
pub trait Sweep: Send + Sync {
    fn label(&self) -> &'static str;
    fn sweep(&self) -> usize;
    fn entries(&self) -> usize;
}

impl<K, V> Sweep for TokenCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send,
    V: Expiring + Clone + Send + Sync,
{
    fn label(&self) -> &'static str {
        self.name()
    }

    fn sweep(&self) -> usize {
        self.evict_expired()
    }

    fn entries(&self) -> usize {
        self.len()
    }
}

/// Spawn a background task that periodically evicts expired cache entries.
///
/// The task stops when `shutdown` is cancelled.
pub fn spawn_cleanup_task(
    caches: Vec<Arc<dyn Sweep>>,
    cleanup_interval_secs: u64,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Cache cleanup task stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            for cache in &caches {
                let evicted = cache.sweep();
                if evicted > 0 {
                    info!(cache = cache.label(), evicted, "Cache cleanup completed");
                } else {
                    debug!(cache = cache.label(), "Cache cleanup: no expired entries");
                }
                debug!(cache = cache.label(), entries = cache.entries(), "Cache status");
            }
        }
    })
}
