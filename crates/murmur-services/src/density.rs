//! Replication density — how many copies of a status were seen lately.
//!
//! Every receipt of a status records one observation. Observations older
//! than the window no longer count:
//!
//!   density = 1 / (1 + copies seen in the window)
//!
//! so a status never seen has density 1 and a widely replicated one tends
//! towards 0.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use murmur_core::StatusId;

#[derive(Clone)]
pub struct ReplicationDensityWatcher {
    copies: Arc<DashMap<StatusId, VecDeque<Instant>>>,
    window: Duration,
}

impl ReplicationDensityWatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            copies: Arc::new(DashMap::new()),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one received copy of `status`.
    pub fn record_copy(&self, status: StatusId) {
        let now = Instant::now();
        let mut seen = self.copies.entry(status).or_default();
        expire(&mut seen, now, self.window);
        seen.push_back(now);
    }

    /// Copies of `status` seen within the window.
    pub fn copies(&self, status: &StatusId) -> usize {
        let now = Instant::now();
        self.copies
            .get(status)
            .map(|seen| {
                seen.iter()
                    .filter(|t| now.saturating_duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn density(&self, status: &StatusId) -> f32 {
        1.0 / (1.0 + self.copies(status) as f32)
    }

    /// Stop tracking a status, e.g. once it is deleted.
    pub fn forget(&self, status: &StatusId) {
        self.copies.remove(status);
    }

    /// Drop observations outside the window. Returns how many statuses are
    /// no longer tracked at all.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.copies.len();
        self.copies.retain(|_, seen| {
            expire(seen, now, self.window);
            !seen.is_empty()
        });
        before.saturating_sub(self.copies.len())
    }

    pub fn tracked(&self) -> usize {
        self.copies.len()
    }

    /// Prune every `interval` until `shutdown` fires.
    pub fn spawn_pruner(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("density pruner shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        let dropped = watcher.prune();
                        if dropped > 0 {
                            tracing::trace!(dropped, tracked = watcher.tracked(), "density pruned");
                        }
                    }
                }
            }
        })
    }
}

fn expire(seen: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = seen.front() {
        if now.saturating_duration_since(*oldest) >= window {
            seen.pop_front();
        } else {
            break;
        }
    }
}
