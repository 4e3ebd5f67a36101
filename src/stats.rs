use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::info;

use crate::queue::Frontier;

/// Counters shared by every worker. All of them only ever go up.
#[derive(Clone)]
pub struct CrawlStats {
    started_at: DateTime<Utc>,
    processed: Arc<AtomicUsize>,
    skipped: Arc<AtomicUsize>,
    discovered: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            processed: Arc::new(AtomicUsize::new(0)),
            skipped: Arc::new(AtomicUsize::new(0)),
            discovered: Arc::new(AtomicUsize::new(0)),
            errors: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn discovered(&self) -> usize {
        self.discovered.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, queue_len: usize, visited_len: usize) -> StatsSnapshot {
        let ended_at = Utc::now();
        StatsSnapshot {
            started_at: self.started_at,
            ended_at,
            duration_secs: ended_at
                .signed_duration_since(self.started_at)
                .num_seconds()
                .max(0),
            processed: self.processed(),
            skipped: self.skipped(),
            discovered: self.discovered(),
            errors: self.errors.load(Ordering::Relaxed),
            queue_len,
            visited_len,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub processed: usize,
    pub skipped: usize,
    pub discovered: usize,
    pub errors: usize,
    pub queue_len: usize,
    pub visited_len: usize,
}

/// Logs counters and frontier depth on a fixed interval until aborted.
/// Only reads shared state.
pub fn spawn_reporter(
    stats: CrawlStats,
    frontier: Arc<Frontier>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let queue_len = frontier.len().await;
            info!(
                "progress: processed={} skipped={} queue={} in_flight={} visited={}",
                stats.processed(),
                stats.skipped(),
                queue_len,
                frontier.in_flight().await,
                frontier.visited_len(),
            );
        }
    })
}
