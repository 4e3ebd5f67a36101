use std::collections::{HashSet, VecDeque};

use dashmap::DashSet;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Url(String),
    // queue empty, but someone is still fetching
    Idle,
    Exhausted,
}

#[derive(Default)]
struct FrontierState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: usize,
    stopped: bool,
}

/// FIFO of canonical URLs awaiting a fetch, together with the visited set.
/// Both check-then-act paths run under the single state lock.
pub struct Frontier {
    state: Mutex<FrontierState>,
    visited: DashSet<String>,
    changed: Notify,
}

impl Frontier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FrontierState::default()),
            visited: DashSet::new(),
            changed: Notify::new(),
        }
    }

    pub async fn seed_visited<I>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let _state = self.state.lock().await;
        urls.into_iter()
            .filter(|url| self.visited.insert(url.clone()))
            .count()
    }

    pub async fn enqueue(&self, url: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.stopped || self.visited.contains(url) || state.queued.contains(url) {
            return false;
        }
        state.queued.insert(url.to_string());
        state.pending.push_back(url.to_string());
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// Takes the head of the queue, marking it visited and in flight in the
    /// same step. Callers must pair every `Claim::Url` with [`Frontier::complete`].
    pub async fn claim(&self) -> Claim {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Claim::Exhausted;
        }
        match state.pending.pop_front() {
            Some(url) => {
                state.queued.remove(&url);
                self.visited.insert(url.clone());
                state.in_flight += 1;
                Claim::Url(url)
            }
            None if state.in_flight > 0 => Claim::Idle,
            None => Claim::Exhausted,
        }
    }

    pub async fn complete(&self) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.changed.notify_waiters();
    }

    /// Waits for the next work item, sleeping while other workers are still
    /// fetching. Returns `None` once the pool as a whole has run dry.
    pub async fn next(&self) -> Option<String> {
        loop {
            // Registered before inspecting state so a wakeup between the
            // check and the await is not lost.
            let notified = self.changed.notified();
            match self.claim().await {
                Claim::Url(url) => return Some(url),
                Claim::Exhausted => return None,
                Claim::Idle => notified.await,
            }
        }
    }

    pub async fn stop(&self) {
        self.state.lock().await.stopped = true;
        self.changed.notify_waiters();
    }

    #[cfg(test)]
    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }

    #[cfg(test)]
    pub fn is_visited(&self, url: &str) -> bool {
        self.visited.contains(url)
    }

    pub fn visited_len(&self) -> usize {
        self.visited.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn fifo_order_without_duplicates() {
        let frontier = Frontier::new();
        assert!(frontier.enqueue("https://a.test/1").await);
        assert!(frontier.enqueue("https://a.test/2").await);
        assert!(!frontier.enqueue("https://a.test/1").await);
        assert_eq!(frontier.len().await, 2);

        assert_eq!(frontier.claim().await, Claim::Url("https://a.test/1".into()));
        assert_eq!(frontier.claim().await, Claim::Url("https://a.test/2".into()));
        assert_eq!(frontier.claim().await, Claim::Idle);
        frontier.complete().await;
        frontier.complete().await;
        assert_eq!(frontier.claim().await, Claim::Exhausted);
    }

    #[tokio::test]
    async fn visited_urls_are_never_requeued() {
        let frontier = Frontier::new();
        assert_eq!(frontier.seed_visited(vec!["https://a.test/old".to_string()]).await, 1);
        assert!(!frontier.enqueue("https://a.test/old").await);

        frontier.enqueue("https://a.test/new").await;
        assert_eq!(frontier.claim().await, Claim::Url("https://a.test/new".into()));
        assert!(frontier.is_visited("https://a.test/new"));
        assert!(!frontier.enqueue("https://a.test/new").await);
        assert_eq!(frontier.visited_len(), 2);
    }

    #[tokio::test]
    async fn idle_worker_wakes_when_work_is_discovered() {
        let frontier = Arc::new(Frontier::new());
        frontier.enqueue("https://a.test/root").await;
        assert_eq!(frontier.next().await.as_deref(), Some("https://a.test/root"));

        let waiter = {
            let frontier = Arc::clone(&frontier);
            tokio::spawn(async move { frontier.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        frontier.enqueue("https://a.test/child").await;
        frontier.complete().await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("waiter joined");
        assert_eq!(got.as_deref(), Some("https://a.test/child"));
    }

    #[tokio::test]
    async fn idle_worker_exits_when_last_fetch_completes() {
        let frontier = Arc::new(Frontier::new());
        frontier.enqueue("https://a.test/root").await;
        frontier.next().await;

        let waiter = {
            let frontier = Arc::clone(&frontier);
            tokio::spawn(async move { frontier.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        frontier.complete().await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("waiter joined");
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn stop_drains_nothing_further() {
        let frontier = Frontier::new();
        frontier.enqueue("https://a.test/1").await;
        frontier.stop().await;
        assert!(frontier.is_stopped().await);
        assert_eq!(frontier.claim().await, Claim::Exhausted);
        assert!(!frontier.enqueue("https://a.test/2").await);
    }
}
