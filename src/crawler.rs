use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    cleaner::{clean_text, UrlNormalizer},
    fetcher::{FetchError, PageFetcher},
    queue::Frontier,
    scope::{ScopeError, ScopePolicy},
    stats::{spawn_reporter, CrawlStats, StatsSnapshot},
    store::{build_document, DocumentStore, StoreError},
    writer::{BatchWriter, WriteError, WriterTotals, DEFAULT_BATCH_SIZE},
};

#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub max_links_per_page: usize,
    // in characters, after whitespace cleanup
    pub min_content_chars: usize,
    pub politeness: Duration,
    pub progress_interval: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: DEFAULT_BATCH_SIZE,
            max_links_per_page: 15,
            min_content_chars: 200,
            politeness: Duration::from_secs(1),
            progress_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub stats: StatsSnapshot,
    pub committed: usize,
    pub flushes: usize,
    pub failed_flushes: usize,
    pub rejected: usize,
    pub unflushed: usize,
}

#[derive(Clone)]
pub struct ShutdownHandle {
    frontier: Arc<Frontier>,
}

impl ShutdownHandle {
    pub async fn request(&self) {
        info!("shutdown requested; letting in-flight pages finish");
        self.frontier.stop().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageOutcome {
    Stored,
    Skipped,
}

#[derive(Clone)]
struct Worker {
    frontier: Arc<Frontier>,
    scope: Arc<ScopePolicy>,
    normalizer: Arc<UrlNormalizer>,
    fetcher: Arc<dyn PageFetcher>,
    writer: Arc<BatchWriter>,
    stats: CrawlStats,
    settings: CrawlSettings,
}

impl Worker {
    async fn run(self, id: usize) {
        debug!("worker {id} started");
        while let Some(url) = self.frontier.next().await {
            match AssertUnwindSafe(self.process(&url)).catch_unwind().await {
                Ok(PageOutcome::Stored) => self.stats.record_processed(),
                Ok(PageOutcome::Skipped) => self.stats.record_skipped(),
                Err(_) => {
                    error!("worker {id} panicked while handling {url}; moving on");
                    self.stats.record_error();
                    self.stats.record_skipped();
                }
            }
            self.frontier.complete().await;

            if !self.settings.politeness.is_zero() {
                sleep(self.settings.politeness).await;
            }
        }
        debug!("worker {id} finished");
    }

    async fn process(&self, url: &str) -> PageOutcome {
        let page = match self.fetcher.fetch(url).await {
            Ok(page) => page,
            Err(err) => {
                info!("skipping {url}: {err}");
                return PageOutcome::Skipped;
            }
        };

        let content = clean_text(&page.main_content);
        let chars = content.chars().count();
        if chars < self.settings.min_content_chars {
            info!("skipping {url}: only {chars} characters of content");
            return PageOutcome::Skipped;
        }

        let admitted = self.discover(&page.outbound_links).await;
        debug!("{url}: {admitted} new links queued");

        let doc = build_document(url, page.title, content);
        match self.writer.add(doc).await {
            Ok(_) => PageOutcome::Stored,
            Err(WriteError::Store(err)) => {
                warn!("document for {url} left pending: {err}");
                PageOutcome::Stored
            }
            Err(err @ WriteError::Rejected { .. }) => {
                self.stats.record_error();
                debug!("{err}");
                PageOutcome::Skipped
            }
        }
    }

    async fn discover(&self, links: &[String]) -> usize {
        let mut admitted = 0;
        for link in links {
            if admitted >= self.settings.max_links_per_page {
                break;
            }
            if !self.scope.allows(link) {
                continue;
            }
            let canonical = self.normalizer.normalize(link);
            if self.frontier.enqueue(&canonical).await {
                admitted += 1;
                self.stats.record_discovered();
            }
        }
        admitted
    }
}

pub struct Crawler {
    worker: Worker,
    store: DocumentStore,
}

impl Crawler {
    pub fn new(
        settings: CrawlSettings,
        store: DocumentStore,
        fetcher: Arc<dyn PageFetcher>,
        scope: ScopePolicy,
        normalizer: UrlNormalizer,
    ) -> Self {
        let writer = Arc::new(BatchWriter::new(store.clone(), settings.batch_size));
        Self {
            worker: Worker {
                frontier: Arc::new(Frontier::new()),
                scope: Arc::new(scope),
                normalizer: Arc::new(normalizer),
                fetcher,
                writer,
                stats: CrawlStats::new(),
                settings,
            },
            store,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            frontier: Arc::clone(&self.worker.frontier),
        }
    }

    #[cfg(test)]
    pub fn frontier(&self) -> &Frontier {
        &self.worker.frontier
    }

    /// Crawls outward from `seed` until the frontier runs dry or a shutdown
    /// is requested. The pending batch is flushed and the fetcher closed on
    /// every exit path.
    pub async fn run(&self, seed: &str) -> Result<CrawlSummary, CrawlerError> {
        let result = self.drive(seed).await;

        let flushed = self.worker.writer.flush().await;
        if let Err(err) = &flushed {
            error!("final flush failed: {err}");
        }
        self.worker.fetcher.close().await;

        let summary = self.summary().await;
        info!(
            "crawl finished: processed={} skipped={} committed={} unflushed={}",
            summary.stats.processed, summary.stats.skipped, summary.committed, summary.unflushed
        );

        result?;
        flushed?;
        Ok(summary)
    }

    async fn drive(&self, seed: &str) -> Result<(), CrawlerError> {
        let known = self.store.known_urls().await?;
        let seeded = self.worker.frontier.seed_visited(known).await;
        info!("{seeded} stored urls marked as visited");

        let seed = self.worker.normalizer.normalize(seed);
        if !self.worker.frontier.enqueue(&seed).await {
            info!("seed {seed} is already stored; nothing to crawl");
            return Ok(());
        }

        let workers = self.worker.settings.workers.max(1);
        info!("starting crawl from {seed} with {workers} workers");

        let reporter = spawn_reporter(
            self.worker.stats.clone(),
            Arc::clone(&self.worker.frontier),
            self.worker.settings.progress_interval,
        );

        let mut in_flight: FuturesUnordered<_> = (0..workers)
            .map(|id| tokio::spawn(self.worker.clone().run(id)))
            .collect();
        while let Some(joined) = in_flight.next().await {
            if let Err(join_err) = joined {
                error!("worker task join error: {join_err}");
                self.worker.stats.record_error();
            }
        }

        reporter.abort();
        Ok(())
    }

    pub async fn summary(&self) -> CrawlSummary {
        let WriterTotals {
            committed,
            flushes,
            failed_flushes,
            rejected,
            pending,
        } = self.worker.writer.totals().await;
        CrawlSummary {
            stats: self.worker.stats.snapshot(
                self.worker.frontier.len().await,
                self.worker.frontier.visited_len(),
            ),
            committed,
            flushes,
            failed_flushes,
            rejected,
            unflushed: pending,
        }
    }
}
