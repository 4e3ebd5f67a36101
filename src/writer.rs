use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::Mutex, time::sleep};
use tracing::{error, info, warn};

use crate::store::{Document, DocumentStore, StoreError};

pub const DEFAULT_BATCH_SIZE: usize = 20;
// consecutive failed commits before logging at error level, and the number
// of commit attempts a full batch gets before a new document is refused
const ESCALATE_AFTER: usize = 3;
const FULL_BATCH_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pending batch is full and the store keeps failing; refused {url}: {source}")]
    Rejected {
        url: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterTotals {
    pub committed: usize,
    pub flushes: usize,
    pub failed_flushes: usize,
    pub rejected: usize,
    pub pending: usize,
}

/// Buffers documents and commits them in fixed-size transactions. The pending
/// batch never holds more than `batch_size` documents.
pub struct BatchWriter {
    store: DocumentStore,
    batch_size: usize,
    backoff: Duration,
    pending: Mutex<Vec<Document>>,
    committed: AtomicUsize,
    flushes: AtomicUsize,
    failed_flushes: AtomicUsize,
    rejected: AtomicUsize,
    consecutive_failures: AtomicUsize,
}

impl BatchWriter {
    pub fn new(store: DocumentStore, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            backoff: FULL_BATCH_BACKOFF,
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            committed: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            failed_flushes: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            consecutive_failures: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Queues a document, committing the batch once it reaches the threshold.
    ///
    /// If an earlier commit failed and left a full batch behind, that batch is
    /// retried with backoff first, holding the lock so other callers wait too.
    /// When it still cannot be written the new document is refused with
    /// [`WriteError::Rejected`] and the batch is kept as is.
    pub async fn add(&self, doc: Document) -> Result<usize, WriteError> {
        let mut pending = self.pending.lock().await;
        let mut written = 0;
        if pending.len() >= self.batch_size {
            match self.commit_with_backoff(&mut pending).await {
                Ok(n) => written = n,
                Err(source) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "pending batch of {} documents cannot be committed; refusing {}",
                        pending.len(),
                        doc.url
                    );
                    return Err(WriteError::Rejected {
                        url: doc.url,
                        source,
                    });
                }
            }
        }

        pending.push(doc);
        if pending.len() >= self.batch_size {
            written += self.commit(&mut pending).await?;
        }
        Ok(written)
    }

    pub async fn flush(&self) -> Result<usize, StoreError> {
        let mut pending = self.pending.lock().await;
        self.commit(&mut pending).await
    }

    async fn commit_with_backoff(
        &self,
        pending: &mut Vec<Document>,
    ) -> Result<usize, StoreError> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.commit(pending).await {
                Ok(written) => return Ok(written),
                Err(err) if attempt >= ESCALATE_AFTER => return Err(err),
                Err(_) => {
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn commit(&self, pending: &mut Vec<Document>) -> Result<usize, StoreError> {
        if pending.is_empty() {
            return Ok(0);
        }

        match self.store.upsert_batch(pending).await {
            Ok(written) => {
                pending.clear();
                self.committed.fetch_add(written, Ordering::Relaxed);
                self.flushes.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!("committed batch of {written} documents");
                Ok(written)
            }
            Err(err) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= ESCALATE_AFTER {
                    error!(
                        "batch of {} documents failed to commit {failures} times in a row: {err}",
                        pending.len()
                    );
                } else {
                    warn!(
                        "batch commit failed, keeping {} documents for retry: {err}",
                        pending.len()
                    );
                }
                Err(err)
            }
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn totals(&self) -> WriterTotals {
        WriterTotals {
            committed: self.committed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            pending: self.pending_len().await,
        }
    }
}
