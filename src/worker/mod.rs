//! Worker: the pipeline state machine.
//!
//! A single logical execution context drives every item through
//! fetch → moderate → broadcast, so at most one item is ever in
//! `downloading` or `playing` across the whole system. The worker is the
//! only mutator of item status; the command surface communicates with it
//! through the persistent queue plus the sink's skip signal.
//!
//! Per-item automaton:
//!
//! ```text
//!    pending ──▶ downloading ──▶ fetch-fail ─▶ failed
//!                     │
//!                     ▼
//!                moderating ──▶ reject ─▶ failed
//!                     │
//!                     ▼
//!                 playing ──▶ stream-end ─▶ done
//!                     │
//!                     └─▶ skip / encoder-fail ─▶ failed
//! ```
//!
//! Failures never escape the loop: every error lands on the item as a
//! terminal `failed` with its reason, local media is deleted, and the loop
//! continues (after a short backoff for store-level failures, to avoid
//! spinning on a broken database).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::broadcast::{StreamOutcome, StreamSink};
use crate::fetch::MediaFetcher;
use crate::moderate::ContentGate;
use crate::queue::{Queue, QueueItem, QueueStatus};

/// Idle filler duration between dequeue polls.
const IDLE_DURATION: Duration = Duration::from_secs(30);

/// Backoff after a store-level failure, to avoid tight failure loops.
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Error recorded when a clip is skipped mid-stream.
const SKIPPED_REASON: &str = "skipped";

/// Error recorded when the encoder fails mid-stream.
const ENCODER_FAILED_REASON: &str = "encoder_failed";

/// Queue-driven pipeline worker.
pub struct Worker {
    queue: Queue,
    fetcher: Arc<dyn MediaFetcher>,
    gate: Arc<dyn ContentGate>,
    sink: Arc<dyn StreamSink>,
    running: AtomicBool,
    idle_duration: Duration,
    failure_backoff: Duration,
}

impl Worker {
    /// Creates a worker over its collaborators.
    #[must_use]
    pub fn new(
        queue: Queue,
        fetcher: Arc<dyn MediaFetcher>,
        gate: Arc<dyn ContentGate>,
        sink: Arc<dyn StreamSink>,
    ) -> Self {
        Self {
            queue,
            fetcher,
            gate,
            sink,
            running: AtomicBool::new(false),
            idle_duration: IDLE_DURATION,
            failure_backoff: FAILURE_BACKOFF,
        }
    }

    /// Overrides loop timings. Used by tests.
    #[must_use]
    pub fn with_timings(mut self, idle: Duration, backoff: Duration) -> Self {
        self.idle_duration = idle;
        self.failure_backoff = backoff;
        self
    }

    /// Runs the pipeline loop until [`Worker::stop`] is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("worker started");

        while self.running.load(Ordering::SeqCst) {
            let item = match self.queue.dequeue().await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    self.sink.stream_idle(self.idle_duration).await;
                    continue;
                }
                Err(err) => {
                    // Read failures degrade to "queue looks empty"
                    warn!(error = %err, "dequeue failed, idling");
                    self.sink.stream_idle(self.idle_duration).await;
                    continue;
                }
            };

            self.process_item(item).await;
        }

        info!("worker stopped");
    }

    /// Skips the clip currently on air, if any.
    pub fn skip(&self) {
        self.sink.skip();
    }

    /// Requests a clean stop: interrupts the current stream and lets the
    /// loop exit after the in-flight item is finalised.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sink.skip();
    }

    /// Returns true while the loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, item), fields(id = %item.id, url = %item.url))]
    async fn process_item(&self, mut item: QueueItem) {
        info!(submitted_by = %item.submitted_by, "processing submission");

        if let Err(err) = self
            .queue
            .update_status(&item.id, QueueStatus::Downloading, None)
            .await
        {
            error!(error = %err, "store_write_failed: could not claim item");
            tokio::time::sleep(self.failure_backoff).await;
            return;
        }

        if let Err(err) = self.fetcher.fetch(&mut item).await {
            warn!(error = %err, "fetch failed");
            self.fail(&item, &err.to_string()).await;
            return;
        }

        let Some(path) = item.local_path() else {
            // fetch() succeeded without setting a path
            self.fail(&item, "download_failed: no file produced").await;
            return;
        };

        let verdict = self.gate.check(&path).await;
        if let Some(reason) = verdict.reason() {
            self.fail(&item, reason).await;
            return;
        }

        item.status_str = QueueStatus::Playing.as_str().to_string();
        item.error_message = None;
        if let Err(err) = self.queue.update_item(&item).await {
            error!(error = %err, "store_write_failed: could not mark item playing");
            self.fetcher.cleanup(&item);
            tokio::time::sleep(self.failure_backoff).await;
            return;
        }

        let outcome = self
            .sink
            .stream_file(
                &path,
                &item.title,
                &item.submitted_by,
                item.promo_link.as_deref(),
            )
            .await;

        let (status, error) = match outcome {
            StreamOutcome::Completed => (QueueStatus::Done, None),
            StreamOutcome::Skipped => (QueueStatus::Failed, Some(SKIPPED_REASON)),
            StreamOutcome::Failed => (QueueStatus::Failed, Some(ENCODER_FAILED_REASON)),
        };

        if let Err(err) = self.queue.update_status(&item.id, status, error).await {
            error!(error = %err, "store_write_failed: could not finalise item");
        }
        self.fetcher.cleanup(&item);
    }

    /// Marks an item failed (best effort) and removes its local media.
    async fn fail(&self, item: &QueueItem, reason: &str) {
        if let Err(err) = self
            .queue
            .update_status(&item.id, QueueStatus::Failed, Some(reason))
            .await
        {
            error!(error = %err, "store_write_failed: could not mark item failed");
            tokio::time::sleep(self.failure_backoff).await;
        }
        self.fetcher.cleanup(item);
    }
}
