//! Forwards queued readings to the remote store.
//!
//! Each reading is resolved to its remote tag id, then published with
//! bounded retries under an idempotency key. Readings that cannot be
//! delivered are dropped with a log entry and an observer callback; the
//! scan thread is never blocked by the backend.

use crate::protocol::{idempotency_key, IngestRecord};
use crate::resolver::{TagResolutionError, TagResolver, DEFAULT_CATALOG_REFRESH};
use crate::retry::RetryPolicy;
use crate::store::{RemoteStore, StoreError};
use kora_core::queue::ReadingQueue;
use kora_core::tags::{Reading, TagRegistry};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    pub catalog_refresh: Duration,
    /// Sleep between polls of an empty queue.
    pub idle_poll: Duration,
    /// How long a stopping consumer keeps draining the queue.
    pub drain_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            catalog_refresh: DEFAULT_CATALOG_REFRESH,
            idle_poll: Duration::from_millis(50),
            drain_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("backend rejected reading after {attempts} attempt(s): {source}")]
    Rejected {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl PublishError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Rejected { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Why a reading never reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Unresolved,
    Rejected,
    Exhausted,
    Shutdown,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Rejected => "rejected",
            Self::Exhausted => "exhausted",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Published { remote_tag: i64, attempts: u32 },
    Unresolved(TagResolutionError),
    Failed(PublishError),
}

impl SyncOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }
}

/// Hooks for metrics, audit and alerting.
pub trait SyncObserver: Send + Sync {
    fn on_published(&self, _reading: &Reading, _attempts: u32) {}

    fn on_retry(&self, _reading: &Reading, _attempt: u32, _error: &StoreError) {}

    fn on_dropped(&self, reading: &Reading, reason: DropReason, detail: &str);
}

/// Observer that relies on the sync loop's own logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {
    fn on_dropped(&self, _reading: &Reading, _reason: DropReason, _detail: &str) {}
}

#[derive(Debug, Default)]
pub struct SyncStats {
    published: AtomicU64,
    retries: AtomicU64,
    dropped_unresolved: AtomicU64,
    dropped_rejected: AtomicU64,
    dropped_exhausted: AtomicU64,
    abandoned_on_shutdown: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatsSnapshot {
    pub published: u64,
    pub retries: u64,
    pub dropped_unresolved: u64,
    pub dropped_rejected: u64,
    pub dropped_exhausted: u64,
    pub abandoned_on_shutdown: u64,
}

impl SyncStats {
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped_unresolved: self.dropped_unresolved.load(Ordering::Relaxed),
            dropped_rejected: self.dropped_rejected.load(Ordering::Relaxed),
            dropped_exhausted: self.dropped_exhausted.load(Ordering::Relaxed),
            abandoned_on_shutdown: self.abandoned_on_shutdown.load(Ordering::Relaxed),
        }
    }
}

impl SyncStatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_unresolved
            + self.dropped_rejected
            + self.dropped_exhausted
            + self.abandoned_on_shutdown
    }
}

pub struct BackendSync<S: RemoteStore> {
    store: S,
    registry: Arc<TagRegistry>,
    queue: Arc<ReadingQueue>,
    resolver: TagResolver,
    config: SyncConfig,
    stats: Arc<SyncStats>,
    observer: Arc<dyn SyncObserver>,
}

impl<S: RemoteStore> BackendSync<S> {
    pub fn new(
        store: S,
        registry: Arc<TagRegistry>,
        queue: Arc<ReadingQueue>,
        config: SyncConfig,
    ) -> Self {
        let resolver = TagResolver::new(config.catalog_refresh);
        Self {
            store,
            registry,
            queue,
            resolver,
            config,
            stats: Arc::new(SyncStats::default()),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        Arc::clone(&self.stats)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Force a catalog reload before the next resolution.
    pub fn invalidate_catalog(&mut self) {
        self.resolver.invalidate();
    }

    /// Resolve and publish one reading.
    pub fn process(&mut self, reading: &Reading) -> SyncOutcome {
        self.process_until(reading, None)
    }

    fn process_until(&mut self, reading: &Reading, deadline: Option<Instant>) -> SyncOutcome {
        let remote_tag = match self.resolve(reading, deadline) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    tag = %reading.tag_id,
                    timestamp_us = reading.timestamp_us,
                    error = %e,
                    "Dropping reading: tag not resolvable"
                );
                self.stats.dropped_unresolved.fetch_add(1, Ordering::Relaxed);
                self.observer
                    .on_dropped(reading, DropReason::Unresolved, &e.to_string());
                return SyncOutcome::Unresolved(e);
            }
        };

        let record = IngestRecord::new(remote_tag, reading);
        let key = idempotency_key(&reading.tag_id, reading.timestamp_us);
        let store = &self.store;
        let stats = &self.stats;
        let observer = &self.observer;

        let result = self.config.retry.run(
            deadline,
            |_| store.ingest(&record, &key),
            |attempt, error, delay| {
                stats.retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tag = %reading.tag_id,
                    attempt,
                    error = %error,
                    kind = error.kind(),
                    delay_ms = delay.as_millis() as u64,
                    "Publish failed, retrying"
                );
                observer.on_retry(reading, attempt, error);
            },
        );

        match result {
            Ok((ack, attempts)) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    tag = %reading.tag_id,
                    remote_tag,
                    remote_id = ?ack.id,
                    attempts,
                    "Reading published"
                );
                self.observer.on_published(reading, attempts);
                SyncOutcome::Published {
                    remote_tag,
                    attempts,
                }
            }
            Err(failure) if failure.permanent => {
                let error = PublishError::Rejected {
                    attempts: failure.attempts,
                    source: failure.error,
                };
                tracing::error!(
                    tag = %reading.tag_id,
                    timestamp_us = reading.timestamp_us,
                    attempts = failure.attempts,
                    error = %error,
                    "Dropping reading: backend rejected it"
                );
                self.stats.dropped_rejected.fetch_add(1, Ordering::Relaxed);
                self.observer
                    .on_dropped(reading, DropReason::Rejected, &error.to_string());
                SyncOutcome::Failed(error)
            }
            Err(failure) => {
                let error = PublishError::Exhausted {
                    attempts: failure.attempts,
                    source: failure.error,
                };
                tracing::error!(
                    alert = true,
                    tag = %reading.tag_id,
                    timestamp_us = reading.timestamp_us,
                    attempts = failure.attempts,
                    error = %error,
                    "Dropping reading: retries exhausted"
                );
                self.stats.dropped_exhausted.fetch_add(1, Ordering::Relaxed);
                self.observer
                    .on_dropped(reading, DropReason::Exhausted, &error.to_string());
                SyncOutcome::Failed(error)
            }
        }
    }

    fn resolve(
        &mut self,
        reading: &Reading,
        deadline: Option<Instant>,
    ) -> Result<i64, TagResolutionError> {
        let definition = self
            .registry
            .definition(&reading.tag_id)
            .ok_or_else(|| TagResolutionError::UnknownLocalTag(reading.tag_id.clone()))?;
        self.resolver
            .resolve_until(&self.store, &self.config.retry, &definition, deadline)
    }

    /// Consume the queue until `stop` is set, then drain for at most the
    /// configured grace period and abandon whatever is left.
    pub fn run(&mut self, stop: &AtomicBool) -> SyncStatsSnapshot {
        tracing::info!(capacity = self.queue.capacity(), "Backend sync started");
        while !stop.load(Ordering::Relaxed) {
            match self.queue.pop() {
                Some(reading) => {
                    self.process(&reading);
                }
                None => thread::sleep(self.config.idle_poll),
            }
        }
        self.drain(self.config.drain_grace);
        let stats = self.stats.snapshot();
        tracing::info!(
            published = stats.published,
            dropped = stats.dropped(),
            "Backend sync stopped"
        );
        stats
    }

    /// Publish what is queued until `grace` runs out; returns how many
    /// readings were abandoned.
    pub fn drain(&mut self, grace: Duration) -> u64 {
        let deadline = Instant::now() + grace;
        let pending = self.queue.len();
        if pending > 0 {
            tracing::info!(pending, grace_ms = grace.as_millis() as u64, "Draining reading queue");
        }

        while Instant::now() < deadline {
            match self.queue.pop() {
                Some(reading) => {
                    self.process_until(&reading, Some(deadline));
                }
                None => return 0,
            }
        }

        let mut abandoned = 0;
        while let Some(reading) = self.queue.pop() {
            abandoned += 1;
            self.observer
                .on_dropped(&reading, DropReason::Shutdown, "drain grace period elapsed");
        }
        if abandoned > 0 {
            self.stats
                .abandoned_on_shutdown
                .fetch_add(abandoned, Ordering::Relaxed);
            tracing::error!(abandoned, "Abandoned unsent readings at shutdown");
        }
        abandoned
    }
}

/// Sync consumer running on its own thread.
pub struct SyncHandle {
    stats: Arc<SyncStats>,
    join: thread::JoinHandle<SyncStatsSnapshot>,
}

impl SyncHandle {
    pub fn spawn<S>(mut sync: BackendSync<S>, stop: Arc<AtomicBool>) -> std::io::Result<Self>
    where
        S: RemoteStore + 'static,
    {
        let stats = sync.stats();
        let join = thread::Builder::new()
            .name("kora-sync".to_string())
            .spawn(move || sync.run(&stop))?;
        Ok(Self { stats, join })
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the consumer to finish draining. The caller sets the stop flag.
    pub fn join(self) -> SyncStatsSnapshot {
        match self.join.join() {
            Ok(stats) => stats,
            Err(_) => {
                tracing::error!("Sync thread panicked");
                self.stats.snapshot()
            }
        }
    }
}
