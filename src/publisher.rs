//! Publisher: drain, deliver, commit.
//!
//! One cycle drains the oldest unsent readings, hands the same batch to every
//! enabled sink in configured order and marks the batch sent only if every
//! one of them acknowledged. The first failure aborts the cycle; nothing is
//! marked and the identical batch is drained again next time.
//!
//! After an aborted cycle the publisher backs off exponentially with jitter
//! before trying again. The first committed cycle resets the backoff.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::reading::{ids_of, Reading};
use crate::sink::{SinkError, SinkSlot};
use crate::store::ReadingStore;

/// Base delay for exponential backoff (in milliseconds).
const BASE_BACKOFF_MS: u64 = 500;

/// Largest exponent applied to the base delay.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Default ceiling for the backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What a publisher tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// No enabled sink; nothing drained
    NoSinks,

    /// A previous cycle failed and the retry delay has not elapsed
    BackingOff,

    /// Nothing to send
    Idle,

    /// Every enabled sink acknowledged; `count` rows were marked sent
    Committed { count: usize },

    /// `sink` refused or timed out; nothing was marked
    Aborted { sink: String, reason: String },

    /// Drain and delivery overran the tick bound; nothing was marked
    Abandoned,

    /// The buffer could not be read or updated
    StoreFailed,
}

/// Running totals for the publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Cycles that drained a non-empty batch
    pub cycles: u64,

    /// Rows transitioned to sent
    pub readings_committed: u64,

    /// Cycles aborted by a sink failure or the tick bound
    pub cycles_aborted: u64,

    /// Aborted cycles since the last commit
    pub consecutive_failures: u32,

    /// Last sink failure, if any
    pub last_error: Option<String>,
}

/// How the drain and delivery phase of a cycle ended.
enum Delivery {
    Empty,
    StoreFailed,
    Refused { sink: String, error: SinkError },
    Acknowledged(Vec<Reading>),
}

/// Delivers buffered readings to all configured sinks.
pub struct Publisher {
    store: ReadingStore,
    sinks: Vec<SinkSlot>,
    batch_size: usize,
    max_backoff: Duration,
    retry_at: Option<Instant>,
    stats: PublisherStats,
}

impl Publisher {
    pub fn new(store: ReadingStore, sinks: Vec<SinkSlot>, batch_size: usize) -> Self {
        Self {
            store,
            sinks,
            batch_size,
            max_backoff: DEFAULT_MAX_BACKOFF,
            retry_at: None,
            stats: PublisherStats::default(),
        }
    }

    /// Set the backoff ceiling. `Duration::ZERO` disables backoff.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    pub fn enabled_sinks(&self) -> usize {
        self.sinks.iter().filter(|s| s.enabled).count()
    }

    /// Run one publish cycle.
    pub async fn tick(&mut self) -> PublishOutcome {
        self.run(None).await
    }

    /// Run one publish cycle whose drain and delivery must finish within
    /// `limit`.
    ///
    /// The bound stops short of the commit: once every sink acknowledged,
    /// `mark_sent` is always awaited so the outcome and the stored state
    /// agree. A cycle that runs out of time marks nothing.
    pub async fn tick_bounded(&mut self, limit: Duration) -> PublishOutcome {
        self.run(Some(limit)).await
    }

    async fn run(&mut self, limit: Option<Duration>) -> PublishOutcome {
        if self.enabled_sinks() == 0 {
            debug!("No enabled sinks, leaving readings buffered");
            return PublishOutcome::NoSinks;
        }

        if let Some(retry_at) = self.retry_at {
            if Instant::now() < retry_at {
                debug!(
                    remaining_ms = (retry_at - Instant::now()).as_millis() as u64,
                    "Backing off after failed cycle"
                );
                return PublishOutcome::BackingOff;
            }
        }

        let delivery = match limit {
            None => self.drain_and_deliver().await,
            Some(limit) => {
                let bounded = tokio::time::timeout(limit, self.drain_and_deliver()).await;
                match bounded {
                    Ok(delivery) => delivery,
                    Err(_) => {
                        self.record_failure("tick", &SinkError::Timeout(limit));
                        return PublishOutcome::Abandoned;
                    }
                }
            }
        };

        let batch = match delivery {
            Delivery::Empty => return PublishOutcome::Idle,
            Delivery::StoreFailed => return PublishOutcome::StoreFailed,
            Delivery::Refused { sink, error } => {
                self.stats.cycles += 1;
                self.record_failure(&sink, &error);
                return PublishOutcome::Aborted {
                    reason: error.to_string(),
                    sink,
                };
            }
            Delivery::Acknowledged(batch) => batch,
        };

        self.stats.cycles += 1;
        let ids = ids_of(&batch);
        match self.store.call(move |s| s.mark_sent(&ids)).await {
            Ok(count) => {
                self.record_success(count);
                info!(count = count, "Batch delivered to all sinks");
                PublishOutcome::Committed { count }
            }
            Err(e) => {
                // Rows stay unsent and are delivered again next cycle
                warn!(error = %e, batch_size = batch.len(), "Failed to mark batch sent");
                PublishOutcome::StoreFailed
            }
        }
    }

    /// Drain the oldest unsent batch and hand it to every enabled sink.
    async fn drain_and_deliver(&self) -> Delivery {
        let limit = self.batch_size;
        let batch = match self.store.call(move |s| s.fetch_unsent(limit)).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Failed to drain unsent readings");
                return Delivery::StoreFailed;
            }
        };

        if batch.is_empty() {
            return Delivery::Empty;
        }
        debug!(batch_size = batch.len(), first_id = batch[0].id, "Drained batch");

        for slot in self.sinks.iter().filter(|s| s.enabled) {
            let result = match tokio::time::timeout(slot.timeout, slot.sink.deliver(&batch)).await
            {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(slot.timeout)),
            };

            if let Err(error) = result {
                return Delivery::Refused {
                    sink: slot.name.clone(),
                    error,
                };
            }
            debug!(sink = %slot.name, batch_size = batch.len(), "Sink acknowledged");
        }

        Delivery::Acknowledged(batch)
    }

    fn record_success(&mut self, count: usize) {
        self.stats.readings_committed += count as u64;
        self.stats.consecutive_failures = 0;
        self.retry_at = None;
    }

    fn record_failure(&mut self, sink: &str, error: &SinkError) {
        self.stats.cycles_aborted += 1;
        self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
        self.stats.last_error = Some(format!("{}: {}", sink, error));

        let delay = if self.max_backoff.is_zero() {
            Duration::ZERO
        } else {
            backoff_delay(self.stats.consecutive_failures - 1, self.max_backoff)
        };
        self.retry_at = (!delay.is_zero()).then(|| Instant::now() + delay);

        warn!(
            sink = %sink,
            error = %error,
            failures = self.stats.consecutive_failures,
            retry_in_ms = delay.as_millis() as u64,
            "Sink failed, batch left unsent"
        );
    }
}

/// Backoff delay after the `attempt`-th consecutive failure (zero based).
///
/// delay = min(base * 2^attempt + jitter, max), jitter up to 25%.
fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let exponential = BASE_BACKOFF_MS.saturating_mul(2u64.pow(attempt.min(MAX_BACKOFF_EXPONENT)));
    let jitter = rand::random::<u64>() % (exponential / 4 + 1);
    let total = exponential.saturating_add(jitter);

    Duration::from_millis(total).min(max)
}
