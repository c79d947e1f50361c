//! Pruner: reclaims space held by delivered readings.
//!
//! Sent rows are deleted in short chunks so the writer lock is never held for
//! long; the collector can append between chunks. A tick stops when a chunk
//! deletes nothing or the per-tick budget is spent. Unsent rows are never
//! touched.
//!
//! A scheduled pass with a backpressure guard attached checks free space
//! itself, so low space is reported as urgent even when the collector is
//! suppressed or stalled.

use tracing::{debug, info, warn};

use crate::backpressure::BackpressureGuard;
use crate::store::{ReadingStore, StoreError};

/// Result of one prune tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Rows deleted this tick
    pub deleted: usize,

    /// Delete statements issued
    pub chunks: usize,

    /// The budget ran out while sent rows may remain
    pub exhausted: bool,

    /// Pass was forced by low free space
    pub urgent: bool,
}

/// Deletes sent readings in bounded chunks.
#[derive(Debug, Clone)]
pub struct Pruner {
    store: ReadingStore,
    chunk_size: usize,
    budget: usize,
    guard: Option<BackpressureGuard>,
}

impl Pruner {
    pub fn new(store: ReadingStore, chunk_size: usize, budget: usize) -> Self {
        Self {
            store,
            chunk_size,
            budget,
            guard: None,
        }
    }

    /// Check free space on scheduled passes.
    pub fn with_guard(mut self, guard: BackpressureGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Whether free space is below the urgent mark. Unknown space counts as low.
    async fn space_is_critical(&self) -> bool {
        let Some(guard) = self.guard.clone() else {
            return false;
        };
        tokio::task::spawn_blocking(move || guard.assess().prune_urgently)
            .await
            .unwrap_or(true)
    }

    /// Run one prune pass. `urgent` marks passes forced by low free space;
    /// a scheduled pass becomes urgent when the guard reports critical space.
    pub async fn tick(&self, urgent: bool) -> Result<PruneOutcome, StoreError> {
        let urgent = urgent || self.space_is_critical().await;
        let (chunk_size, budget) = (self.chunk_size, self.budget);
        let mut outcome = self
            .store
            .call(move |store| prune_chunks(store, chunk_size, budget))
            .await?;
        outcome.urgent = urgent;

        if outcome.deleted > 0 {
            info!(
                deleted = outcome.deleted,
                chunks = outcome.chunks,
                urgent = urgent,
                "Pruned sent readings"
            );
        } else if urgent {
            warn!("Urgent prune found no sent readings to delete");
        } else {
            debug!("Nothing to prune");
        }
        if outcome.exhausted {
            debug!(budget = budget, "Prune budget spent, continuing next tick");
        }

        Ok(outcome)
    }
}

fn prune_chunks(
    store: &ReadingStore,
    chunk_size: usize,
    budget: usize,
) -> Result<PruneOutcome, StoreError> {
    let mut outcome = PruneOutcome::default();
    if chunk_size == 0 {
        return Ok(outcome);
    }

    while outcome.deleted < budget {
        let want = chunk_size.min(budget - outcome.deleted);
        let deleted = store.delete_sent_batch(want)?;
        outcome.chunks += 1;
        outcome.deleted += deleted;
        if deleted == 0 {
            return Ok(outcome);
        }
    }

    outcome.exhausted = true;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::testing::FixedCapacity;
    use crate::backpressure::Thresholds;
    use crate::reading::NewReading;
    use chrono::Utc;
    use tempfile::TempDir;

    fn store_with(sent: usize, unsent: usize) -> (TempDir, ReadingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ReadingStore::open_default(dir.path().join("buffer.db")).unwrap();
        let readings: Vec<_> = (0..sent + unsent)
            .map(|i| NewReading::new(Utc::now(), "station-1", format!("{{\"n\":{}}}", i)))
            .collect();
        let ids = store.append(&readings).unwrap();
        store.mark_sent(&ids[..sent]).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_prunes_only_sent_rows() {
        let (_dir, store) = store_with(7, 3);
        let pruner = Pruner::new(store.clone(), 3, 100);

        let outcome = pruner.tick(false).await.unwrap();
        assert_eq!(outcome.deleted, 7);
        // 3 + 3 + 1, then an empty chunk
        assert_eq!(outcome.chunks, 4);
        assert!(!outcome.exhausted);
        assert_eq!(store.count_sent().unwrap(), 0);
        assert_eq!(store.count_unsent().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_budget_limits_tick() {
        let (_dir, store) = store_with(10, 0);
        let pruner = Pruner::new(store.clone(), 4, 6);

        let outcome = pruner.tick(true).await.unwrap();
        assert_eq!(outcome.deleted, 6);
        assert_eq!(outcome.chunks, 2);
        assert!(outcome.exhausted);
        assert_eq!(store.count_sent().unwrap(), 4);

        let outcome = pruner.tick(false).await.unwrap();
        assert_eq!(outcome.deleted, 4);
        assert_eq!(store.count_sent().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_deletes_nothing() {
        let (_dir, store) = store_with(5, 0);
        let pruner = Pruner::new(store.clone(), 0, 100);

        let outcome = pruner.tick(true).await.unwrap();
        assert_eq!(
            outcome,
            PruneOutcome {
                urgent: true,
                ..PruneOutcome::default()
            }
        );
        assert_eq!(store.count_sent().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_scheduled_pass_turns_urgent_on_low_space() {
        let (_dir, store) = store_with(3, 1);
        let gauge = FixedCapacity::new(10);
        let guard = BackpressureGuard::new(gauge.clone(), Thresholds::new(1_000, 100).unwrap());
        let pruner = Pruner::new(store.clone(), 10, 100).with_guard(guard);

        let outcome = pruner.tick(false).await.unwrap();
        assert!(outcome.urgent);
        assert_eq!(outcome.deleted, 3);
        assert_eq!(store.count_unsent().unwrap(), 1);

        gauge.set(10_000);
        let outcome = pruner.tick(false).await.unwrap();
        assert!(!outcome.urgent);

        gauge.set(FixedCapacity::UNKNOWN);
        let outcome = pruner.tick(false).await.unwrap();
        assert!(outcome.urgent);
    }

    #[tokio::test]
    async fn test_without_guard_urgency_follows_caller() {
        let (_dir, store) = store_with(1, 0);
        let pruner = Pruner::new(store.clone(), 10, 100);

        assert!(!pruner.tick(false).await.unwrap().urgent);
        assert!(pruner.tick(true).await.unwrap().urgent);
    }

    #[tokio::test]
    async fn test_nothing_to_prune() {
        let (_dir, store) = store_with(0, 4);
        let pruner = Pruner::new(store.clone(), 10, 100);

        let outcome = pruner.tick(false).await.unwrap();
        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.chunks, 1);
        assert_eq!(store.count_unsent().unwrap(), 4);
    }
}
