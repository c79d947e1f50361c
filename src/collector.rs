//! Collector: one sample per tick into the buffer.
//!
//! Each tick asks the backpressure guard first. When free space is below the
//! low-water mark the tick is suppressed and nothing is fetched. Otherwise the
//! sample source is polled once (bounded by a timeout), the measurement is
//! serialized and appended as a single row. A failed fetch never writes a
//! partial row.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::backpressure::{BackpressureGuard, Pressure};
use crate::reading::{NewReading, ReadingId};
use crate::sample::SampleSource;
use crate::store::ReadingStore;

/// What a collector tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Free space below the low-water mark; nothing fetched
    Suppressed,

    /// Sample stored under this id
    Appended(ReadingId),

    /// Source failed, timed out or returned an unusable sample
    FetchFailed,

    /// Sample fetched but could not be stored
    StoreFailed,
}

/// Polls a sample source and appends readings.
pub struct Collector {
    source: Arc<dyn SampleSource>,
    store: ReadingStore,
    guard: BackpressureGuard,
    station_id: String,
    fetch_timeout: Duration,
    urgent_prune: Arc<Notify>,
}

impl Collector {
    pub fn new(
        source: Arc<dyn SampleSource>,
        store: ReadingStore,
        guard: BackpressureGuard,
        station_id: impl Into<String>,
        fetch_timeout: Duration,
        urgent_prune: Arc<Notify>,
    ) -> Self {
        Self {
            source,
            store,
            guard,
            station_id: station_id.into(),
            fetch_timeout,
            urgent_prune,
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    async fn assess(&self) -> Pressure {
        let guard = self.guard.clone();
        tokio::task::spawn_blocking(move || guard.assess())
            .await
            .unwrap_or(Pressure {
                free_bytes: None,
                collect: false,
                prune_urgently: true,
            })
    }

    /// Run one collection cycle.
    pub async fn tick(&self) -> CollectOutcome {
        let pressure = self.assess().await;

        if pressure.prune_urgently {
            debug!(free_bytes = ?pressure.free_bytes, "Requesting urgent prune");
            self.urgent_prune.notify_one();
        }

        if !pressure.collect {
            info!(
                free_bytes = ?pressure.free_bytes,
                low_water_bytes = self.guard.thresholds().low_water_bytes,
                "Low free space, skipping sample"
            );
            return CollectOutcome::Suppressed;
        }

        let measurement =
            match tokio::time::timeout(self.fetch_timeout, self.source.fetch_sample()).await {
                Ok(Ok(measurement)) => measurement,
                Ok(Err(e)) => {
                    warn!(error = %e, "Sample fetch failed");
                    return CollectOutcome::FetchFailed;
                }
                Err(_) => {
                    warn!(timeout = ?self.fetch_timeout, "Sample fetch timed out");
                    return CollectOutcome::FetchFailed;
                }
            };

        let reading = match NewReading::from_measurement(Utc::now(), &self.station_id, &measurement)
        {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Sample could not be serialized");
                return CollectOutcome::FetchFailed;
            }
        };

        match self.store.call(move |store| store.append(&[reading])).await {
            Ok(ids) => match ids.first() {
                Some(&id) => {
                    debug!(id = id, channels = measurement.len(), "Sample stored");
                    CollectOutcome::Appended(id)
                }
                None => CollectOutcome::StoreFailed,
            },
            Err(e) => {
                warn!(error = %e, "Failed to store sample");
                CollectOutcome::StoreFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::testing::FixedCapacity;
    use crate::backpressure::Thresholds;
    use crate::reading::Measurement;
    use crate::sample::{SampleError, SimulatedSource};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FailingSource;

    #[async_trait]
    impl SampleSource for FailingSource {
        async fn fetch_sample(&self) -> Result<Measurement, SampleError> {
            Err(SampleError::Unreachable("no response from slave 1".to_string()))
        }
    }

    struct SlowSource;

    #[async_trait]
    impl SampleSource for SlowSource {
        async fn fetch_sample(&self) -> Result<Measurement, SampleError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Measurement::new())
        }
    }

    fn setup(
        source: Arc<dyn SampleSource>,
        free: u64,
    ) -> (TempDir, ReadingStore, Arc<FixedCapacity>, Arc<Notify>, Collector) {
        let dir = tempfile::tempdir().unwrap();
        let store = ReadingStore::open_default(dir.path().join("buffer.db")).unwrap();
        let gauge = FixedCapacity::new(free);
        let guard = BackpressureGuard::new(gauge.clone(), Thresholds::new(1_000, 100).unwrap());
        let notify = Arc::new(Notify::new());
        let collector = Collector::new(
            source,
            store.clone(),
            guard,
            "station-1",
            Duration::from_millis(200),
            notify.clone(),
        );
        (dir, store, gauge, notify, collector)
    }

    #[tokio::test]
    async fn test_tick_appends_sample() {
        let (_dir, store, _gauge, _notify, collector) =
            setup(Arc::new(SimulatedSource::with_defaults()), 10_000);

        let id = match collector.tick().await {
            CollectOutcome::Appended(id) => id,
            other => panic!("expected append, got {:?}", other),
        };

        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.source_id, "station-1");
        let data = stored.payload_json().unwrap();
        assert!(data.get("temperature").is_some());
        assert_eq!(store.count_unsent().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_low_space_suppresses_then_resumes() {
        let (_dir, store, gauge, _notify, collector) =
            setup(Arc::new(SimulatedSource::with_defaults()), 10_000);

        assert!(matches!(collector.tick().await, CollectOutcome::Appended(_)));
        assert!(matches!(collector.tick().await, CollectOutcome::Appended(_)));

        gauge.set(500);
        assert_eq!(collector.tick().await, CollectOutcome::Suppressed);
        assert_eq!(store.count_unsent().unwrap(), 2);

        gauge.set(5_000);
        assert!(matches!(collector.tick().await, CollectOutcome::Appended(_)));

        let rows = store.fetch_unsent(10).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_urgent_pressure_raises_prune_signal() {
        let (_dir, _store, _gauge, notify, collector) =
            setup(Arc::new(SimulatedSource::with_defaults()), 10);

        assert_eq!(collector.tick().await, CollectOutcome::Suppressed);
        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .expect("urgent prune should have been signalled");
    }

    #[tokio::test]
    async fn test_unknown_capacity_suppresses() {
        let (_dir, store, _gauge, _notify, collector) = setup(
            Arc::new(SimulatedSource::with_defaults()),
            FixedCapacity::UNKNOWN,
        );

        assert_eq!(collector.tick().await, CollectOutcome::Suppressed);
        assert_eq!(store.count_unsent().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_writes_nothing() {
        let (_dir, store, _gauge, _notify, collector) = setup(Arc::new(FailingSource), 10_000);

        assert_eq!(collector.tick().await, CollectOutcome::FetchFailed);
        assert_eq!(store.count_unsent().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_timeout_writes_nothing() {
        let (_dir, store, _gauge, _notify, collector) = setup(Arc::new(SlowSource), 10_000);

        assert_eq!(collector.tick().await, CollectOutcome::FetchFailed);
        assert_eq!(store.count_unsent().unwrap(), 0);
    }
}
