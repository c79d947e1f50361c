//! Edge Telemetry - store-and-forward agent for edge devices
//!
//! Samples a sensor source on a fixed cadence, buffers every reading in a
//! local SQLite database and relays them to the configured sinks (HTTP API,
//! MQTT broker). Readings are marked delivered only after every enabled sink
//! acknowledged them, and delivered readings are pruned to keep the buffer
//! bounded on small disks.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables, see
//! [`edge_telemetry::config::Config`]. The most relevant ones:
//!
//! - `EDGE_TELEMETRY_DB_PATH`: Buffer database (default: ./edge-telemetry.db)
//! - `EDGE_TELEMETRY_SINKS_FILE`: JSON file with sink definitions
//! - `EDGE_TELEMETRY_STATION_ID`: Station id override
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_telemetry::backpressure::{BackpressureGuard, DiskCapacity};
use edge_telemetry::collector::Collector;
use edge_telemetry::config::Config;
use edge_telemetry::identity;
use edge_telemetry::pruner::Pruner;
use edge_telemetry::publisher::Publisher;
use edge_telemetry::sample::SimulatedSource;
use edge_telemetry::scheduler::{Scheduler, SchedulerConfig};
use edge_telemetry::sink::build_slots;
use edge_telemetry::store::ReadingStore;

/// Time allowed for in-flight ticks to finish after Ctrl+C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Edge Telemetry agent...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                db_path = %config.db_path.display(),
                collect_interval_secs = config.collect_interval.as_secs(),
                publish_interval_secs = config.publish_interval.as_secs(),
                prune_interval_secs = config.prune_interval.as_secs(),
                batch_size = config.publish_batch_size,
                sinks = config.sinks.len(),
                enabled_sinks = config.enabled_sinks(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let station_id = identity::station_id(config.station_id.as_deref());

    // The only fatal runtime dependency: without a buffer there is nothing to do
    let store = match ReadingStore::open_default(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, path = %config.db_path.display(), "Failed to open reading store");
            std::process::exit(1);
        }
    };

    match store.count_unsent() {
        Ok(backlog) => info!(unsent = backlog, "Reading store opened"),
        Err(e) => warn!(error = %e, "Reading store opened, backlog unknown"),
    }

    let sinks = match build_slots(&config.sinks, &station_id, config.sink_timeout) {
        Ok(sinks) => sinks,
        Err(e) => {
            error!(error = %e, "Failed to build sinks");
            std::process::exit(1);
        }
    };
    if config.enabled_sinks() == 0 {
        warn!("No enabled sinks configured, readings will only be buffered");
    }

    let urgent_prune = Arc::new(Notify::new());
    let guard = BackpressureGuard::new(
        Arc::new(DiskCapacity::for_database(&config.db_path)),
        config.thresholds,
    );

    let collector = Collector::new(
        Arc::new(SimulatedSource::with_defaults()),
        store.clone(),
        guard.clone(),
        station_id.clone(),
        config.collect_interval.min(config.tick_timeout),
        urgent_prune.clone(),
    );
    let publisher = Publisher::new(store.clone(), sinks, config.publish_batch_size)
        .with_max_backoff(config.max_backoff);
    let pruner = Pruner::new(store.clone(), config.prune_chunk_size, config.prune_budget)
        .with_guard(guard);

    let handle = Scheduler::new(
        collector,
        publisher,
        pruner,
        store,
        urgent_prune,
        SchedulerConfig::from_config(&config),
    )
    .spawn();

    info!(station_id = %station_id, "Edge Telemetry running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    handle.shutdown();
    handle.join(SHUTDOWN_GRACE).await;

    info!("Edge Telemetry stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
