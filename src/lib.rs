//! Edge Telemetry Library
//!
//! Store-and-forward pipeline for edge devices with intermittent uplinks and
//! small disks:
//!
//! - **store**: Durable SQLite buffer of readings with a sent/unsent flag
//! - **collector**: Samples a sensor source and appends readings
//! - **publisher**: Delivers batches to every sink, commits only on full ack
//! - **pruner**: Deletes delivered readings in bounded chunks
//! - **backpressure**: Free-space thresholds gating collection and pruning
//! - **sink**: HTTP and MQTT delivery destinations
//! - **scheduler**: Runs the three stages on independent cadences
//! - **config**: Environment-based configuration and sink definitions
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use edge_telemetry::config::Config;
//! use edge_telemetry::store::ReadingStore;
//! use edge_telemetry::sink::build_slots;
//! use edge_telemetry::publisher::Publisher;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let store = ReadingStore::open_default(&config.db_path).expect("Failed to open store");
//!
//!     let station = edge_telemetry::identity::station_id(config.station_id.as_deref());
//!     let sinks = build_slots(&config.sinks, &station, config.sink_timeout)
//!         .expect("Invalid sink configuration");
//!
//!     let mut publisher = Publisher::new(store, sinks, config.publish_batch_size);
//!     let outcome = publisher.tick().await;
//!     println!("{:?}", outcome);
//! }
//! ```

// Module declarations
pub mod backpressure;
pub mod collector;
pub mod config;
pub mod identity;
pub mod pruner;
pub mod publisher;
pub mod reading;
pub mod sample;
pub mod scheduler;
pub mod sink;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use backpressure::{BackpressureGuard, CapacityError, CapacityGauge, DiskCapacity, Thresholds};
pub use collector::{CollectOutcome, Collector};
pub use config::{Config, ConfigError, SinkConfig};
pub use pruner::{PruneOutcome, Pruner};
pub use publisher::{PublishOutcome, Publisher, PublisherStats};
pub use reading::{DeliveryState, Measurement, NewReading, Reading, ReadingId};
pub use sample::{SampleError, SampleSource, SimulatedSource};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use sink::{PayloadMode, Sink, SinkError, SinkSlot};
pub use store::{ReadingStore, StoreError, StoreOptions};
