//! Delivery sinks.
//!
//! A sink takes a drained batch of readings, turns it into its own wire
//! payload and reports either an acknowledgment (`Ok`) or a failure (`Err`).
//! The publisher treats every error the same way: the batch stays unsent.

pub mod broker;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SinkConfig;
use crate::reading::{Reading, ReadingId};

pub use broker::BrokerSink;
pub use http::HttpSink;

/// Reasons a sink did not acknowledge a batch.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Connection could not be established or dropped mid-delivery
    #[error("sink unreachable: {0}")]
    Unreachable(String),

    /// Remote end answered but refused the batch
    #[error("sink rejected batch{}: {reason}", status_suffix(.status))]
    Rejected { status: Option<u16>, reason: String },

    /// No acknowledgment within the delivery timeout
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    /// The batch could not be turned into the sink's wire format
    #[error("cannot encode payload: {0}")]
    Encode(String),

    /// The sink could not be built from its configuration
    #[error("sink configuration error: {0}")]
    Config(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {})", code),
        None => String::new(),
    }
}

/// Capability implemented by every delivery destination.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver the whole batch. `Ok` means the remote end confirmed receipt.
    async fn deliver(&self, batch: &[Reading]) -> Result<(), SinkError>;
}

/// How a reading is shaped on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// The stored measurement set, unwrapped
    Direct,

    /// Measurement set wrapped with id, station and timestamp
    #[default]
    #[serde(alias = "wrapped")]
    Enveloped,
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: ReadingId,
    station_id: &'a str,
    timestamp: String,
    data: serde_json::Value,
}

impl PayloadMode {
    /// JSON form of a single reading.
    pub fn encode_item(&self, reading: &Reading) -> Result<serde_json::Value, SinkError> {
        let data = reading
            .payload_json()
            .map_err(|e| SinkError::Encode(format!("reading {}: {}", reading.id, e)))?;

        match self {
            PayloadMode::Direct => Ok(data),
            PayloadMode::Enveloped => {
                let envelope = Envelope {
                    id: reading.id,
                    station_id: &reading.source_id,
                    timestamp: reading
                        .captured_at
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                    data,
                };
                serde_json::to_value(envelope).map_err(|e| SinkError::Encode(e.to_string()))
            }
        }
    }

    /// One JSON array holding every reading of the batch, in batch order.
    pub fn encode_batch(&self, batch: &[Reading]) -> Result<Vec<u8>, SinkError> {
        let items = batch
            .iter()
            .map(|r| self.encode_item(r))
            .collect::<Result<Vec<_>, _>>()?;
        serde_json::to_vec(&items).map_err(|e| SinkError::Encode(e.to_string()))
    }

    /// Message body for a single reading.
    ///
    /// Direct mode forwards the stored bytes untouched.
    pub fn encode_message(&self, reading: &Reading) -> Result<Vec<u8>, SinkError> {
        match self {
            PayloadMode::Direct => Ok(reading.payload.clone()),
            PayloadMode::Enveloped => {
                let value = self.encode_item(reading)?;
                serde_json::to_vec(&value).map_err(|e| SinkError::Encode(e.to_string()))
            }
        }
    }
}

/// A configured sink with its position in the delivery order.
#[derive(Clone)]
pub struct SinkSlot {
    /// Operator-facing name
    pub name: String,

    /// Disabled sinks are skipped and never block a commit
    pub enabled: bool,

    /// Upper bound for one delivery attempt
    pub timeout: Duration,

    /// The sink itself
    pub sink: Arc<dyn Sink>,
}

impl SinkSlot {
    pub fn new(name: impl Into<String>, sink: Arc<dyn Sink>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            timeout,
            sink,
        }
    }

    /// Same slot, disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl std::fmt::Debug for SinkSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSlot")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Build the delivery slots for every configured sink, preserving order.
///
/// `default_timeout` applies to sinks without their own `timeout_secs`.
pub fn build_slots(
    configs: &[SinkConfig],
    station_id: &str,
    default_timeout: Duration,
) -> Result<Vec<SinkSlot>, SinkError> {
    configs
        .iter()
        .map(|config| {
            let timeout = config.timeout().unwrap_or(default_timeout);
            let sink: Arc<dyn Sink> = match config {
                SinkConfig::Http(http) => Arc::new(HttpSink::new(http, timeout)?),
                SinkConfig::Broker(broker) => {
                    Arc::new(BrokerSink::new(broker, station_id, timeout)?)
                }
            };
            Ok(SinkSlot {
                name: config.name().to_string(),
                enabled: config.enabled(),
                timeout,
                sink,
            })
        })
        .collect()
}
