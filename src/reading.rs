//! Reading data model shared by the store, collector, publisher and sinks.
//!
//! A reading is created by the collector, persisted by the store (which
//! assigns its id) and later relayed to every configured sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store-assigned reading identifier. Total order = arrival order.
pub type ReadingId = i64;

/// A key -> value measurement set produced by a sample source.
///
/// Serialized to JSON by the collector before it reaches the store; the store
/// itself only sees opaque bytes.
pub type Measurement = BTreeMap<String, serde_json::Value>;

/// Delivery state of a buffered reading.
///
/// Transitions only `Unsent -> Sent`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Unsent,
    Sent,
}

impl DeliveryState {
    /// Integer flag persisted in the `sent` column.
    pub fn as_flag(self) -> i64 {
        match self {
            DeliveryState::Unsent => 0,
            DeliveryState::Sent => 1,
        }
    }

    /// Decode the persisted flag. Any non-zero value counts as sent.
    pub fn from_flag(flag: i64) -> Self {
        if flag == 0 {
            DeliveryState::Unsent
        } else {
            DeliveryState::Sent
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Unsent => write!(f, "unsent"),
            DeliveryState::Sent => write!(f, "sent"),
        }
    }
}

/// A reading that has not been persisted yet (no id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReading {
    /// When the sample was acquired. Display only; may be non-monotonic.
    pub captured_at: DateTime<Utc>,

    /// Station identity of the device that took the sample
    pub source_id: String,

    /// Serialized measurement set, stored verbatim
    pub payload: Vec<u8>,
}

impl NewReading {
    /// Create a new reading from raw payload bytes.
    pub fn new(
        captured_at: DateTime<Utc>,
        source_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            captured_at,
            source_id: source_id.into(),
            payload: payload.into(),
        }
    }

    /// Create a new reading by serializing a measurement set to JSON.
    pub fn from_measurement(
        captured_at: DateTime<Utc>,
        source_id: impl Into<String>,
        measurement: &Measurement,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(measurement)?;
        Ok(Self::new(captured_at, source_id, payload))
    }
}

/// A persisted reading as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub id: ReadingId,
    pub captured_at: DateTime<Utc>,
    pub source_id: String,
    pub payload: Vec<u8>,
    pub delivery_state: DeliveryState,
}

impl Reading {
    /// Decode the payload as a JSON value.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Collect the ids of a batch, preserving order.
pub fn ids_of(batch: &[Reading]) -> Vec<ReadingId> {
    batch.iter().map(|r| r.id).collect()
}
