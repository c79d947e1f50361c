//! Sample source capability and a simulated implementation.
//!
//! The real sensor driver (a field-bus client) is deployment specific and
//! lives outside this crate; anything implementing [`SampleSource`] can be
//! plugged into the collector. [`SimulatedSource`] produces plausible
//! readings for development and testing.

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

use crate::reading::Measurement;

/// Errors raised by a sample source.
#[derive(Debug, Error)]
pub enum SampleError {
    /// Sensor or bus did not answer
    #[error("sensor unreachable: {0}")]
    Unreachable(String),

    /// Sensor answered with something that is not a valid reading
    #[error("malformed reading: {0}")]
    Malformed(String),
}

/// Capability that produces one measurement set per call.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Fetch a single sample. Called at most once per collector tick.
    async fn fetch_sample(&self) -> Result<Measurement, SampleError>;
}

/// A simulated measurement channel.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Key of the channel in the measurement set
    pub name: String,

    /// Lower bound of generated values
    pub min: f64,

    /// Upper bound of generated values
    pub max: f64,

    /// Decimal places kept
    pub decimals: u32,
}

impl Channel {
    pub fn new(name: impl Into<String>, min: f64, max: f64, decimals: u32) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            decimals,
        }
    }

    fn sample(&self, rng: &mut impl Rng) -> f64 {
        let raw = if self.max > self.min {
            rng.gen_range(self.min..self.max)
        } else {
            self.min
        };
        let scale = 10f64.powi(self.decimals as i32);
        (raw * scale).round() / scale
    }
}

/// Configuration for the simulated source.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Channels included in every sample
    pub channels: Vec<Channel>,

    /// Probability (0.0 - 1.0) that a fetch fails as unreachable
    pub failure_rate: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                Channel::new("temperature", 20.0, 25.0, 2),
                Channel::new("humidity", 50.0, 60.0, 1),
                Channel::new("voltage", 220.0, 240.0, 1),
            ],
            failure_rate: 0.0,
        }
    }
}

/// Sample source that generates random values within fixed ranges.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    config: SimulatorConfig,
}

impl SimulatedSource {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Generate one measurement set synchronously.
    pub fn generate(&self) -> Result<Measurement, SampleError> {
        let mut rng = rand::thread_rng();

        if self.config.failure_rate > 0.0 && rng.gen_bool(self.config.failure_rate.min(1.0)) {
            return Err(SampleError::Unreachable(
                "simulated bus timeout".to_string(),
            ));
        }

        let mut measurement = Measurement::new();
        for channel in &self.config.channels {
            let value = serde_json::Number::from_f64(channel.sample(&mut rng)).ok_or_else(|| {
                SampleError::Malformed(format!("non-finite value on {}", channel.name))
            })?;
            measurement.insert(channel.name.clone(), serde_json::Value::Number(value));
        }
        Ok(measurement)
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl SampleSource for SimulatedSource {
    async fn fetch_sample(&self) -> Result<Measurement, SampleError> {
        self.generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_channels() {
        let config = SimulatorConfig::default();
        let names: Vec<_> = config.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["temperature", "humidity", "voltage"]);
        assert_eq!(config.failure_rate, 0.0);
    }

    #[test]
    fn test_generated_values_within_range() {
        let source = SimulatedSource::with_defaults();
        for _ in 0..100 {
            let m = source.generate().unwrap();
            let temp = m["temperature"].as_f64().unwrap();
            let humidity = m["humidity"].as_f64().unwrap();
            let voltage = m["voltage"].as_f64().unwrap();
            assert!((20.0..=25.0).contains(&temp));
            assert!((50.0..=60.0).contains(&humidity));
            assert!((220.0..=240.0).contains(&voltage));
        }
    }

    #[test]
    fn test_channel_rounding() {
        let channel = Channel::new("x", 1.0, 2.0, 1);
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let v = channel.sample(&mut rng);
            assert!(((v * 10.0).round() - v * 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_degenerate_channel_range() {
        let channel = Channel::new("fixed", 3.0, 3.0, 0);
        assert_eq!(channel.sample(&mut rand::thread_rng()), 3.0);
    }

    #[test]
    fn test_failure_rate_one_always_fails() {
        let source = SimulatedSource::new(SimulatorConfig {
            failure_rate: 1.0,
            ..SimulatorConfig::default()
        });
        assert!(matches!(source.generate(), Err(SampleError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_fetch_sample_via_trait() {
        let source: Box<dyn SampleSource> = Box::new(SimulatedSource::with_defaults());
        let m = source.fetch_sample().await.unwrap();
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_sample_error_display() {
        let err = SampleError::Malformed("register 3".to_string());
        assert_eq!(format!("{}", err), "malformed reading: register 3");
    }
}
