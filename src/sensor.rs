//! Environmental sensor sources
//!
//! A [`Sensor`] yields one temperature/pressure [`Reading`] per call. Reads are
//! synchronous: both implementations finish in microseconds.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Temperature in °C and pressure in hPa
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f64,
    pub pressure: f64,
}

impl Reading {
    pub fn is_finite(&self) -> bool {
        self.temperature.is_finite() && self.pressure.is_finite()
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid value '{value}' in {path}")]
    InvalidData { path: PathBuf, value: String },
    #[error("Sensor not available: {0}")]
    Unavailable(String),
}

/// Port for reading sensor data
pub trait Sensor: Send {
    fn read(&mut self) -> Result<Reading, SensorError>;
}

/// BMP180/BMP280 exposed by the Linux IIO subsystem
///
/// `in_temp_input` is in milli-degrees Celsius and `in_pressure_input` in kPa.
pub struct IioSensor {
    device_path: PathBuf,
}

impl IioSensor {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    fn read_channel(&self, channel: &str) -> Result<f64, SensorError> {
        let path = self.device_path.join(channel);
        let raw = std::fs::read_to_string(&path).map_err(|source| SensorError::Io {
            path: path.clone(),
            source,
        })?;
        parse_channel(&path, &raw)
    }
}

fn parse_channel(path: &Path, raw: &str) -> Result<f64, SensorError> {
    let value = raw.trim();
    value.parse::<f64>().map_err(|_| SensorError::InvalidData {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}

impl Sensor for IioSensor {
    fn read(&mut self) -> Result<Reading, SensorError> {
        let millidegrees = self.read_channel("in_temp_input")?;
        let kilopascals = self.read_channel("in_pressure_input")?;
        Ok(Reading {
            temperature: millidegrees / 1000.0,
            pressure: kilopascals * 10.0,
        })
    }
}

/// Deterministic readings drifting slowly around a baseline
pub struct SimulatedSensor {
    baseline: Reading,
    step: u64,
}

impl SimulatedSensor {
    pub fn new(temperature: f64, pressure: f64) -> Self {
        Self {
            baseline: Reading {
                temperature,
                pressure,
            },
            step: 0,
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl Sensor for SimulatedSensor {
    fn read(&mut self) -> Result<Reading, SensorError> {
        let phase = self.step as f64 * 0.1;
        self.step += 1;
        Ok(Reading {
            temperature: round_tenth(self.baseline.temperature + 0.5 * phase.sin()),
            pressure: round_tenth(self.baseline.pressure + 1.5 * phase.cos() - 1.5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_iio_sensor_converts_units() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in_temp_input"), "21500\n").unwrap();
        fs::write(dir.path().join("in_pressure_input"), "101.3\n").unwrap();

        let reading = IioSensor::new(dir.path()).read().unwrap();

        assert_eq!(reading.temperature, 21.5);
        assert!((reading.pressure - 1013.0).abs() < 1e-9);
    }

    #[test]
    fn test_iio_sensor_missing_channel() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in_temp_input"), "21500").unwrap();

        let err = IioSensor::new(dir.path()).read().unwrap_err();
        assert!(matches!(err, SensorError::Io { path, .. } if path.ends_with("in_pressure_input")));
    }

    #[test]
    fn test_iio_sensor_garbage_value() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in_temp_input"), "n/a").unwrap();
        fs::write(dir.path().join("in_pressure_input"), "101.3").unwrap();

        let err = IioSensor::new(dir.path()).read().unwrap_err();
        assert!(matches!(err, SensorError::InvalidData { value, .. } if value == "n/a"));
    }

    #[test]
    fn test_simulated_sensor_starts_at_baseline() {
        let mut sensor = SimulatedSensor::new(21.5, 1013.0);
        let first = sensor.read().unwrap();
        assert_eq!(first, Reading { temperature: 21.5, pressure: 1013.0 });
    }

    #[test]
    fn test_simulated_sensor_is_deterministic_and_bounded() {
        let mut a = SimulatedSensor::new(20.0, 1000.0);
        let mut b = SimulatedSensor::new(20.0, 1000.0);
        for _ in 0..100 {
            let reading = a.read().unwrap();
            assert_eq!(reading, b.read().unwrap());
            assert!(reading.is_finite());
            assert!((reading.temperature - 20.0).abs() <= 0.5);
            assert!((reading.pressure - 1000.0).abs() <= 3.0);
        }
    }

    #[test]
    fn test_reading_finiteness() {
        assert!(!Reading { temperature: f64::NAN, pressure: 1.0 }.is_finite());
        assert!(!Reading { temperature: 1.0, pressure: f64::INFINITY }.is_finite());
    }
}
