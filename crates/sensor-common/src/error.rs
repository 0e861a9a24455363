//! Error types for the sensor

use thiserror::Error;

/// Sensor error type
#[derive(Error, Debug)]
pub enum SensorError {
    /// Configuration document could not be read
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Configuration document is malformed
    #[error("config error: {0}")]
    ConfigError(String),

    /// JSON decoding failed
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for the sensor
pub type SensorResult<T> = Result<T, SensorError>;
