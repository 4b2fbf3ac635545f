//! Error types for trajectory forecasting operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VrnnError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    #[error("Observed history too short: need at least 2 steps, got {got}")]
    InsufficientHistory { got: usize },

    #[error("Future length {got} does not match the prediction horizon {expected}")]
    HorizonMismatch { expected: usize, got: usize },

    #[error("Capacity exceeded for {what}: limit {limit}, got {got}")]
    CapacityExceeded {
        what: &'static str,
        limit: usize,
        got: usize,
    },

    #[error("Graph aggregation width {width} exceeds the configured width {max}")]
    GraphWidth { width: usize, max: usize },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
