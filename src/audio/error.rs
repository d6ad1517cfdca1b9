//! Audio error types

use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Failed to allocate {count} sample buffers of {size} bytes")]
    PoolAllocation { count: usize, size: usize },

    #[error("Failed to allocate a delay line of {samples} samples")]
    DelayLineAllocation { samples: usize },

    #[error("Device rejected state change: {0}")]
    DeviceStateFailed(String),

    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Recording error: {0}")]
    RecordingError(String),
}
