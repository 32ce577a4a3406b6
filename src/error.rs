//! Error types for the acquisition pipeline

use thiserror::Error;

use crate::pipeline::controller::SessionState;

pub type Result<T> = std::result::Result<T, AcquisitionError>;

/// Failures reported by a [`DeviceAdapter`](crate::capture::DeviceAdapter)
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device is not open")]
    NotOpen,

    #[error("data flow has not been started")]
    NotStreaming,

    #[error("unsupported setting: {0}")]
    Unsupported(String),

    #[error("device timed out after {0} ms")]
    Timeout(u64),

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("failed to open device: {0}")]
    DeviceOpenFailure(#[source] DeviceError),

    #[error("failed to configure device: {0}")]
    DeviceConfigureFailure(#[source] DeviceError),

    #[error("failed to start acquisition: {0}")]
    AcquisitionStartFailure(#[source] DeviceError),

    #[error("failed to stop device: {0}")]
    DeviceCloseFailure(#[source] DeviceError),

    /// Per-cycle read failure; the capture loop recovers from these on its own
    #[error("failed to read frame: {0}")]
    FrameReadFailure(#[source] DeviceError),

    #[error("cannot {action} while {from:?}")]
    InvalidStateTransition {
        from: SessionState,
        action: &'static str,
    },

    #[error("frame buffer capacity must be at least 1")]
    InvalidCapacity,

    #[error("failed to spawn capture thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("capture thread panicked")]
    WorkerPanicked,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
