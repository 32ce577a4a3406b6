pub mod capture;
pub mod error;
pub mod pipeline;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{DeviceAdapter, Frame, Metadata, PixelFormat};
pub use error::{AcquisitionError, DeviceError, Result};
pub use pipeline::{AcquisitionController, ControllerOptions, DedupKey, Retrieval, SessionState};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Simulated,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub device: DeviceKind,
    /// V4L2 device node, empty to auto-detect
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Driver-side buffers for memory-mapped streaming
    pub buffer_count: u32,
    /// Arm the external hardware trigger instead of free-running
    pub manual: bool,
    /// Simulated device only: every n-th read fails, 0 disables
    pub fail_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub buffer_capacity: usize,
    pub warmup_frames: u64,
    pub read_failure_backoff_ms: u64,
    pub dedup_key: DedupKey,
    pub poll_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Simulated,
            path: String::new(),
            width: 640,
            height: 480,
            fps: 30,
            buffer_count: 4,
            manual: false,
            fail_every: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            warmup_frames: 0,
            read_failure_backoff_ms: 10,
            dedup_key: DedupKey::Timestamp,
            poll_interval_ms: 5,
        }
    }
}

impl Config {
    /// Layer an optional TOML file and `XICAM_*` environment variables over the defaults.
    ///
    /// Nested keys use a double underscore, e.g. `XICAM_PIPELINE__BUFFER_CAPACITY=4`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("XICAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.buffer_capacity == 0 {
            return Err(AcquisitionError::InvalidCapacity);
        }
        if self.pipeline.poll_interval_ms == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "pipeline.poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.capture.fps == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "capture.fps must be at least 1".into(),
            ));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(AcquisitionError::InvalidConfig(format!(
                "capture resolution {}x{} is empty",
                self.capture.width, self.capture.height
            )));
        }
        Ok(())
    }
}
