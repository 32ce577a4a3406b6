//! Synthetic camera producing a moving test pattern
//!
//! Paces itself like real hardware: in free-run it yields one frame per frame period,
//! in manual mode it keeps repeating the last exposure's readout until [`TriggerHandle::fire`]
//! arms a new one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::device::{DeviceAdapter, DeviceResult};
use crate::capture::frame::{Frame, Metadata, PixelFormat};
use crate::capture::mode::ConfigurationProfile;
use crate::error::DeviceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Every n-th read fails, 0 disables failure injection
    pub fail_every: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            fail_every: 0,
        }
    }
}

/// Arms external trigger edges on a [`SimulatedDevice`] from another thread
#[derive(Debug, Clone, Default)]
pub struct TriggerHandle {
    pending: Arc<AtomicU64>,
}

impl TriggerHandle {
    pub fn fire(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn take(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct SimulatedDevice {
    config: SimulatedConfig,
    profile: Option<ConfigurationProfile>,
    open: bool,
    streaming: bool,
    frame_id: u64,
    reads: u64,
    last: Option<Frame>,
    trigger: TriggerHandle,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            profile: None,
            open: false,
            streaming: false,
            frame_id: 0,
            reads: 0,
            last: None,
            trigger: TriggerHandle::default(),
        }
    }

    pub fn trigger_handle(&self) -> TriggerHandle {
        self.trigger.clone()
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.config.fps.max(1)))
    }

    fn expose(&mut self, format: PixelFormat) -> Frame {
        self.frame_id += 1;
        let (width, height) = (self.config.width, self.config.height);
        let len = format
            .frame_len(width, height)
            .unwrap_or(width as usize * height as usize);

        // Diagonal gradient that scrolls one pixel per frame
        let shift = self.frame_id as usize;
        let bpp = format.bytes_per_pixel().unwrap_or(1);
        let row = width as usize * bpp;
        let data: Vec<u8> = (0..len)
            .map(|i| {
                let (y, x) = (i / row.max(1), (i % row.max(1)) / bpp);
                (x + y + shift) as u8
            })
            .collect();

        let meta = Metadata {
            frame_id: self.frame_id,
            timestamp: self.frame_id as f64 * self.frame_period().as_secs_f64(),
            gain: 0.0,
            exposure: self.frame_period().as_micros() as f64,
            width,
            height,
            format,
        };

        Frame::new(Bytes::from(data), meta)
    }
}

impl DeviceAdapter for SimulatedDevice {
    fn open(&mut self) -> DeviceResult<()> {
        info!("Opening simulated camera");
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        info!("Closing simulated camera");
        self.open = false;
        self.streaming = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn configure(&mut self, profile: &ConfigurationProfile) -> DeviceResult<()> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        if profile.pixel_format.bytes_per_pixel().is_none() {
            return Err(DeviceError::Unsupported(format!(
                "pixel format {:?}",
                profile.pixel_format
            )));
        }
        debug!("Simulated camera configured: {:?}", profile.mode);
        self.profile = Some(profile.clone());
        Ok(())
    }

    fn begin_data_flow(&mut self) -> DeviceResult<()> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.streaming = true;
        self.last = None;
        Ok(())
    }

    fn end_data_flow(&mut self) -> DeviceResult<()> {
        self.streaming = false;
        Ok(())
    }

    fn read_frame(&mut self) -> DeviceResult<Frame> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        if !self.streaming {
            return Err(DeviceError::NotStreaming);
        }

        thread::sleep(self.frame_period());

        self.reads += 1;
        if self.config.fail_every > 0 && self.reads % self.config.fail_every == 0 {
            return Err(DeviceError::Other(format!("injected failure on read {}", self.reads)));
        }

        let (manual, format) = self
            .profile
            .as_ref()
            .map(|p| (p.is_manual(), p.pixel_format))
            .unwrap_or((false, PixelFormat::Rgb24));

        if manual && !self.trigger.take() {
            // No new edge: the sensor repeats the last readout
            return self
                .last
                .clone()
                .ok_or(DeviceError::Timeout(self.frame_period().as_millis() as u64));
        }

        let frame = self.expose(format);
        self.last = Some(frame.clone());
        Ok(frame)
    }
}
