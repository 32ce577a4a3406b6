use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One captured image with its acquisition metadata.
///
/// Frames are immutable once built; the pipeline hands them around as `Arc<Frame>`.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel data, shared without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Metadata,
}

impl Frame {
    pub fn new(data: Bytes, meta: Metadata) -> Self {
        Self { data, meta }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }
}

/// Acquisition metadata reported by the device for a single frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Device frame counter, non-decreasing within a session
    pub frame_id: u64,
    /// Device clock, seconds
    pub timestamp: f64,
    /// Decibels, -1 if the device doesn't report it
    pub gain: f64,
    /// Microseconds
    pub exposure: f64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Metadata {
    pub const UNKNOWN_GAIN: f64 = -1.0;

    pub fn has_gain(&self) -> bool {
        self.gain >= 0.0
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            frame_id: 0,
            timestamp: 0.0,
            gain: Self::UNKNOWN_GAIN,
            exposure: 0.0,
            width: 0,
            height: 0,
            format: PixelFormat::Rgb24,
        }
    }
}

/// Pixel layouts a device may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Mono8,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed layouts; `None` for compressed or planar data.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mono8 => Some(1),
            PixelFormat::Mjpeg | PixelFormat::Nv12 => None,
        }
    }

    /// Expected payload size of an uncompressed frame
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        match self {
            PixelFormat::Nv12 => Some(width as usize * height as usize * 3 / 2),
            _ => self
                .bytes_per_pixel()
                .map(|bpp| width as usize * height as usize * bpp),
        }
    }
}
