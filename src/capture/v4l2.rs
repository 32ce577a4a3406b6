//! V4L2 camera adapter

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::{DeviceAdapter, DeviceResult};
use crate::capture::frame::{Frame, Metadata, PixelFormat};
use crate::capture::mode::{ConfigurationProfile, TriggerSource};
use crate::error::DeviceError;

const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_AUTOGAIN: u32 = 0x0098_0912;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const EXPOSURE_AUTO: i64 = 0;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Mono8 => FourCC::new(b"GREY"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
    }
}

fn pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"GREY" => Some(PixelFormat::Mono8),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"NV12" => Some(PixelFormat::Nv12),
        _ => None,
    }
}

/// Free-running V4L2 camera with memory-mapped buffers
pub struct V4l2Device {
    path: String,
    width: u32,
    height: u32,
    buffer_count: u32,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    format: PixelFormat,
}

impl V4l2Device {
    pub fn new(path: impl Into<String>, width: u32, height: u32, buffer_count: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            buffer_count: buffer_count.max(1),
            device: None,
            stream: None,
            format: PixelFormat::Mjpeg,
        }
    }

    fn device(&self) -> DeviceResult<&Device> {
        self.device.as_ref().ok_or(DeviceError::NotOpen)
    }

    fn set_control(device: &Device, id: u32, value: Value) -> bool {
        match device.set_control(Control { id, value }) {
            Ok(()) => true,
            Err(e) => {
                // Plenty of UVC cameras lack one control or another
                debug!("Control {:#x} not applied: {}", id, e);
                false
            }
        }
    }
}

impl DeviceAdapter for V4l2Device {
    #[instrument(skip(self), fields(path = %self.path))]
    fn open(&mut self) -> DeviceResult<()> {
        let device = Device::with_path(&self.path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::Unsupported(format!(
                "{} doesn't support video capture",
                self.path
            )));
        }

        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        self.stream = None;
        if self.device.take().is_some() {
            info!("Closed {}", self.path);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn configure(&mut self, profile: &ConfigurationProfile) -> DeviceResult<()> {
        if profile.trigger.source != TriggerSource::Off {
            return Err(DeviceError::Unsupported(
                "V4L2 devices have no external trigger input".into(),
            ));
        }

        let device = self.device()?;

        let mut fmt = device.format()?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = fourcc(profile.pixel_format);
        let applied = device.set_format(&fmt)?;

        // Drivers substitute the closest format they support
        let format = pixel_format(applied.fourcc).ok_or_else(|| {
            DeviceError::Unsupported(format!("negotiated fourcc {}", applied.fourcc))
        })?;
        if format != profile.pixel_format {
            warn!(
                "{:?} not supported by {}, capturing {:?}",
                profile.pixel_format, self.path, format
            );
        }

        Self::set_control(
            device,
            CID_AUTO_WHITE_BALANCE,
            Value::Boolean(profile.auto_white_balance),
        );
        Self::set_control(device, CID_AUTOGAIN, Value::Boolean(profile.auto_exposure_gain));
        if profile.auto_exposure_gain
            && !Self::set_control(device, CID_EXPOSURE_AUTO, Value::Integer(EXPOSURE_AUTO))
        {
            // UVC cameras usually only offer aperture priority
            Self::set_control(
                device,
                CID_EXPOSURE_AUTO,
                Value::Integer(EXPOSURE_APERTURE_PRIORITY),
            );
        }

        self.width = applied.width;
        self.height = applied.height;
        self.format = format;
        info!("Configured {}x{} {:?}", self.width, self.height, self.format);
        Ok(())
    }

    fn begin_data_flow(&mut self) -> DeviceResult<()> {
        let stream =
            MmapStream::with_buffers(self.device()?, Type::VideoCapture, self.buffer_count)?;

        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    fn end_data_flow(&mut self) -> DeviceResult<()> {
        // Dropping the stream stops it and releases the buffers
        self.stream = None;
        Ok(())
    }

    fn read_frame(&mut self) -> DeviceResult<Frame> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotStreaming)?;

        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        let meta = Metadata {
            frame_id: u64::from(meta.sequence),
            timestamp: meta.timestamp.sec as f64 + meta.timestamp.usec as f64 / 1e6,
            gain: Metadata::UNKNOWN_GAIN,
            exposure: 0.0,
            width: self.width,
            height: self.height,
            format: self.format,
        };

        Ok(Frame::new(data, meta))
    }
}

/// Probe `/dev/video0` to `/dev/video9` for the first capture device offering MJPEG or YUYV.
pub fn auto_detect_device() -> DeviceResult<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }

        if let Ok(formats) = dev.enum_formats() {
            for fmt in formats {
                match pixel_format(fmt.fourcc) {
                    Some(format @ (PixelFormat::Mjpeg | PixelFormat::Yuyv4)) => {
                        info!("Found {:?} device: {} - {}", format, path, caps.card);
                        return Ok(FoundDevice { path, format });
                    }
                    _ => {}
                }
            }
        }
    }

    Err(DeviceError::NotFound("no suitable capture device".into()))
}
