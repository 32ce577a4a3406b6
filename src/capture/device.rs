//! Device adapter seam between the pipeline and a camera driver

use crate::capture::frame::Frame;
use crate::capture::mode::ConfigurationProfile;
use crate::error::DeviceError;

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// A camera the pipeline can drive.
///
/// The controller calls these from its own thread; once data flow has begun only the
/// capture loop calls [`read_frame`](DeviceAdapter::read_frame), and the controller
/// does not touch the device again until the loop has been joined.
pub trait DeviceAdapter: Send + 'static {
    fn open(&mut self) -> DeviceResult<()>;

    fn close(&mut self) -> DeviceResult<()>;

    fn is_open(&self) -> bool;

    fn configure(&mut self, profile: &ConfigurationProfile) -> DeviceResult<()>;

    fn begin_data_flow(&mut self) -> DeviceResult<()>;

    fn end_data_flow(&mut self) -> DeviceResult<()>;

    /// Block until the device yields one frame or fails.
    fn read_frame(&mut self) -> DeviceResult<Frame>;
}

impl<D: DeviceAdapter + ?Sized> DeviceAdapter for Box<D> {
    fn open(&mut self) -> DeviceResult<()> {
        (**self).open()
    }

    fn close(&mut self) -> DeviceResult<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn configure(&mut self, profile: &ConfigurationProfile) -> DeviceResult<()> {
        (**self).configure(profile)
    }

    fn begin_data_flow(&mut self) -> DeviceResult<()> {
        (**self).begin_data_flow()
    }

    fn end_data_flow(&mut self) -> DeviceResult<()> {
        (**self).end_data_flow()
    }

    fn read_frame(&mut self) -> DeviceResult<Frame> {
        (**self).read_frame()
    }
}
