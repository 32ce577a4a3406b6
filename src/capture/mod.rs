pub mod device;
pub mod frame;
pub mod mode;
pub mod simulated;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use device::DeviceAdapter;
pub use frame::{Frame, Metadata, PixelFormat};
pub use mode::{AcquisitionMode, ConfigurationProfile};
pub use simulated::{SimulatedConfig, SimulatedDevice, TriggerHandle};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Device;
