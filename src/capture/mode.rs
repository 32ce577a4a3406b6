//! Operating-mode policy: which device parameters free-run and trigger modes need

use serde::{Deserialize, Serialize};

use super::frame::PixelFormat;

/// How the device paces frame production
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    /// Device produces frames at its own pace
    FreeRun,
    /// Device exposes one frame per external trigger edge
    Manual,
}

impl AcquisitionMode {
    pub fn from_manual(manual: bool) -> Self {
        if manual {
            AcquisitionMode::Manual
        } else {
            AcquisitionMode::FreeRun
        }
    }

    pub fn is_manual(self) -> bool {
        self == AcquisitionMode::Manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    /// Next capture starts automatically after the previous one
    Off,
    RisingEdge,
    FallingEdge,
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSelector {
    FrameStart,
    ExposureStart,
    FrameBurstStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpiMode {
    /// Input not used for triggering
    Off,
    Trigger,
}

/// Input debounce timing, both values in units of 10 µs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Debounce {
    /// Transition to inactive level
    pub t0: u32,
    /// Transition to active level
    pub t1: u32,
}

/// Trigger wiring for one operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub source: TriggerSource,
    pub selector: TriggerSelector,
    /// Whether a new trigger may start exposure while the previous readout is running.
    /// `None` leaves the device default untouched.
    pub overlap: Option<bool>,
    pub gpi_port: u8,
    pub gpi_mode: GpiMode,
    pub debounce: Option<Debounce>,
}

/// Complete parameter set applied to the device at configure time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationProfile {
    pub mode: AcquisitionMode,
    pub pixel_format: PixelFormat,
    pub auto_white_balance: bool,
    pub auto_exposure_gain: bool,
    /// 1.0 = exposure only, 0.0 = gain only
    pub exposure_priority: f32,
    /// Target output intensity for auto exposure/gain, percent
    pub aeag_level: u8,
    pub trigger: TriggerSettings,
}

impl ConfigurationProfile {
    pub fn is_manual(&self) -> bool {
        self.mode.is_manual()
    }
}

const TRIGGER_GPI_PORT: u8 = 1;

/// Resolve the parameter set for the requested mode.
pub fn resolve(manual: bool) -> ConfigurationProfile {
    let mode = AcquisitionMode::from_manual(manual);

    let trigger = match mode {
        AcquisitionMode::FreeRun => TriggerSettings {
            source: TriggerSource::Off,
            selector: TriggerSelector::FrameStart,
            overlap: Some(false),
            gpi_port: TRIGGER_GPI_PORT,
            gpi_mode: GpiMode::Off,
            debounce: None,
        },
        AcquisitionMode::Manual => TriggerSettings {
            source: TriggerSource::RisingEdge,
            selector: TriggerSelector::FrameStart,
            overlap: None,
            gpi_port: TRIGGER_GPI_PORT,
            gpi_mode: GpiMode::Trigger,
            debounce: Some(Debounce { t0: 100, t1: 50 }),
        },
    };

    ConfigurationProfile {
        mode,
        pixel_format: PixelFormat::Rgb24,
        auto_white_balance: true,
        auto_exposure_gain: true,
        exposure_priority: 0.5,
        aeag_level: 50,
        trigger,
    }
}
