pub mod capture_loop;
pub mod controller;
pub mod ringbuf;

pub use capture_loop::{CaptureLoop, CaptureOptions, LoopCounters, LoopStats};
pub use controller::{
    AcquisitionController, AcquisitionStats, ControllerOptions, DedupKey, Retrieval, SessionState,
};
pub use ringbuf::{BufferStats, FrameBuffer};
