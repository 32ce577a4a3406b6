//! Acquisition lifecycle and consumer-side delivery
//!
//! The controller owns the session state machine
//! (`Closed -> Configured -> Acquiring -> Stopping -> Closed`), the capture loop and the
//! delivery cursor. Lifecycle calls are serialized among themselves; [`retrieve`],
//! `state()`, `mode()` and `stats()` never wait on them, so a consumer polling during a
//! slow `stop()` sees `NotAcquiring` instead of blocking.
//!
//! [`retrieve`]: AcquisitionController::retrieve

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::mode::{self, AcquisitionMode, ConfigurationProfile};
use crate::capture::{DeviceAdapter, Frame, Metadata};
use crate::error::{AcquisitionError, Result};
use crate::pipeline::capture_loop::{CaptureLoop, CaptureOptions, LoopCounters, LoopStats};
use crate::pipeline::ringbuf::{BufferStats, FrameBuffer};
use crate::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Closed,
    Configured,
    Acquiring,
    Stopping,
}

/// Which metadata field identifies a physical exposure for deduplication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupKey {
    #[default]
    Timestamp,
    FrameId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DeliveredKey {
    Timestamp(f64),
    FrameId(u64),
}

impl DedupKey {
    fn of(self, meta: &Metadata) -> DeliveredKey {
        match self {
            DedupKey::Timestamp => DeliveredKey::Timestamp(meta.timestamp),
            DedupKey::FrameId => DeliveredKey::FrameId(meta.frame_id),
        }
    }
}

/// Outcome of a single [`AcquisitionController::retrieve`] call
#[derive(Debug, Clone)]
pub enum Retrieval {
    Frame(Arc<Frame>),
    /// No frame waiting in the buffer
    Empty,
    /// Trigger mode re-read of an exposure that was already delivered
    Duplicate,
    NotAcquiring,
}

impl Retrieval {
    pub fn into_frame(self) -> Option<Arc<Frame>> {
        match self {
            Retrieval::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Retrieval::Frame(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub buffer_capacity: usize,
    pub capture: CaptureOptions,
    pub dedup_key: DedupKey,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            capture: CaptureOptions::default(),
            dedup_key: DedupKey::default(),
        }
    }
}

impl From<&PipelineConfig> for ControllerOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            buffer_capacity: config.buffer_capacity,
            capture: CaptureOptions {
                warmup_frames: config.warmup_frames,
                read_failure_backoff: Duration::from_millis(config.read_failure_backoff_ms),
            },
            dedup_key: config.dedup_key,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub buffer: BufferStats,
    /// Capture loop counters of the running session, or of the last one
    pub capture: LoopStats,
    pub frames_delivered: u64,
    pub duplicates_suppressed: u64,
}

struct Lifecycle {
    profile: Option<ConfigurationProfile>,
    capture: Option<CaptureLoop>,
}

struct Cursor {
    mode: AcquisitionMode,
    /// `None` until the first delivery of a session
    last_delivered: Option<DeliveredKey>,
}

pub struct AcquisitionController<D: DeviceAdapter = Box<dyn DeviceAdapter>> {
    device: Arc<Mutex<D>>,
    options: ControllerOptions,
    buffer: Arc<FrameBuffer>,
    state: Mutex<SessionState>,
    mode: Mutex<Option<AcquisitionMode>>,
    /// Counters of the running session, or of the last one
    loop_counters: Mutex<Arc<LoopCounters>>,
    lifecycle: Mutex<Lifecycle>,
    cursor: Mutex<Cursor>,
    frames_delivered: AtomicU64,
    duplicates_suppressed: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D: DeviceAdapter> AcquisitionController<D> {
    pub fn new(device: D, options: ControllerOptions) -> Result<Self> {
        let buffer = FrameBuffer::new(options.buffer_capacity)?;

        Ok(Self {
            device: Arc::new(Mutex::new(device)),
            options,
            buffer: Arc::new(buffer),
            state: Mutex::new(SessionState::Closed),
            mode: Mutex::new(None),
            loop_counters: Mutex::new(Arc::new(LoopCounters::default())),
            lifecycle: Mutex::new(Lifecycle {
                profile: None,
                capture: None,
            }),
            cursor: Mutex::new(Cursor {
                mode: AcquisitionMode::FreeRun,
                last_delivered: None,
            }),
            frames_delivered: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("Session state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub fn is_acquiring(&self) -> bool {
        self.state() == SessionState::Acquiring
    }

    /// Mode of the configured or running session
    pub fn mode(&self) -> Option<AcquisitionMode> {
        *lock(&self.mode)
    }

    fn set_profile(&self, lifecycle: &mut Lifecycle, profile: Option<ConfigurationProfile>) {
        *lock(&self.mode) = profile.as_ref().map(|p| p.mode);
        lifecycle.profile = profile;
    }

    /// Open the device if needed and apply the parameter set for `manual`.
    #[instrument(skip(self))]
    pub fn configure(&self, manual: bool) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);

        let state = self.state();
        if !matches!(state, SessionState::Closed | SessionState::Configured) {
            return Err(AcquisitionError::InvalidStateTransition {
                from: state,
                action: "configure",
            });
        }

        let profile = mode::resolve(manual);
        let mut device = lock(&self.device);

        if !device.is_open() {
            info!("Opening device");
            if let Err(e) = device.open() {
                error!("Device cannot be opened: {}", e);
                self.set_profile(&mut lifecycle, None);
                self.set_state(SessionState::Closed);
                return Err(AcquisitionError::DeviceOpenFailure(e));
            }
        }

        if let Err(e) = device.configure(&profile) {
            error!("Device cannot be configured: {}", e);
            close_quietly(&mut *device);
            self.set_profile(&mut lifecycle, None);
            self.set_state(SessionState::Closed);
            return Err(AcquisitionError::DeviceConfigureFailure(e));
        }

        info!("Configured for {:?} acquisition", profile.mode);
        self.set_profile(&mut lifecycle, Some(profile));
        self.set_state(SessionState::Configured);
        Ok(())
    }

    /// Begin data flow and spawn the capture loop.
    ///
    /// On failure the session stays `Configured` so the caller may retry.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);

        let state = self.state();
        let profile = match (state, lifecycle.profile.as_ref()) {
            (SessionState::Configured, Some(profile)) => profile.clone(),
            _ => {
                return Err(AcquisitionError::InvalidStateTransition {
                    from: state,
                    action: "start",
                })
            }
        };

        if let Err(e) = lock(&self.device).begin_data_flow() {
            error!("Acquisition cannot be started: {}", e);
            return Err(AcquisitionError::AcquisitionStartFailure(e));
        }

        let stale = self.buffer.clear();
        if stale > 0 {
            debug!("Discarded {} frames from a previous session", stale);
        }
        {
            let mut cursor = lock(&self.cursor);
            cursor.mode = profile.mode;
            cursor.last_delivered = None;
        }

        let capture = match CaptureLoop::spawn(
            Arc::clone(&self.device),
            Arc::clone(&self.buffer),
            self.options.capture,
        ) {
            Ok(capture) => capture,
            Err(e) => {
                error!("Capture loop cannot be spawned: {}", e);
                if let Err(e) = lock(&self.device).end_data_flow() {
                    warn!("Failed to end data flow after aborted start: {}", e);
                }
                return Err(e);
            }
        };

        *lock(&self.loop_counters) = capture.counters();
        lifecycle.capture = Some(capture);
        self.set_state(SessionState::Acquiring);
        info!(
            "Acquisition started in {:?} mode, buffer capacity {}",
            profile.mode,
            self.buffer.capacity()
        );
        Ok(())
    }

    /// Stop the capture loop, wait for it to exit, then halt and close the device.
    ///
    /// Returns only after the loop has exited; no frame is pushed afterwards.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);

        let state = self.state();
        if state != SessionState::Acquiring {
            warn!("Stop requested while {:?}", state);
            return Err(AcquisitionError::InvalidStateTransition {
                from: state,
                action: "stop",
            });
        }

        self.set_state(SessionState::Stopping);

        // Counters stay with the controller even if the worker panicked
        let joined = match lifecycle.capture.take() {
            Some(mut capture) => capture.join(),
            None => Ok(()),
        };

        // The loop is gone (or dead), so the device is ours again
        let teardown = {
            let mut device = lock(&self.device);
            let ended = device.end_data_flow();
            let closed = device.close();
            ended.and(closed)
        };

        self.set_profile(&mut lifecycle, None);
        self.set_state(SessionState::Closed);

        joined.inspect_err(|e| error!("Capture loop ended abnormally: {}", e))?;
        teardown.map_err(|e| {
            error!("Device cannot be closed: {}", e);
            AcquisitionError::DeviceCloseFailure(e)
        })?;

        info!("Acquisition stopped");
        Ok(())
    }

    /// Hand out the oldest buffered frame that hasn't been delivered yet.
    ///
    /// Never blocks on the capture loop. In manual mode a frame whose dedup key matches
    /// the last delivered one is a repeated readout and is reported as a duplicate.
    /// Concurrent callers share one cursor, so each frame goes to only one of them.
    pub fn retrieve(&self) -> Retrieval {
        if !self.is_acquiring() {
            return Retrieval::NotAcquiring;
        }

        let mut cursor = lock(&self.cursor);

        let Some(frame) = self.buffer.pop_oldest() else {
            return Retrieval::Empty;
        };

        let key = self.options.dedup_key.of(&frame.meta);
        if cursor.mode.is_manual() && cursor.last_delivered == Some(key) {
            self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
            return Retrieval::Duplicate;
        }

        cursor.last_delivered = Some(key);
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_delivered").increment(1);
        Retrieval::Frame(frame)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            buffer: self.buffer.stats(),
            capture: lock(&self.loop_counters).snapshot(),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
        }
    }
}

fn close_quietly<D: DeviceAdapter>(device: &mut D) {
    if let Err(e) = device.close() {
        warn!("Failed to close device: {}", e);
    }
}

impl<D: DeviceAdapter> Drop for AcquisitionController<D> {
    fn drop(&mut self) {
        if self.is_acquiring() {
            if let Err(e) = self.stop() {
                error!("Failed to stop acquisition on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SimulatedConfig, SimulatedDevice};
    use std::thread;
    use std::time::Instant;

    fn controller(capacity: usize) -> AcquisitionController<SimulatedDevice> {
        let device = SimulatedDevice::new(SimulatedConfig {
            width: 4,
            height: 2,
            fps: 1000,
            fail_every: 0,
        });
        AcquisitionController::new(
            device,
            ControllerOptions {
                buffer_capacity: capacity,
                ..ControllerOptions::default()
            },
        )
        .unwrap()
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn next_frame<D: DeviceAdapter>(ctl: &AcquisitionController<D>) -> Arc<Frame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = ctl.retrieve().into_frame() {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame delivered");
            thread::sleep(Duration::from_micros(200));
        }
    }

    #[test]
    fn zero_capacity_fails_construction() {
        let device = SimulatedDevice::new(SimulatedConfig::default());
        let result = AcquisitionController::new(
            device,
            ControllerOptions {
                buffer_capacity: 0,
                ..ControllerOptions::default()
            },
        );
        assert!(matches!(result, Err(AcquisitionError::InvalidCapacity)));
    }

    #[test]
    fn default_options_match_default_config() {
        let from_config = ControllerOptions::from(&PipelineConfig::default());
        let defaults = ControllerOptions::default();
        assert_eq!(defaults.capture, from_config.capture);
        assert_eq!(defaults.buffer_capacity, from_config.buffer_capacity);
        assert_eq!(defaults.dedup_key, from_config.dedup_key);
    }

    #[test]
    fn retrieve_before_start_is_not_acquiring() {
        let ctl = controller(3);
        assert!(matches!(ctl.retrieve(), Retrieval::NotAcquiring));
        ctl.configure(false).unwrap();
        assert!(matches!(ctl.retrieve(), Retrieval::NotAcquiring));
    }

    #[test]
    fn start_requires_configure() {
        let ctl = controller(3);
        let err = ctl.start().unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::InvalidStateTransition {
                from: SessionState::Closed,
                action: "start"
            }
        ));
        assert_eq!(ctl.state(), SessionState::Closed);
    }

    #[test]
    fn full_lifecycle() {
        let ctl = controller(3);
        ctl.configure(false).unwrap();
        assert_eq!(ctl.state(), SessionState::Configured);
        assert_eq!(ctl.mode(), Some(AcquisitionMode::FreeRun));

        ctl.start().unwrap();
        assert!(ctl.is_acquiring());
        next_frame(&ctl);

        ctl.stop().unwrap();
        assert_eq!(ctl.state(), SessionState::Closed);
        assert_eq!(ctl.mode(), None);
        assert!(matches!(ctl.retrieve(), Retrieval::NotAcquiring));
        assert!(ctl.stats().capture.frames_captured >= 1);
        assert!(ctl.stats().frames_delivered >= 1);
    }

    #[test]
    fn manual_mode_delivers_each_trigger_once() {
        let device = SimulatedDevice::new(SimulatedConfig {
            width: 2,
            height: 2,
            fps: 1000,
            fail_every: 0,
        });
        let trigger = device.trigger_handle();
        let ctl = AcquisitionController::new(device, ControllerOptions::default()).unwrap();
        ctl.configure(true).unwrap();
        ctl.start().unwrap();

        trigger.fire();
        let first = next_frame(&ctl);

        // The device keeps repeating the readout; none of it may come through
        wait_for(|| {
            assert!(!ctl.retrieve().is_frame());
            ctl.stats().duplicates_suppressed >= 3
        });

        trigger.fire();
        let second = next_frame(&ctl);
        assert!(second.meta.timestamp > first.meta.timestamp);
        ctl.stop().unwrap();
    }

    #[test]
    fn restart_resets_buffer_and_cursor() {
        let ctl = controller(2);
        ctl.configure(false).unwrap();
        ctl.start().unwrap();
        wait_for(|| ctl.buffered() == 2);
        ctl.stop().unwrap();

        ctl.configure(false).unwrap();
        ctl.start().unwrap();
        let frame = next_frame(&ctl);
        assert!(frame.meta.frame_id > 2, "stale frames from the first session were dropped");
        ctl.stop().unwrap();
    }

    #[test]
    fn drop_stops_acquisition() {
        let ctl = controller(2);
        ctl.configure(false).unwrap();
        ctl.start().unwrap();
        drop(ctl);
    }
}
