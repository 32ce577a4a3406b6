//! Background worker pulling frames from the device into the frame buffer

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capture::DeviceAdapter;
use crate::error::{AcquisitionError, Result};
use crate::pipeline::ringbuf::FrameBuffer;

/// Pause after a failed read unless configured otherwise
pub const DEFAULT_READ_FAILURE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Successful reads discarded at session start while auto exposure settles
    pub warmup_frames: u64,
    /// Pause after a failed read before retrying
    pub read_failure_backoff: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            warmup_frames: 0,
            read_failure_backoff: DEFAULT_READ_FAILURE_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub read_failures: u64,
}

/// Live loop counters, shared with the worker thread.
///
/// They stay readable after the thread is gone, including when it panicked.
#[derive(Debug, Default)]
pub struct LoopCounters {
    frames_captured: AtomicU64,
    frames_skipped: AtomicU64,
    read_failures: AtomicU64,
}

impl LoopCounters {
    pub fn snapshot(&self) -> LoopStats {
        LoopStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running capture thread.
///
/// The thread only talks to consumers through [`FrameBuffer::push`]. It exits at the
/// top of the first iteration after the stop flag is raised.
pub struct CaptureLoop {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    counters: Arc<LoopCounters>,
}

impl CaptureLoop {
    pub fn spawn<D: DeviceAdapter>(
        device: Arc<Mutex<D>>,
        buffer: Arc<FrameBuffer>,
        options: CaptureOptions,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(LoopCounters::default());

        let worker = Worker {
            device,
            buffer,
            stop: Arc::clone(&stop),
            counters: Arc::clone(&counters),
            options,
            warmup_remaining: options.warmup_frames,
        };

        let handle = thread::Builder::new()
            .name("xicam-capture".into())
            .spawn(move || worker.run())
            .map_err(AcquisitionError::WorkerSpawn)?;

        info!("Capture loop started");

        Ok(Self {
            handle: Some(handle),
            stop,
            counters,
        })
    }

    pub fn stats(&self) -> LoopStats {
        self.counters.snapshot()
    }

    pub fn counters(&self) -> Arc<LoopCounters> {
        Arc::clone(&self.counters)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Raise the stop flag and block until the thread has exited.
    pub fn stop(mut self) -> Result<LoopStats> {
        self.join()?;
        Ok(self.counters.snapshot())
    }

    /// Like [`stop`](Self::stop), but keeps the handle so the counters stay reachable
    /// when the thread panicked.
    pub fn join(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.join().map_err(|_| AcquisitionError::WorkerPanicked)?;
        info!("Capture loop stopped");
        Ok(())
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!("Capture loop ended abnormally: {}", e);
        }
    }
}

struct Worker<D> {
    device: Arc<Mutex<D>>,
    buffer: Arc<FrameBuffer>,
    stop: Arc<AtomicBool>,
    counters: Arc<LoopCounters>,
    options: CaptureOptions,
    warmup_remaining: u64,
}

impl<D: DeviceAdapter> Worker<D> {
    fn run(mut self) {
        debug!(
            "Capture loop running, buffer capacity {}, warm-up {} frames",
            self.buffer.capacity(),
            self.options.warmup_frames
        );

        while !self.stop.load(Ordering::Acquire) {
            if !self.capture_once() && !self.options.read_failure_backoff.is_zero() {
                thread::sleep(self.options.read_failure_backoff);
            }
        }

        debug!("Capture loop observed stop signal, exiting");
    }

    /// One read cycle. Returns false if the device failed to deliver a frame.
    fn capture_once(&mut self) -> bool {
        let started = Instant::now();
        let result = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_frame();
        metrics::histogram!("frame_read_time_us").record(started.elapsed().as_micros() as f64);

        match result {
            Ok(_) if self.warmup_remaining > 0 => {
                self.warmup_remaining -= 1;
                self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(frame) => {
                self.buffer.push(frame);
                self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_captured").increment(1);
                true
            }
            Err(e) => {
                let err = AcquisitionError::FrameReadFailure(e);
                warn!("{}, skipping frame", err);
                self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frame_read_failures").increment(1);
                false
            }
        }
    }
}
