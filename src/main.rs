//! xicam acquisition daemon: runs the capture pipeline and logs delivered frames

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use xicam::capture::{DeviceAdapter, SimulatedConfig, SimulatedDevice, TriggerHandle};
use xicam::{AcquisitionController, Config, ControllerOptions, DeviceKind, Retrieval};

/// Interval between simulated trigger edges in manual mode
const SIMULATED_TRIGGER_PERIOD: Duration = Duration::from_secs(1);

fn build_device(config: &Config) -> Result<(Box<dyn DeviceAdapter>, Option<TriggerHandle>)> {
    let capture = &config.capture;
    match capture.device {
        DeviceKind::Simulated => {
            let device = SimulatedDevice::new(SimulatedConfig {
                width: capture.width,
                height: capture.height,
                fps: capture.fps,
                fail_every: capture.fail_every,
            });
            let trigger = device.trigger_handle();
            Ok((Box::new(device) as Box<dyn DeviceAdapter>, Some(trigger)))
        }
        #[cfg(feature = "v4l2")]
        DeviceKind::V4l2 => {
            use xicam::capture::v4l2;

            // Auto-detect capture device if needed
            let path = if capture.path.is_empty() {
                v4l2::auto_detect_device()?.path
            } else {
                capture.path.clone()
            };
            info!("Using capture device: {}", path);
            let device =
                v4l2::V4l2Device::new(path, capture.width, capture.height, capture.buffer_count);
            Ok((Box::new(device) as Box<dyn DeviceAdapter>, None))
        }
        #[cfg(not(feature = "v4l2"))]
        DeviceKind::V4l2 => Err(eyre!("built without the `v4l2` feature")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xicam=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("xicam launching...");

    // Load configuration
    let config_path = std::env::var_os("XICAM_CONFIG").map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    debug!("Configuration: {:?}", config);

    let (device, trigger) = build_device(&config)?;
    let controller =
        AcquisitionController::new(device, ControllerOptions::from(&config.pipeline))?;

    controller.configure(config.capture.manual)?;
    controller.start()?;

    // Stand in for the external trigger wiring of a real camera
    if let (true, Some(trigger)) = (config.capture.manual, trigger) {
        info!("Firing simulated trigger every {:?}", SIMULATED_TRIGGER_PERIOD);
        tokio::spawn(async move {
            let mut edges = tokio::time::interval(SIMULATED_TRIGGER_PERIOD);
            loop {
                edges.tick().await;
                trigger.fire();
            }
        });
    }

    let mut poll = tokio::time::interval(Duration::from_millis(config.pipeline.poll_interval_ms));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Acquiring. Press Ctrl-C to stop.");
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("Shutdown requested");
                break;
            }
            _ = poll.tick() => {
                // Drain everything that arrived since the last tick
                loop {
                    match controller.retrieve() {
                        Retrieval::Frame(frame) => {
                            let meta = &frame.meta;
                            info!(
                                "Frame {} ts {:.6} s, {}x{} {:?}, gain {:.1} dB, exp {:.1} us",
                                meta.frame_id,
                                meta.timestamp,
                                meta.width,
                                meta.height,
                                meta.format,
                                meta.gain,
                                meta.exposure
                            );
                        }
                        Retrieval::Duplicate => continue,
                        Retrieval::Empty => break,
                        Retrieval::NotAcquiring => {
                            return Err(eyre!("acquisition ended unexpectedly"));
                        }
                    }
                }
            }
        }
    }

    if let Err(e) = controller.stop() {
        warn!("Stop failed: {}", e);
    }

    let stats = controller.stats();
    info!(
        "Captured {}, delivered {}, dropped {}, duplicates {}, read failures {}",
        stats.capture.frames_captured,
        stats.frames_delivered,
        stats.buffer.dropped,
        stats.duplicates_suppressed,
        stats.capture.read_failures
    );

    info!("xicam shutting down");
    Ok(())
}
