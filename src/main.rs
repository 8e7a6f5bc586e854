//! Argus headless preview against the simulated camera

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use argus::device::sim::SimDevice;
use argus::{Camera, Config};
use color_eyre::Result;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "argus=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    argus::CONFIG.store(Arc::new(config.clone()));

    let device = SimDevice::from_config(&config.simulation);
    let mut camera = Camera::new(device, config.clone());
    camera.open()?;
    info!(
        device = camera.device_name().unwrap_or("unknown"),
        output = ?camera.output_format(),
        "Camera ready"
    );
    camera.start_acquisition()?;

    let camera = Arc::new(parking_lot::Mutex::new(camera));
    let shutdown = Arc::new(AtomicBool::new(false));

    // Pull frames on a blocking thread; the slot wait is synchronous
    let preview = {
        let camera = Arc::clone(&camera);
        let shutdown = Arc::clone(&shutdown);
        let settings = config.clone();
        tokio::task::spawn_blocking(move || preview_loop(&camera, &shutdown, &settings))
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, shutting down");
            shutdown.store(true, Ordering::Relaxed);
        }
        _ = wait_for(&shutdown) => {}
    }

    let pulled = preview.await??;
    info!(frames = pulled, "Preview finished");

    let mut camera = camera.lock();
    if let Err(e) = camera.stop_acquisition() {
        warn!("Failed to stop acquisition: {}", e);
    }
    let stats = camera.frame_stats();
    info!(
        published = stats.published,
        consumed = stats.consumed,
        overwritten = stats.overwritten,
        "Frame statistics"
    );

    camera.close()?;
    info!("Argus shutting down");
    Ok(())
}

async fn wait_for(flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn preview_loop(
    camera: &parking_lot::Mutex<Camera<SimDevice>>,
    shutdown: &AtomicBool,
    config: &Config,
) -> Result<u64> {
    let wait = Duration::from_millis(config.pipeline.frame_wait_ms);
    let log_every = config.preview.log_every.max(1);
    let started = Instant::now();
    let mut pulled = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        let frame = match camera.lock().get_image_timeout(wait) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) if e.is_terminal() => {
                error!("Acquisition stopped: {}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        pulled += 1;

        if pulled % log_every == 0 {
            let fps = pulled as f64 / started.elapsed().as_secs_f64();
            info!(
                sequence = frame.meta.sequence,
                width = frame.meta.width,
                height = frame.meta.height,
                format = %frame.meta.format,
                bytes = frame.data.len(),
                fps = %format!("{fps:.1}"),
                "Frame"
            );
        }

        if config.preview.max_frames.is_some_and(|max| pulled >= max) {
            info!(frames = pulled, "Frame limit reached");
            break;
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    Ok(pulled)
}
