// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::time::Duration;

use chrono::offset::Local;
use clap::{Parser, ValueEnum};
use env_logger;
use log::{error, info, warn};

use shared_camera::abstract_camera::CameraId;
use shared_camera::capture_request::EffectMode;
use shared_camera::config::SharedCameraConfig;
use shared_camera::pipeline_arbiter::{FrameSourceMode, RenderOutcome};
use shared_camera::shared_camera::SharedCamera;
use shared_camera::sim_camera::{SimBehavior, SimCameraHardware};
use shared_camera::sim_tracker::{SimTexture, SimTracker};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Effect {
    Off,
    Mono,
    Negative,
    Sepia,
}

impl From<Effect> for EffectMode {
    fn from(e: Effect) -> EffectMode {
        match e {
            Effect::Off => EffectMode::Off,
            Effect::Mono => EffectMode::Mono,
            Effect::Negative => EffectMode::Negative,
            Effect::Sepia => EffectMode::Sepia,
        }
    }
}

/// Runs a shared camera against the simulated camera and tracking pipeline:
/// resume, stream frames to a render loop, switch effect and frame source
/// midway, then shut down.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    #[arg(long, default_value = "0")]
    camera: String,

    /// How long to stream before shutting down.
    #[arg(long, default_value_t = 3)]
    seconds: u64,

    /// Simulated capture rate.
    #[arg(long, default_value_t = 30)]
    fps: u64,

    /// Effect to switch to halfway through.
    #[arg(long, value_enum, default_value_t = Effect::Mono)]
    effect: Effect,

    /// Start with the raw stream instead of the tracking pipeline.
    #[arg(long, default_value_t = false)]
    raw: bool,

    /// Simulated delay before the camera confirms it is closed.
    #[arg(long, default_value_t = 20)]
    close_delay_ms: u64,
}

#[tokio::main]
async fn main() {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SharedCameraConfig{
        camera_id: CameraId::new(&args.camera),
        frame_source: if args.raw { FrameSourceMode::RawCapture }
                      else { FrameSourceMode::Tracking },
        ..Default::default()};
    let (width, height) = config.cpu_image_size;
    let behavior = SimBehavior{close_delay: Duration::from_millis(args.close_delay_ms),
                               ..Default::default()};
    let (hardware, controller) = SimCameraHardware::new(behavior);
    let tracker = Arc::new(SimTracker::new(2));
    let camera = Arc::new(SharedCamera::new(config, Box::new(hardware), tracker));
    let mut terminal = camera.terminal_signal();

    // Resume blocks on the safety barrier; keep it off the async threads.
    let cam = camera.clone();
    match tokio::task::spawn_blocking(move || cam.on_resume()).await {
        Ok(Ok(())) => info!("Camera resumed"),
        Ok(Err(e)) => {
            error!("Could not resume camera: {}", e);
            let cam = camera.clone();
            let _ = tokio::task::spawn_blocking(move || cam.on_shutdown()).await;
            return;
        },
        Err(e) => {
            error!("Resume task failed: {}", e);
            return;
        },
    }

    let frame_interval = Duration::from_millis(1000 / args.fps.max(1));
    let capture_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(frame_interval);
        loop {
            interval.tick().await;
            controller.emit_captures(1);
            controller.emit_image(width, height);
        }
    });

    let cam = camera.clone();
    let render_task = tokio::spawn(async move {
        let mut texture = SimTexture::new();
        let mut interval = tokio::time::interval(frame_interval / 2);
        let (mut tracked, mut raw) = (0, 0);
        loop {
            interval.tick().await;
            if !cam.is_frame_ready() {
                continue;
            }
            let rendered = match cam.render_tick(&mut texture) {
                Ok(RenderOutcome::Tracking(_)) => {
                    tracked += 1;
                    true
                },
                Ok(RenderOutcome::RawCapture{reattached}) => {
                    if reattached {
                        info!("Texture re-attached for raw stream");
                    }
                    raw += 1;
                    true
                },
                Ok(_) => false,
                Err(e) => {
                    warn!("Render tick: {}", e);
                    false
                },
            };
            if rendered && (tracked + raw) % 30 == 0 {
                info!("Rendered {} tracked and {} raw frames", tracked, raw);
            }
        }
    });

    let half = Duration::from_secs(args.seconds) / 2;
    tokio::select! {
        _ = tokio::time::sleep(half) => {
            let cam = camera.clone();
            let effect: EffectMode = args.effect.into();
            let next_mode = if args.raw { FrameSourceMode::Tracking }
                            else { FrameSourceMode::RawCapture };
            let result = tokio::task::spawn_blocking(move || {
                cam.reconfigure(effect)?;
                cam.set_frame_source(next_mode)
            }).await;
            match result {
                Ok(Ok(())) => info!("Switched to {:?} with effect {:?}", next_mode, effect),
                Ok(Err(e)) => warn!("Could not switch: {}", e),
                Err(e) => error!("Switch task failed: {}", e),
            }
            tokio::time::sleep(half).await;
        }
        _ = terminal.changed() => {
            if let Some(signal) = terminal.borrow().clone() {
                error!("Terminal signal: {}", signal);
            }
        }
    }

    capture_task.abort();
    render_task.abort();
    let cam = camera.clone();
    let outcome = match tokio::task::spawn_blocking(move || cam.on_shutdown()).await {
        Ok(o) => o,
        Err(e) => {
            error!("Shutdown task failed: {}", e);
            return;
        },
    };
    let stats = camera.capture_stats();
    info!("Shut down at {} ({:?}): {} captures, {} CPU images, {} tracking resumes",
          Local::now().format("%d/%m/%Y %T"), outcome, stats.completed,
          camera.images_processed(), camera.tracking_resumes());
}
