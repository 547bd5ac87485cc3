// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! SharedCamera is the entry point the host application drives from its UI
//! thread (resume/pause/shutdown, mode and effect changes) and from its render
//! thread (frame polling). All device and session work is handed to a single
//! background worker; the UI thread only ever blocks on the safety barrier and
//! the exit latch, both with a bound.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::abstract_camera::{CallbackSink, CameraHardware, HardwareEventHandler};
use crate::abstract_tracker::{SharedTexture, TrackingProvider};
use crate::background_executor::BackgroundExecutor;
use crate::camera_core::{CameraCore, CoreCell};
use crate::camera_lifecycle::DeviceState;
use crate::capture_request::EffectMode;
use crate::capture_session::{CaptureSessionCoordinator, CaptureStats, SessionState};
use crate::config::SharedCameraConfig;
use crate::errors::{ShutdownOutcome, TerminalSignal};
use crate::pipeline_arbiter::{DualPipelineArbiter, FrameSourceMode, RenderOutcome};
use crate::safety_barrier::SessionSafetyBarrier;

pub struct SharedCamera {
    config: SharedCameraConfig,
    executor: BackgroundExecutor,
    core: Arc<CoreCell>,
    barrier: Arc<SessionSafetyBarrier>,
    arbiter: Arc<DualPipelineArbiter>,
    tracker: Arc<dyn TrackingProvider>,
    terminal: watch::Receiver<Option<TerminalSignal>>,

    // Set by on_shutdown(); the camera cannot be resumed afterwards.
    shut_down: AtomicBool,
}

impl SharedCamera {
    pub fn new(config: SharedCameraConfig,
               hardware: Box<dyn CameraHardware>,
               tracker: Arc<dyn TrackingProvider>) -> Self {
        let barrier = Arc::new(SessionSafetyBarrier::new());
        let session = CaptureSessionCoordinator::new(
            barrier.clone(), config.template, config.effect_mode);
        let arbiter = Arc::new(DualPipelineArbiter::new(
            config.texture_id, Arc::downgrade(session.status())));
        let (terminal_tx, terminal) = watch::channel(None);
        let core = CameraCore::new(config.clone(), hardware, session, barrier.clone(),
                                   tracker.clone(), arbiter.clone(), terminal_tx);
        let executor = BackgroundExecutor::new(
            format!("camera-{}", config.camera_id).as_str());
        SharedCamera{config,
                     executor,
                     core: Arc::new(CoreCell::new(core)),
                     barrier,
                     arbiter,
                     tracker,
                     terminal,
                     shut_down: AtomicBool::new(false)}
    }

    // Runs `f` against the core on the background worker, waiting for the
    // result.
    fn with_core<T, F>(&self, f: F) -> Result<T, CanonicalError>
    where T: Send + 'static,
          F: FnOnce(&mut CameraCore) -> T + Send + 'static
    {
        let core = self.core.clone();
        self.executor.run_sync(move || {
            let mut locked = core.lock();
            f(&mut *locked)
        })
    }

    /// Fails with the terminal error once a fatal device error was reported.
    pub fn check_terminal(&self) -> Result<(), CanonicalError> {
        match self.terminal.borrow().as_ref() {
            Some(signal) => Err(signal.to_error()),
            None => Ok(()),
        }
    }

    /// Subscribes to the terminal signal. The value becomes Some at most once.
    pub fn terminal_signal(&self) -> watch::Receiver<Option<TerminalSignal>> {
        self.terminal.clone()
    }

    /// Starts the worker and opens the camera. Returns once the open is
    /// issued; the session is configured when the device reports Opened.
    pub fn on_resume(&self) -> Result<(), CanonicalError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(failed_precondition_error("camera has been shut down"));
        }
        self.check_terminal()?;
        // A previous pause may have left a mutation in flight.
        self.barrier.wait_until_safe(self.config.safety_timeout)?;
        self.executor.start()?;
        let handler: Arc<dyn HardwareEventHandler> = self.core.clone();
        let sink = CallbackSink::new(self.executor.handle()?, Arc::downgrade(&handler));
        info!("Resuming camera {}", self.config.camera_id);
        self.with_core(move |core| core.open(sink))?
    }

    /// Stops tracking, closes the session then the device, and waits (with a
    /// bound) for the device to confirm release before stopping the worker.
    /// On TimedOut the worker keeps running to apply the late release.
    pub fn on_pause(&self) -> ShutdownOutcome {
        self.arbiter.clear_pending_frame();
        if !self.executor.is_running() {
            return match self.device_state() {
                DeviceState::Closed => ShutdownOutcome::Released,
                state => {
                    warn!("Camera {} left {:?} by an earlier pause", self.config.camera_id, state);
                    ShutdownOutcome::TimedOut
                },
            };
        }
        if let Err(e) = self.barrier.wait_until_safe(self.config.safety_timeout) {
            warn!("Pausing anyway: {}", e);
        }
        let outcome = match self.with_core(|core| core.begin_close()) {
            Ok(Ok(None)) => ShutdownOutcome::Released,
            Ok(Ok(Some(latch))) => {
                if latch.wait(self.config.exit_timeout) {
                    ShutdownOutcome::Released
                } else {
                    warn!("Camera {} did not confirm release within {:?}",
                          self.config.camera_id, self.config.exit_timeout);
                    ShutdownOutcome::TimedOut
                }
            },
            Ok(Err(e)) | Err(e) => {
                error!("Error closing camera {}: {}", self.config.camera_id, e);
                ShutdownOutcome::TimedOut
            },
        };
        if let Err(e) = self.with_core(|core| core.release_reader()) {
            warn!("Could not release image reader: {}", e);
        }
        match outcome {
            ShutdownOutcome::Released => self.executor.stop(),
            // The worker stays up so a late Closed still reaches the
            // lifecycle; the next on_pause() or on_resume() picks it up.
            ShutdownOutcome::TimedOut => {
                warn!("Keeping worker for camera {} until it reports Closed",
                      self.config.camera_id);
            },
        }
        info!("Paused camera {}: {:?}", self.config.camera_id, outcome);
        outcome
    }

    /// Pause path, after which on_resume() is refused.
    pub fn on_shutdown(&self) -> ShutdownOutcome {
        self.shut_down.store(true, Ordering::Release);
        self.on_pause()
    }

    /// Hands the texture to the raw stream or to the tracking pipeline. Like
    /// reconfigure(), waits up to `reconfigure_wait` for a pending mutation.
    pub fn set_frame_source(&self, mode: FrameSourceMode) -> Result<(), CanonicalError> {
        self.barrier.wait_until_safe(self.config.reconfigure_wait)?;
        self.with_core(move |core| core.set_frame_source(mode))?
    }

    /// Changes the effect on the repeating request. Waits up to
    /// `reconfigure_wait` for a pending mutation, then fails with SessionBusy.
    pub fn reconfigure(&self, effect: EffectMode) -> Result<(), CanonicalError> {
        self.barrier.wait_until_safe(self.config.reconfigure_wait)?;
        self.with_core(move |core| core.reconfigure(effect))?
    }

    pub fn retry_configure(&self) -> Result<(), CanonicalError> {
        self.with_core(|core| core.retry_configure())?
    }

    // Render thread API. None of these block.

    pub fn current_frame_source_mode(&self) -> FrameSourceMode {
        self.arbiter.select_source()
    }

    pub fn is_frame_ready(&self) -> bool {
        self.arbiter.is_frame_ready()
    }

    pub fn consume_frame(&self) -> bool {
        self.arbiter.consume_frame()
    }

    pub fn render_tick(&self, texture: &mut dyn SharedTexture)
                       -> Result<RenderOutcome, CanonicalError> {
        let result = self.arbiter.render_step(texture, self.tracker.as_ref());
        if let Err(e) = &result {
            debug!("Render tick failed: {}", e);
        }
        result
    }

    // Snapshots for the host and for tests.

    pub fn device_state(&self) -> DeviceState {
        self.core.lock().device_state()
    }

    pub fn session_state(&self) -> SessionState {
        self.core.lock().session_state()
    }

    pub fn is_safe_to_mutate(&self) -> bool {
        self.barrier.is_safe()
    }

    pub fn tracking_resumes(&self) -> u32 {
        self.arbiter.tracking_resumes()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.core.lock().capture_stats()
    }

    pub fn images_processed(&self) -> u64 {
        self.core.lock().images_processed()
    }
}

impl Drop for SharedCamera {
    fn drop(&mut self) {
        if self.executor.is_running() {
            warn!("SharedCamera dropped while running; pausing");
            self.on_pause();
        }
    }
}
