// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Worker-side owner of the camera hardware and both state machines. Every
//! method here runs on the background worker, either as a routed hardware
//! callback or as a job posted by the UI-facing SharedCamera.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::{debug, error, info, trace, warn};
use tokio::sync::watch;

use crate::abstract_camera::{CallbackSink, CameraHardware, HardwareEvent,
                             HardwareEventHandler};
use crate::abstract_tracker::TrackingProvider;
use crate::camera_lifecycle::{CameraLifecycle, DeviceState, LifecycleOutcome};
use crate::capture_request::EffectMode;
use crate::capture_session::{CaptureSessionCoordinator, CaptureStats, SessionOutcome,
                             SessionState};
use crate::config::SharedCameraConfig;
use crate::errors::{TerminalSignal, configure_failed_error, device_disconnected_error,
                    session_busy_error};
use crate::exit_latch::ExitLatch;
use crate::image_reader::CpuImageReader;
use crate::pipeline_arbiter::{DualPipelineArbiter, FrameSourceMode};
use crate::safety_barrier::SessionSafetyBarrier;
use crate::surface::PendingSurfaceSet;

pub struct CameraCore {
    config: SharedCameraConfig,
    hardware: Box<dyn CameraHardware>,
    lifecycle: CameraLifecycle,
    session: CaptureSessionCoordinator,
    barrier: Arc<SessionSafetyBarrier>,
    image_reader: Option<CpuImageReader>,
    // Images counted by readers already released.
    retired_images: u64,
    tracker: Arc<dyn TrackingProvider>,
    arbiter: Arc<DualPipelineArbiter>,

    // Mode the UI asked for; the arbiter reflects what is actually running.
    requested_mode: FrameSourceMode,

    terminal: watch::Sender<Option<TerminalSignal>>,
}

impl CameraCore {
    pub fn new(config: SharedCameraConfig,
               hardware: Box<dyn CameraHardware>,
               session: CaptureSessionCoordinator,
               barrier: Arc<SessionSafetyBarrier>,
               tracker: Arc<dyn TrackingProvider>,
               arbiter: Arc<DualPipelineArbiter>,
               terminal: watch::Sender<Option<TerminalSignal>>) -> Self {
        let requested_mode = config.frame_source;
        CameraCore{config, hardware, lifecycle: CameraLifecycle::new(), session,
                   barrier, image_reader: None, retired_images: 0, tracker, arbiter, requested_mode,
                   terminal}
    }

    pub fn device_state(&self) -> DeviceState {
        self.lifecycle.state()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.session.stats()
    }

    pub fn images_processed(&self) -> u64 {
        self.retired_images +
            self.image_reader.as_ref().map_or(0, CpuImageReader::images_processed)
    }

    pub fn requested_mode(&self) -> FrameSourceMode {
        self.requested_mode
    }

    /// Sets up the CPU reader, registers it with the tracking pipeline and
    /// issues the device open. The session follows once the device reports
    /// Opened.
    pub fn open(&mut self, sink: CallbackSink) -> Result<(), CanonicalError> {
        if let Some(signal) = self.terminal.borrow().clone() {
            return Err(signal.to_error());
        }
        let camera_id = self.config.camera_id.clone();
        self.lifecycle.check_closed(&camera_id)?;
        let (width, height) = self.config.cpu_image_size;
        let reader = CpuImageReader::new(width, height);
        self.tracker.set_app_surfaces(&camera_id, &[reader.surface().clone()]);
        match self.lifecycle.open(self.hardware.as_mut(), &camera_id, sink) {
            Ok(()) => {
                self.release_reader();
                self.image_reader = Some(reader);
                Ok(())
            },
            Err(e) => {
                let mut reader = reader;
                reader.close();
                Err(e)
            },
        }
    }

    fn configure_session(&mut self) -> Result<(), CanonicalError> {
        let device = match self.lifecycle.device() {
            Some(d) => d.clone(),
            None => return Err(failed_precondition_error("no camera device")),
        };
        let reader_surface = match &self.image_reader {
            Some(r) => r.surface().clone(),
            None => return Err(failed_precondition_error("no CPU image reader")),
        };
        let surfaces = PendingSurfaceSet::from_parts(self.tracker.tracking_surfaces(),
                                                     reader_surface);
        self.tracker.notify_texture_target(self.arbiter.texture_id());
        self.session.configure(self.hardware.as_mut(), &device, surfaces)
    }

    // Session mutations on a lost device or an unconfigured session fail with
    // the error that tells the caller what to do next.
    fn check_mutable(&self) -> Result<(), CanonicalError> {
        if self.lifecycle.state() == DeviceState::Disconnected {
            return Err(device_disconnected_error(&self.config.camera_id));
        }
        if self.session.state() == SessionState::ConfigureFailed {
            return Err(configure_failed_error("call retry_configure() first"));
        }
        Ok(())
    }

    /// Re-runs configure after a ConfigureFailed.
    pub fn retry_configure(&mut self) -> Result<(), CanonicalError> {
        if self.lifecycle.state() == DeviceState::Disconnected {
            return Err(device_disconnected_error(&self.config.camera_id));
        }
        if self.lifecycle.state() != DeviceState::Opened ||
            self.session.state() != SessionState::ConfigureFailed
        {
            return Err(failed_precondition_error(
                format!("Nothing to retry: device {:?}, session {:?}",
                        self.lifecycle.state(), self.session.state()).as_str()));
        }
        self.configure_session()
    }

    pub fn reconfigure(&mut self, effect: EffectMode) -> Result<(), CanonicalError> {
        self.check_mutable()?;
        self.session.reconfigure(self.hardware.as_mut(), effect)
    }

    /// Hands the texture to `mode`. Switching to raw capture re-installs the
    /// repeating request, which is a session mutation: fails fast with
    /// SessionBusy while another one is pending.
    pub fn set_frame_source(&mut self, mode: FrameSourceMode) -> Result<(), CanonicalError> {
        if mode == self.requested_mode {
            return Ok(());
        }
        if let Some(pending) = self.barrier.pending_mutation() {
            return Err(session_busy_error(
                format!("cannot switch to {:?} while {} is pending", mode, pending).as_str()));
        }
        self.check_mutable()?;
        info!("Switching frame source to {:?}", mode);
        self.requested_mode = mode;
        let active = self.session.state() == SessionState::Active;
        match mode {
            FrameSourceMode::Tracking => {
                if active {
                    self.resume_tracking();
                }
                Ok(())
            },
            FrameSourceMode::RawCapture => {
                self.pause_tracking();
                if active {
                    let effect = self.session.effect_mode();
                    self.session.reconfigure(self.hardware.as_mut(), effect)?;
                }
                Ok(())
            },
        }
    }

    fn resume_tracking(&mut self) {
        if self.requested_mode != FrameSourceMode::Tracking || self.arbiter.tracking_active() {
            return;
        }
        match self.tracker.session_resume() {
            Ok(()) => self.arbiter.set_tracking_active(true),
            Err(e) => error!("Failed to resume tracking session: {}", e),
        }
    }

    fn pause_tracking(&mut self) {
        if !self.arbiter.tracking_active() {
            return;
        }
        if let Err(e) = self.tracker.session_pause() {
            warn!("Pausing tracking session: {}", e);
        }
        self.arbiter.set_tracking_active(false);
    }

    /// First half of the pause path: stop tracking, close the session, then
    /// issue the device close. Returns the latch to wait on, if any.
    pub fn begin_close(&mut self) -> Result<Option<Arc<ExitLatch>>, CanonicalError> {
        self.arbiter.clear_pending_frame();
        self.pause_tracking();
        self.session.close(self.hardware.as_mut())?;
        self.close_device()
    }

    fn close_device(&mut self) -> Result<Option<Arc<ExitLatch>>, CanonicalError> {
        let ordered = self.session.is_closed();
        debug_assert!(ordered, "camera device closed before its capture session");
        if !ordered {
            error!("Closing camera device while capture session is {:?}",
                   self.session.state());
        }
        self.lifecycle.close(self.hardware.as_mut())
    }

    /// Last half of the pause path, once the device is released (or we gave
    /// up waiting).
    pub fn release_reader(&mut self) {
        if let Some(mut reader) = self.image_reader.take() {
            debug!("Releasing CPU image reader after {} images",
                   reader.images_processed());
            self.retired_images += reader.images_processed();
            reader.close();
        }
    }

    pub fn handle_event(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::Device(e) => {
                let outcome = self.lifecycle.on_device_event(self.hardware.as_mut(), e);
                self.on_lifecycle_outcome(outcome);
            },
            HardwareEvent::Session(e) => {
                match self.session.on_session_event(self.hardware.as_mut(), e) {
                    SessionOutcome::Activated => self.resume_tracking(),
                    SessionOutcome::Closed => self.pause_tracking(),
                    SessionOutcome::ConfigureFailed | SessionOutcome::Nothing => (),
                }
            },
            HardwareEvent::Capture(e) => {
                self.session.on_capture_event(e, &self.arbiter);
            },
            HardwareEvent::ImageAvailable(image) => {
                match self.image_reader.as_mut() {
                    Some(reader) => reader.on_image_available(image),
                    None => trace!("Image with no reader"),
                }
            },
        }
    }

    fn on_lifecycle_outcome(&mut self, outcome: LifecycleOutcome) {
        match outcome {
            LifecycleOutcome::DeviceOpened => {
                if let Err(e) = self.configure_session() {
                    error!("Failed to configure capture session: {}", e);
                }
            },
            LifecycleOutcome::DeviceLost => {
                self.pause_tracking();
                self.session.on_device_lost();
                self.arbiter.clear_pending_frame();
            },
            LifecycleOutcome::Fatal(signal) => {
                self.pause_tracking();
                self.session.on_device_lost();
                self.arbiter.clear_pending_frame();
                error!("Terminal condition: {}", signal);
                self.terminal.send_replace(Some(signal));
            },
            LifecycleOutcome::Released | LifecycleOutcome::Nothing => (),
        }
    }
}

/// Lets hardware callbacks reach the core through a Weak reference.
pub struct CoreCell {
    core: Mutex<CameraCore>,
}

impl CoreCell {
    pub fn new(core: CameraCore) -> Self {
        CoreCell{core: Mutex::new(core)}
    }

    pub fn lock(&self) -> MutexGuard<'_, CameraCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HardwareEventHandler for CoreCell {
    fn handle_hardware_event(&self, event: HardwareEvent) {
        self.lock().handle_event(event);
    }
}
