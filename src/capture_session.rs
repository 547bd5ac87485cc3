// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Capture session state machine:
//!
//! ```text
//!   Unconfigured -> Configuring -> { Active | ConfigureFailed } -> Closed
//! ```
//!
//! Every mutation of the session claims the SessionSafetyBarrier first; the
//! barrier is handed back when the session reports Active, fails to
//! configure, or closes.

use std::sync::{Arc, Mutex, PoisonError};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::{debug, error, info, warn};

use crate::abstract_camera::{CameraHardware, CameraId, CaptureEvent, SessionEvent};
use crate::camera_lifecycle::{CameraDeviceHandle, DeviceState};
use crate::capture_request::{CaptureRequestBuilder, EffectMode, RequestTemplate};
use crate::errors::{configure_failed_error, session_busy_error};
use crate::pipeline_arbiter::DualPipelineArbiter;
use crate::safety_barrier::SessionSafetyBarrier;
use crate::surface::PendingSurfaceSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Configuring,
    Active,
    Closed,
    ConfigureFailed,
}

/// Published session state. The coordinator is its only writer; the
/// pipeline arbiter holds a Weak reference and only reads it.
pub struct SessionStatus {
    state: Mutex<SessionState>,
}

impl SessionStatus {
    fn new() -> Self {
        SessionStatus{state: Mutex::new(SessionState::Unconfigured)}
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// A configured (or configuring) session over a device and its targets.
#[derive(Clone, Debug)]
pub struct CaptureSessionHandle {
    camera_id: CameraId,
    surfaces: PendingSurfaceSet,
    state: SessionState,
}

impl CaptureSessionHandle {
    pub fn camera_id(&self) -> &CameraId { &self.camera_id }
    pub fn surfaces(&self) -> &PendingSurfaceSet { &self.surfaces }
    pub fn state(&self) -> SessionState { self.state }
}

/// Single-capture telemetry. Failures here never change session state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub completed: u64,
    pub failed: u64,
    pub buffers_lost: u64,
    pub sequences_aborted: u64,
}

/// What the owner must do after a session event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Nothing,
    /// Session reached steady state; the tracking pipeline may resume.
    Activated,
    ConfigureFailed,
    Closed,
}

pub struct CaptureSessionCoordinator {
    barrier: Arc<SessionSafetyBarrier>,
    status: Arc<SessionStatus>,
    session: Option<CaptureSessionHandle>,

    template: RequestTemplate,
    effect_mode: EffectMode,
    request_builder: Option<CaptureRequestBuilder>,

    stats: CaptureStats,
}

impl CaptureSessionCoordinator {
    pub fn new(barrier: Arc<SessionSafetyBarrier>, template: RequestTemplate,
               effect_mode: EffectMode) -> Self {
        CaptureSessionCoordinator{barrier,
                                  status: Arc::new(SessionStatus::new()),
                                  session: None,
                                  template,
                                  effect_mode,
                                  request_builder: None,
                                  stats: CaptureStats::default()}
    }

    pub fn status(&self) -> &Arc<SessionStatus> {
        &self.status
    }

    pub fn state(&self) -> SessionState {
        match &self.session {
            Some(s) => s.state,
            None => SessionState::Unconfigured,
        }
    }

    pub fn session(&self) -> Option<&CaptureSessionHandle> {
        self.session.as_ref()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn effect_mode(&self) -> EffectMode {
        self.effect_mode
    }

    /// Nothing to close: never configured, closed, or configure failed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Unconfigured | SessionState::Closed |
                 SessionState::ConfigureFailed)
    }

    fn set_state(&mut self, state: SessionState) {
        if let Some(s) = self.session.as_mut() {
            debug!("Capture session {:?} -> {:?}", s.state, state);
            s.state = state;
        }
        self.status.set(state);
    }

    /// Issues an asynchronous session create on an Opened device. The
    /// barrier is held until the session goes Active (or fails).
    pub fn configure(&mut self, hardware: &mut dyn CameraHardware,
                     device: &CameraDeviceHandle, surfaces: PendingSurfaceSet)
                     -> Result<(), CanonicalError> {
        if device.state() != DeviceState::Opened {
            return Err(failed_precondition_error(
                format!("Cannot configure a session on camera {} while {:?}",
                        device.camera_id(), device.state()).as_str()));
        }
        if !self.is_closed() {
            return Err(failed_precondition_error(
                format!("Capture session already {:?}", self.state()).as_str()));
        }
        surfaces.validate()?;
        let delay_keys = hardware.session_keys(device.camera_id())?;
        let mut builder = CaptureRequestBuilder::new(self.template, delay_keys);
        builder.add_targets(&surfaces);
        builder.set_effect_mode(self.effect_mode);
        // Catches a builder with no targets before touching the hardware.
        builder.build()?;

        self.barrier.mark_unsafe("configure")?;
        if let Err(e) = hardware.create_session(device.camera_id(), surfaces.surfaces()) {
            error!("Failed to create capture session: {}", e);
            self.barrier.mark_safe();
            return Err(e);
        }
        info!("Configuring capture session on camera {} with {} surfaces",
              device.camera_id(), surfaces.len());
        self.session = Some(CaptureSessionHandle{camera_id: device.camera_id().clone(),
                                                 surfaces,
                                                 state: SessionState::Configuring});
        self.status.set(SessionState::Configuring);
        self.request_builder = Some(builder);
        Ok(())
    }

    /// Replaces the repeating request with one using `effect`. Fails fast
    /// with SessionBusy if another mutation is pending; never blocks.
    pub fn reconfigure(&mut self, hardware: &mut dyn CameraHardware,
                       effect: EffectMode) -> Result<(), CanonicalError> {
        if let Some(pending) = self.barrier.pending_mutation() {
            return Err(session_busy_error(
                format!("{} is pending", pending).as_str()));
        }
        match self.state() {
            SessionState::Active => (),
            SessionState::ConfigureFailed => {
                return Err(configure_failed_error(
                    "capture session failed to configure; retry configure first"));
            },
            state => {
                return Err(failed_precondition_error(
                    format!("Cannot reconfigure a session while {:?}", state).as_str()));
            },
        }
        let builder = match self.request_builder.as_mut() {
            Some(b) => b,
            None => return Err(failed_precondition_error("no request builder")),
        };
        builder.set_effect_mode(effect);
        let request = builder.build()?;

        self.barrier.mark_unsafe("reconfigure")?;
        if let Err(e) = hardware.set_repeating_request(&request) {
            error!("Failed to set repeating request: {}", e);
            self.barrier.mark_safe();
            return Err(e);
        }
        self.effect_mode = effect;
        info!("Reconfiguring capture session with effect {:?}", effect);
        Ok(())
    }

    /// Closes the session regardless of its state. Closing when there is
    /// nothing to close is a no-op. Late callbacks for the closed session are
    /// ignored.
    pub fn close(&mut self, hardware: &mut dyn CameraHardware) -> Result<(), CanonicalError> {
        match self.state() {
            SessionState::Unconfigured | SessionState::Closed => return Ok(()),
            SessionState::ConfigureFailed => {
                self.set_state(SessionState::Closed);
                return Ok(());
            },
            SessionState::Configuring | SessionState::Active => (),
        }
        if let Err(e) = hardware.close_session() {
            // The device close that follows tears the session down anyway.
            warn!("Closing capture session: {}", e);
        }
        info!("Capture session closed");
        self.set_state(SessionState::Closed);
        self.barrier.mark_safe();
        Ok(())
    }

    /// The device went away underneath the session.
    pub fn on_device_lost(&mut self) {
        if !self.is_closed() {
            warn!("Capture session lost with its device");
            self.set_state(SessionState::Closed);
        }
        self.barrier.mark_safe();
    }

    pub fn on_session_event(&mut self, hardware: &mut dyn CameraHardware,
                            event: SessionEvent) -> SessionOutcome {
        let state = self.state();
        if matches!(state, SessionState::Unconfigured | SessionState::Closed) {
            debug!("Ignoring {:?} for a {:?} session", event, state);
            return SessionOutcome::Nothing;
        }
        match event {
            SessionEvent::Configured => {
                if state != SessionState::Configuring {
                    warn!("Configured while {:?}", state);
                    return SessionOutcome::Nothing;
                }
                debug!("Camera capture session configured");
                self.install_repeating_request(hardware)
            },
            SessionEvent::ConfigureFailed => {
                error!("Failed to configure camera capture session");
                self.set_state(SessionState::ConfigureFailed);
                self.barrier.mark_safe();
                SessionOutcome::ConfigureFailed
            },
            SessionEvent::Ready => {
                debug!("Camera capture session ready");
                SessionOutcome::Nothing
            },
            SessionEvent::Active => {
                if !matches!(state, SessionState::Configuring | SessionState::Active) {
                    warn!("Active while {:?}", state);
                    return SessionOutcome::Nothing;
                }
                if let Some(s) = &self.session {
                    if !s.surfaces.all_valid() {
                        error!("Capture session active with a released surface");
                    }
                }
                debug!("Camera capture session active");
                self.set_state(SessionState::Active);
                self.barrier.mark_safe();
                SessionOutcome::Activated
            },
            SessionEvent::CaptureQueueEmpty => {
                warn!("Camera capture queue empty");
                SessionOutcome::Nothing
            },
            SessionEvent::Closed => {
                info!("Camera capture session closed by hardware");
                self.set_state(SessionState::Closed);
                self.barrier.mark_safe();
                SessionOutcome::Closed
            },
        }
    }

    // Without a repeating request the session never goes Active; treat that
    // as a failed configure so the barrier is handed back.
    fn install_repeating_request(&mut self, hardware: &mut dyn CameraHardware)
                                 -> SessionOutcome {
        let result = match self.request_builder.as_ref() {
            Some(builder) => builder.build()
                .and_then(|request| hardware.set_repeating_request(&request)),
            None => Err(failed_precondition_error("configured session has no request builder")),
        };
        match result {
            Ok(()) => SessionOutcome::Nothing,
            Err(e) => {
                error!("Failed to install repeating request: {}", e);
                self.set_state(SessionState::ConfigureFailed);
                self.barrier.mark_safe();
                SessionOutcome::ConfigureFailed
            },
        }
    }

    /// Capture failures are telemetry only.
    pub fn on_capture_event(&mut self, event: CaptureEvent, arbiter: &DualPipelineArbiter) {
        match event {
            CaptureEvent::Completed{..} => {
                self.stats.completed += 1;
                arbiter.on_frame_ready();
            },
            CaptureEvent::Failed{frame_number, reason} => {
                self.stats.failed += 1;
                error!("Capture failed: frame {} reason {}", frame_number, reason);
            },
            CaptureEvent::BufferLost{frame_number, target} => {
                self.stats.buffers_lost += 1;
                error!("Capture buffer lost: frame {} target {}", frame_number, target);
            },
            CaptureEvent::SequenceAborted{sequence_id} => {
                self.stats.sequences_aborted += 1;
                error!("Capture sequence {} aborted", sequence_id);
            },
        }
    }
}
