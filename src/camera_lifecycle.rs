// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Camera device state machine:
//!
//! ```text
//!   Closed -> Opening -> Opened -> { Disconnected | ErroredClosed | Closed }
//! ```
//!
//! Disconnected and ErroredClosed fall to Closed once the hardware reports
//! the handle released. Only a release that follows an explicit close()
//! opens the exit latch.

use std::sync::Arc;

use canonical_error::CanonicalError;
use log::{debug, error, info, warn};

use crate::abstract_camera::{CallbackSink, CameraHardware, CameraId, DeviceEvent};
use crate::errors::{TerminalSignal, already_open_error, camera_permission_error,
                    device_disconnected_error};
use crate::exit_latch::ExitLatch;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Opening,
    Opened,
    Disconnected,
    ErroredClosed,
}

#[derive(Clone, Debug)]
pub struct CameraDeviceHandle {
    camera_id: CameraId,
    state: DeviceState,
}

impl CameraDeviceHandle {
    pub fn new(camera_id: CameraId, state: DeviceState) -> CameraDeviceHandle {
        CameraDeviceHandle{camera_id, state}
    }

    pub fn camera_id(&self) -> &CameraId { &self.camera_id }
    pub fn state(&self) -> DeviceState { self.state }
}

/// What the owner must do after a device event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Nothing,
    /// Device reached Opened; build the capture session now.
    DeviceOpened,
    /// Device vanished; its session is gone too.
    DeviceLost,
    /// Unrecoverable; the owning context should shut down.
    Fatal(TerminalSignal),
    /// Hardware confirmed the handle released.
    Released,
}

#[derive(Default)]
pub struct CameraLifecycle {
    // None when Closed.
    device: Option<CameraDeviceHandle>,

    // Set by close(); opened when the matching Closed callback arrives.
    exit_latch: Option<Arc<ExitLatch>>,
}

impl CameraLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DeviceState {
        match &self.device {
            Some(d) => d.state,
            None => DeviceState::Closed,
        }
    }

    pub fn device(&self) -> Option<&CameraDeviceHandle> {
        self.device.as_ref()
    }

    pub fn close_requested(&self) -> bool {
        self.exit_latch.is_some()
    }

    /// Latch of the most recent close request, if one is outstanding.
    pub fn exit_latch(&self) -> Option<Arc<ExitLatch>> {
        self.exit_latch.clone()
    }

    fn set_state(&mut self, state: DeviceState) {
        if let Some(d) = self.device.as_mut() {
            debug!("Camera {} {:?} -> {:?}", d.camera_id, d.state, state);
            d.state = state;
        }
    }

    /// Fails unless a new open may be issued.
    pub fn check_closed(&self, camera_id: &CameraId) -> Result<(), CanonicalError> {
        match self.state() {
            DeviceState::Closed => Ok(()),
            // The old handle is still being released.
            DeviceState::Disconnected => Err(device_disconnected_error(camera_id)),
            _ => Err(already_open_error(camera_id)),
        }
    }

    /// Issues an asynchronous open of `camera_id`. Fails with AlreadyOpen
    /// unless Closed, and with PermissionDenied if the hardware refuses us.
    pub fn open(&mut self, hardware: &mut dyn CameraHardware,
                camera_id: &CameraId, sink: CallbackSink)
                -> Result<(), CanonicalError> {
        self.check_closed(camera_id)?;
        if !hardware.has_camera_permission(camera_id) {
            return Err(camera_permission_error(camera_id));
        }
        self.device = Some(CameraDeviceHandle::new(camera_id.clone(),
                                                   DeviceState::Opening));
        self.exit_latch = None;
        if let Err(e) = hardware.open_device(camera_id, sink) {
            error!("Failed to open camera {}: {}", camera_id, e);
            self.device = None;
            return Err(e);
        }
        info!("Opening camera {}", camera_id);
        Ok(())
    }

    /// Issues an asynchronous close. Returns the latch that opens once the
    /// hardware confirms release, or None if there is nothing to release.
    /// Repeated calls return the same latch.
    pub fn close(&mut self, hardware: &mut dyn CameraHardware)
                 -> Result<Option<Arc<ExitLatch>>, CanonicalError> {
        let (camera_id, state) = match &self.device {
            None => return Ok(None),
            Some(d) => (d.camera_id.clone(), d.state),
        };
        if let Some(latch) = &self.exit_latch {
            debug!("Close of camera {} already requested", camera_id);
            return Ok(Some(Arc::clone(latch)));
        }
        let latch = Arc::new(ExitLatch::new());
        match state {
            DeviceState::Opening | DeviceState::Opened => {
                hardware.close_device(&camera_id)?;
                info!("Closing camera {}", camera_id);
            },
            DeviceState::Disconnected | DeviceState::ErroredClosed => {
                // Release was already issued; wait for its confirmation.
                info!("Camera {} is {:?}; awaiting release", camera_id, state);
            },
            DeviceState::Closed => return Ok(None),
        }
        self.exit_latch = Some(Arc::clone(&latch));
        Ok(Some(latch))
    }

    pub fn on_device_event(&mut self, hardware: &mut dyn CameraHardware,
                           event: DeviceEvent) -> LifecycleOutcome {
        let camera_id = match &self.device {
            Some(d) => d.camera_id.clone(),
            None => {
                debug!("Ignoring {:?} for a closed camera", event);
                return LifecycleOutcome::Nothing;
            }
        };
        match event {
            DeviceEvent::Opened => {
                if self.state() != DeviceState::Opening {
                    warn!("Camera {} opened while {:?}", camera_id, self.state());
                    return LifecycleOutcome::Nothing;
                }
                if self.close_requested() {
                    // Close raced the open; the pending close wins.
                    debug!("Camera {} opened after close was requested", camera_id);
                    return LifecycleOutcome::Nothing;
                }
                info!("Camera device {} opened", camera_id);
                self.set_state(DeviceState::Opened);
                LifecycleOutcome::DeviceOpened
            },
            DeviceEvent::Disconnected => {
                warn!("Camera device {} disconnected", camera_id);
                self.set_state(DeviceState::Disconnected);
                if let Err(e) = hardware.close_device(&camera_id) {
                    warn!("Releasing disconnected camera {}: {}", camera_id, e);
                }
                LifecycleOutcome::DeviceLost
            },
            DeviceEvent::Error(code) => {
                error!("Camera device {} error {}", camera_id, code);
                self.set_state(DeviceState::ErroredClosed);
                if let Err(e) = hardware.close_device(&camera_id) {
                    warn!("Releasing errored camera {}: {}", camera_id, e);
                }
                LifecycleOutcome::Fatal(TerminalSignal::FatalDeviceError{
                    camera_id, error_code: code})
            },
            DeviceEvent::Closed => {
                info!("Camera device {} closed", camera_id);
                self.device = None;
                if let Some(latch) = &self.exit_latch {
                    latch.open();
                }
                LifecycleOutcome::Released
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_camera::{HardwareCall, SimBehavior, SimCameraHardware};
    use canonical_error::CanonicalErrorCode;

    fn manual_hardware() -> (SimCameraHardware, crate::sim_camera::SimController) {
        SimCameraHardware::new(SimBehavior::manual())
    }

    fn opened(lifecycle: &mut CameraLifecycle, hw: &mut SimCameraHardware) {
        lifecycle.open(hw, &CameraId::new("0"), CallbackSink::detached()).unwrap();
        assert_eq!(lifecycle.state(), DeviceState::Opening);
        assert_eq!(lifecycle.on_device_event(hw, DeviceEvent::Opened),
                   LifecycleOutcome::DeviceOpened);
        assert_eq!(lifecycle.state(), DeviceState::Opened);
    }

    #[test]
    fn open_twice_is_already_open() {
        let (mut hw, _) = manual_hardware();
        let mut lifecycle = CameraLifecycle::new();
        opened(&mut lifecycle, &mut hw);
        let err = lifecycle.open(&mut hw, &CameraId::new("0"),
                                 CallbackSink::detached()).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::AlreadyExists));
    }

    #[test]
    fn open_without_permission_fails() {
        let (mut hw, _) = SimCameraHardware::new(
            SimBehavior{permission_granted: false, ..SimBehavior::manual()});
        let mut lifecycle = CameraLifecycle::new();
        let err = lifecycle.open(&mut hw, &CameraId::new("0"),
                                 CallbackSink::detached()).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::PermissionDenied));
        assert_eq!(lifecycle.state(), DeviceState::Closed);
    }

    #[test]
    fn latch_opens_only_after_closed_callback() {
        let (mut hw, controller) = manual_hardware();
        let mut lifecycle = CameraLifecycle::new();
        opened(&mut lifecycle, &mut hw);

        let latch = lifecycle.close(&mut hw).unwrap().unwrap();
        assert!(!latch.is_open());
        assert_eq!(controller.count_calls(
            |c| matches!(c, HardwareCall::CloseDevice(_))), 1);
        // A second close returns the same latch without re-issuing.
        let again = lifecycle.close(&mut hw).unwrap().unwrap();
        assert!(Arc::ptr_eq(&latch, &again));
        assert_eq!(controller.count_calls(
            |c| matches!(c, HardwareCall::CloseDevice(_))), 1);

        assert_eq!(lifecycle.on_device_event(&mut hw, DeviceEvent::Closed),
                   LifecycleOutcome::Released);
        assert!(latch.is_open());
        assert_eq!(lifecycle.state(), DeviceState::Closed);
        // Closing a closed device is a no-op.
        assert!(lifecycle.close(&mut hw).unwrap().is_none());
    }

    #[test]
    fn disconnect_does_not_open_latch() {
        let (mut hw, controller) = manual_hardware();
        let mut lifecycle = CameraLifecycle::new();
        opened(&mut lifecycle, &mut hw);

        assert_eq!(lifecycle.on_device_event(&mut hw, DeviceEvent::Disconnected),
                   LifecycleOutcome::DeviceLost);
        assert_eq!(lifecycle.state(), DeviceState::Disconnected);
        assert!(lifecycle.exit_latch().is_none());
        // The handle was released without a close request.
        assert_eq!(controller.count_calls(
            |c| matches!(c, HardwareCall::CloseDevice(_))), 1);

        // No reopen until the old handle is gone.
        let err = lifecycle.open(&mut hw, &CameraId::new("0"), CallbackSink::detached())
            .unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::NotFound));
        assert_eq!(controller.count_calls(
            |c| matches!(c, HardwareCall::OpenDevice(_))), 1);

        assert_eq!(lifecycle.on_device_event(&mut hw, DeviceEvent::Closed),
                   LifecycleOutcome::Released);
        assert_eq!(lifecycle.state(), DeviceState::Closed);
        assert!(lifecycle.exit_latch().is_none());
    }

    #[test]
    fn close_after_disconnect_waits_for_release_without_reissuing() {
        let (mut hw, controller) = manual_hardware();
        let mut lifecycle = CameraLifecycle::new();
        opened(&mut lifecycle, &mut hw);
        lifecycle.on_device_event(&mut hw, DeviceEvent::Disconnected);

        let latch = lifecycle.close(&mut hw).unwrap().unwrap();
        assert_eq!(controller.count_calls(
            |c| matches!(c, HardwareCall::CloseDevice(_))), 1);
        lifecycle.on_device_event(&mut hw, DeviceEvent::Closed);
        assert!(latch.is_open());
    }

    #[test]
    fn error_is_fatal() {
        let (mut hw, _) = manual_hardware();
        let mut lifecycle = CameraLifecycle::new();
        opened(&mut lifecycle, &mut hw);
        let outcome = lifecycle.on_device_event(&mut hw, DeviceEvent::Error(4));
        assert_eq!(outcome, LifecycleOutcome::Fatal(TerminalSignal::FatalDeviceError{
            camera_id: CameraId::new("0"), error_code: 4}));
        assert_eq!(lifecycle.state(), DeviceState::ErroredClosed);
    }

    #[test]
    fn opened_after_close_request_is_ignored() {
        let (mut hw, _) = manual_hardware();
        let mut lifecycle = CameraLifecycle::new();
        lifecycle.open(&mut hw, &CameraId::new("0"), CallbackSink::detached()).unwrap();
        let latch = lifecycle.close(&mut hw).unwrap().unwrap();
        assert_eq!(lifecycle.on_device_event(&mut hw, DeviceEvent::Opened),
                   LifecycleOutcome::Nothing);
        assert_eq!(lifecycle.state(), DeviceState::Opening);
        lifecycle.on_device_event(&mut hw, DeviceEvent::Closed);
        assert!(latch.is_open());
    }
}
