// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Simulated CameraHardware. In automatic mode it answers every request with
//! the callbacks a well behaved device would send, each after a delay and
//! from its own thread. In manual mode it only records calls, and tests drive
//! callbacks through the SimController.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error, unavailable_error};
use image::GrayImage;
use log::{debug, warn};

use crate::abstract_camera::{CallbackSink, CameraHardware, CameraId, CaptureEvent,
                             DeviceEvent, HardwareEvent, SessionEvent};
use crate::capture_request::{CaptureRequest, RequestKey};
use crate::surface::{Surface, SurfaceId};

#[derive(Clone, Debug)]
pub struct SimBehavior {
    /// Delay before the answer to open/create/set_repeating arrives.
    pub callback_delay: Duration,
    /// Delay between close_device and the Closed callback.
    pub close_delay: Duration,
    pub permission_granted: bool,
    /// If false, nothing is sent unless the SimController emits it.
    pub auto_callbacks: bool,
    /// Answer create_session with ConfigureFailed.
    pub fail_configure: bool,
    /// Follow set_repeating_request with session Active.
    pub report_active: bool,
    /// Refuse set_repeating_request. The call is still recorded.
    pub fail_repeating_request: bool,
    /// Follow close_device with device Closed. Turn off to simulate a device
    /// that never confirms release.
    pub report_device_closed: bool,
    pub session_keys: Option<Vec<RequestKey>>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        SimBehavior{callback_delay: Duration::from_millis(2),
                    close_delay: Duration::from_millis(2),
                    permission_granted: true,
                    auto_callbacks: true,
                    fail_configure: false,
                    report_active: true,
                    fail_repeating_request: false,
                    report_device_closed: true,
                    session_keys: Some(vec![])}
    }
}

impl SimBehavior {
    pub fn manual() -> Self {
        SimBehavior{auto_callbacks: false, ..Default::default()}
    }
}

/// One recorded call into the simulated hardware.
#[derive(Clone, Debug, PartialEq)]
pub enum HardwareCall {
    OpenDevice(CameraId),
    CloseDevice(CameraId),
    CreateSession(Vec<SurfaceId>),
    SetRepeatingRequest(CaptureRequest),
    CloseSession,
}

struct SimShared {
    behavior: SimBehavior,
    sink: Option<CallbackSink>,
    calls: Vec<HardwareCall>,
    next_frame_number: i64,
}

fn lock(shared: &Mutex<SimShared>) -> MutexGuard<'_, SimShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimCameraHardware {
    shared: Arc<Mutex<SimShared>>,
}

impl SimCameraHardware {
    pub fn new(behavior: SimBehavior) -> (SimCameraHardware, SimController) {
        let shared = Arc::new(Mutex::new(SimShared{behavior,
                                                   sink: None,
                                                   calls: Vec::new(),
                                                   next_frame_number: 0}));
        (SimCameraHardware{shared: shared.clone()}, SimController{shared})
    }

    fn record(&self, call: HardwareCall) -> SimBehavior {
        let mut locked = lock(&self.shared);
        debug!("Sim camera call {:?}", call);
        locked.calls.push(call);
        locked.behavior.clone()
    }

    // Sends `event` after `delay` from a fresh thread, as a real camera stack
    // would call back from its own looper.
    fn schedule(&self, delay: Duration, event: HardwareEvent) {
        let sink = match &lock(&self.shared).sink {
            Some(s) => s.clone(),
            None => {
                warn!("No sink for {:?}", event);
                return;
            }
        };
        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            sink.deliver(event);
        });
    }
}

impl CameraHardware for SimCameraHardware {
    fn has_camera_permission(&self, _camera_id: &CameraId) -> bool {
        lock(&self.shared).behavior.permission_granted
    }

    fn session_keys(&self, _camera_id: &CameraId)
                    -> Result<Option<Vec<RequestKey>>, CanonicalError> {
        Ok(lock(&self.shared).behavior.session_keys.clone())
    }

    fn open_device(&mut self, camera_id: &CameraId, sink: CallbackSink)
                   -> Result<(), CanonicalError> {
        lock(&self.shared).sink = Some(sink);
        let behavior = self.record(HardwareCall::OpenDevice(camera_id.clone()));
        if behavior.auto_callbacks {
            self.schedule(behavior.callback_delay,
                          HardwareEvent::Device(DeviceEvent::Opened));
        }
        Ok(())
    }

    fn close_device(&mut self, camera_id: &CameraId) -> Result<(), CanonicalError> {
        let behavior = self.record(HardwareCall::CloseDevice(camera_id.clone()));
        if behavior.auto_callbacks && behavior.report_device_closed {
            self.schedule(behavior.close_delay,
                          HardwareEvent::Device(DeviceEvent::Closed));
        }
        Ok(())
    }

    fn create_session(&mut self, _camera_id: &CameraId, surfaces: &[Surface])
                      -> Result<(), CanonicalError> {
        if let Some(released) = surfaces.iter().find(|s| s.is_released()) {
            return Err(failed_precondition_error(
                format!("{} already released", released.id()).as_str()));
        }
        let ids = surfaces.iter().map(Surface::id).collect();
        let behavior = self.record(HardwareCall::CreateSession(ids));
        if behavior.auto_callbacks {
            let event = if behavior.fail_configure {
                SessionEvent::ConfigureFailed
            } else {
                SessionEvent::Configured
            };
            self.schedule(behavior.callback_delay, HardwareEvent::Session(event));
        }
        Ok(())
    }

    fn set_repeating_request(&mut self, request: &CaptureRequest)
                             -> Result<(), CanonicalError> {
        let behavior = self.record(HardwareCall::SetRepeatingRequest(request.clone()));
        if behavior.fail_repeating_request {
            return Err(unavailable_error("simulated repeating request failure"));
        }
        if behavior.auto_callbacks && behavior.report_active {
            self.schedule(behavior.callback_delay,
                          HardwareEvent::Session(SessionEvent::Active));
        }
        Ok(())
    }

    fn close_session(&mut self) -> Result<(), CanonicalError> {
        self.record(HardwareCall::CloseSession);
        Ok(())
    }
}

/// Test-side view of a SimCameraHardware.
#[derive(Clone)]
pub struct SimController {
    shared: Arc<Mutex<SimShared>>,
}

impl SimController {
    pub fn calls(&self) -> Vec<HardwareCall> {
        lock(&self.shared).calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&HardwareCall) -> bool) -> usize {
        lock(&self.shared).calls.iter().filter(|c| pred(c)).count()
    }

    pub fn repeating_requests(&self) -> Vec<CaptureRequest> {
        lock(&self.shared).calls.iter().filter_map(|c| match c {
            HardwareCall::SetRepeatingRequest(r) => Some(r.clone()),
            _ => None,
        }).collect()
    }

    pub fn set_behavior(&self, update: impl FnOnce(&mut SimBehavior)) {
        update(&mut lock(&self.shared).behavior);
    }

    /// Sends `event` now, from the calling thread. Dropped with a warning if
    /// no device was ever opened.
    pub fn emit(&self, event: HardwareEvent) {
        let sink = lock(&self.shared).sink.clone();
        match sink {
            Some(s) => s.deliver(event),
            None => warn!("Sim camera not opened; dropping {:?}", event),
        }
    }

    pub fn emit_device(&self, event: DeviceEvent) {
        self.emit(HardwareEvent::Device(event));
    }

    pub fn emit_session(&self, event: SessionEvent) {
        self.emit(HardwareEvent::Session(event));
    }

    pub fn emit_capture(&self, event: CaptureEvent) {
        self.emit(HardwareEvent::Capture(event));
    }

    /// Sends `n` capture completions with consecutive frame numbers.
    pub fn emit_captures(&self, n: usize) {
        for _ in 0..n {
            let frame_number = {
                let mut locked = lock(&self.shared);
                locked.next_frame_number += 1;
                locked.next_frame_number
            };
            self.emit_capture(CaptureEvent::Completed{frame_number});
        }
    }

    pub fn emit_image(&self, width: u32, height: u32) {
        self.emit(HardwareEvent::ImageAvailable(Some(GrayImage::new(width, height))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Weak;
    use crate::abstract_camera::HardwareEventHandler;
    use crate::background_executor::BackgroundExecutor;

    struct Recorder {
        events: Mutex<mpsc::Sender<String>>,
    }

    impl HardwareEventHandler for Recorder {
        fn handle_hardware_event(&self, event: HardwareEvent) {
            let _ = self.events.lock().unwrap().send(format!("{:?}", event));
        }
    }

    #[test]
    fn auto_mode_answers_open_and_close() {
        let executor = BackgroundExecutor::new("sim-test");
        executor.start().unwrap();
        let (tx, rx) = mpsc::channel();
        let recorder: Arc<dyn HardwareEventHandler> =
            Arc::new(Recorder{events: Mutex::new(tx)});
        let handler: Weak<dyn HardwareEventHandler> = Arc::downgrade(&recorder);
        let sink = CallbackSink::new(executor.handle().unwrap(), handler);

        let (mut hw, controller) = SimCameraHardware::new(SimBehavior::default());
        let id = CameraId::new("0");
        hw.open_device(&id, sink).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                   "Device(Opened)");
        hw.close_device(&id).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                   "Device(Closed)");
        assert_eq!(controller.calls(),
                   vec![HardwareCall::OpenDevice(id.clone()),
                        HardwareCall::CloseDevice(id)]);
        executor.stop();
    }

    #[test]
    fn manual_mode_only_records() {
        let (mut hw, controller) = SimCameraHardware::new(SimBehavior::manual());
        hw.open_device(&CameraId::new("1"), CallbackSink::detached()).unwrap();
        hw.close_session().unwrap();
        assert_eq!(controller.count_calls(|c| matches!(c, HardwareCall::CloseSession)), 1);
        // Goes to the detached sink and is dropped.
        controller.emit_captures(3);
    }

    #[test]
    fn refuses_released_surfaces() {
        let (mut hw, controller) = SimCameraHardware::new(SimBehavior::manual());
        let surface = Surface::new(crate::surface::SurfaceKind::Tracking);
        surface.release();
        assert!(hw.create_session(&CameraId::new("0"), &[surface]).is_err());
        assert!(controller.calls().is_empty());
    }
}
