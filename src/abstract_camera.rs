// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::Weak;

use canonical_error::CanonicalError;
use image::GrayImage;
use log::{debug, warn};

use crate::background_executor::ExecutorHandle;
use crate::capture_request::{CaptureRequest, RequestKey};
use crate::surface::{Surface, SurfaceId};

/// Identifies a physical camera, e.g. "0" for the back camera.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: &str) -> CameraId {
        CameraId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device state callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Opened,
    Disconnected,
    /// Carries the hardware's error code.
    Error(i32),
    Closed,
}

/// Capture session state callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Configured,
    ConfigureFailed,
    /// Session has no requests in flight.
    Ready,
    /// Session is processing the repeating request (steady state).
    Active,
    CaptureQueueEmpty,
    Closed,
}

/// Per-capture callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureEvent {
    Completed { frame_number: i64 },
    Failed { frame_number: i64, reason: i32 },
    BufferLost { frame_number: i64, target: SurfaceId },
    SequenceAborted { sequence_id: i32 },
}

pub enum HardwareEvent {
    Device(DeviceEvent),
    Session(SessionEvent),
    Capture(CaptureEvent),
    /// The CPU image reader has a new image; None if the reader had nothing
    /// to hand out by the time it was asked.
    ImageAvailable(Option<GrayImage>),
}

impl fmt::Debug for HardwareEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HardwareEvent::Device(e) => write!(f, "Device({:?})", e),
            HardwareEvent::Session(e) => write!(f, "Session({:?})", e),
            HardwareEvent::Capture(e) => write!(f, "Capture({:?})", e),
            HardwareEvent::ImageAvailable(img) => write!(
                f, "ImageAvailable({:?})", img.as_ref().map(|i| i.dimensions())),
        }
    }
}

/// Receives hardware events, always on the background worker.
pub trait HardwareEventHandler: Send + Sync {
    fn handle_hardware_event(&self, event: HardwareEvent);
}

/// Given to the hardware when a device is opened. Whatever thread the
/// hardware calls deliver() from, the event is handled on the background
/// worker, in delivery order.
#[derive(Clone)]
pub struct CallbackSink {
    // None for a sink that discards everything.
    route: Option<(ExecutorHandle, Weak<dyn HardwareEventHandler>)>,
}

impl CallbackSink {
    pub fn new(executor: ExecutorHandle,
               handler: Weak<dyn HardwareEventHandler>) -> CallbackSink {
        CallbackSink{route: Some((executor, handler))}
    }

    /// A sink connected to nothing. Events are logged and dropped.
    pub fn detached() -> CallbackSink {
        CallbackSink{route: None}
    }

    pub fn deliver(&self, event: HardwareEvent) {
        let (executor, handler) = match &self.route {
            Some((e, h)) => (e, h.clone()),
            None => {
                debug!("Detached sink dropping {:?}", event);
                return;
            }
        };
        let description = format!("{:?}", event);
        if executor.post(move || {
            if let Some(h) = handler.upgrade() {
                h.handle_hardware_event(event);
            }
        }).is_err() {
            // Late callback after shutdown; nobody is left to act on it.
            warn!("Dropping hardware event {} delivered after worker stopped",
                  description);
        }
    }

    pub fn device(&self, event: DeviceEvent) {
        self.deliver(HardwareEvent::Device(event));
    }

    pub fn session(&self, event: SessionEvent) {
        self.deliver(HardwareEvent::Session(event));
    }

    pub fn capture(&self, event: CaptureEvent) {
        self.deliver(HardwareEvent::Capture(event));
    }
}

/// CameraHardware models the platform camera subsystem: a device that is
/// opened and closed asynchronously, and a capture session bound to a set of
/// target surfaces. Every method only *issues* the request; outcomes arrive
/// later through the CallbackSink passed to open_device().
/// Methods are only ever called from the background worker.
pub trait CameraHardware: Send {
    /// Whether this process currently holds the capability to use the camera.
    fn has_camera_permission(&self, camera_id: &CameraId) -> bool;

    /// Request keys whose modification can stall the capture pipeline while
    /// the session reconfigures. None if the device cannot report them.
    fn session_keys(&self, camera_id: &CameraId)
                    -> Result<Option<Vec<RequestKey>>, CanonicalError>;

    /// Issues an asynchronous open. Expect Opened, Disconnected or Error.
    fn open_device(&mut self, camera_id: &CameraId, sink: CallbackSink)
                   -> Result<(), CanonicalError>;

    /// Issues an asynchronous close. Expect Closed. Closing an already closing
    /// device is harmless.
    fn close_device(&mut self, camera_id: &CameraId) -> Result<(), CanonicalError>;

    /// Issues an asynchronous session create over `surfaces`. Expect
    /// Configured or ConfigureFailed.
    fn create_session(&mut self, camera_id: &CameraId, surfaces: &[Surface])
                      -> Result<(), CanonicalError>;

    /// Installs (or replaces) the repeating request. Expect Active once frames
    /// flow, then a Capture event per frame.
    fn set_repeating_request(&mut self, request: &CaptureRequest)
                             -> Result<(), CanonicalError>;

    /// Issues an asynchronous session close. Expect session Closed.
    fn close_session(&mut self) -> Result<(), CanonicalError>;
}
