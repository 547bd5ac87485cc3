// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Error taxonomy for camera/session coordination. Every failure is a
//! CanonicalError; the functions here pin each kind of failure to one
//! canonical code so callers can tell them apart by `code`.

use std::fmt;

use canonical_error::{CanonicalError, aborted_error, already_exists_error,
                      deadline_exceeded_error, internal_error,
                      invalid_argument_error, not_found_error,
                      permission_denied_error, unavailable_error};

use crate::abstract_camera::CameraId;

/// open() on a device that is not Closed.
pub fn already_open_error(camera_id: &CameraId) -> CanonicalError {
    already_exists_error(
        format!("Camera {} is already open", camera_id).as_str())
}

/// Caller lacks the camera capability. Recoverable after an external
/// re-grant and an explicit retry.
pub fn camera_permission_error(camera_id: &CameraId) -> CanonicalError {
    permission_denied_error(
        format!("No permission to open camera {}", camera_id).as_str())
}

pub fn invalid_surface_set_error(msg: &str) -> CanonicalError {
    invalid_argument_error(format!("Invalid surface set: {}", msg).as_str())
}

/// The device handle is gone; a fresh open is needed.
pub fn device_disconnected_error(camera_id: &CameraId) -> CanonicalError {
    not_found_error(
        format!("Camera {} was disconnected", camera_id).as_str())
}

pub fn configure_failed_error(msg: &str) -> CanonicalError {
    aborted_error(format!("Capture session configure failed: {}", msg).as_str())
}

/// Transient; retry after a short backoff or after the next Active signal.
pub fn session_busy_error(msg: &str) -> CanonicalError {
    unavailable_error(format!("Capture session busy: {}", msg).as_str())
}

pub fn fatal_device_error(camera_id: &CameraId, error_code: i32) -> CanonicalError {
    internal_error(
        format!("Camera {} reported fatal error {}", camera_id, error_code).as_str())
}

pub fn exit_timeout_error(msg: &str) -> CanonicalError {
    deadline_exceeded_error(format!("Exit timeout: {}", msg).as_str())
}

/// Conditions that end the owning context. Published once; never retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalSignal {
    FatalDeviceError { camera_id: CameraId, error_code: i32 },
}

impl TerminalSignal {
    pub fn to_error(&self) -> CanonicalError {
        match self {
            TerminalSignal::FatalDeviceError{camera_id, error_code} =>
                fatal_device_error(camera_id, *error_code),
        }
    }
}

impl fmt::Display for TerminalSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TerminalSignal::FatalDeviceError{camera_id, error_code} =>
                write!(f, "fatal error {} on camera {}", error_code, camera_id),
        }
    }
}

/// Result of the pause/shutdown path. A timeout is reported, not thrown.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The device confirmed release (or was never held).
    Released,
    /// The exit latch did not open within its bound. The hardware may still
    /// hold the device.
    TimedOut,
}

impl ShutdownOutcome {
    pub fn into_result(self) -> Result<(), CanonicalError> {
        match self {
            ShutdownOutcome::Released => Ok(()),
            ShutdownOutcome::TimedOut => Err(exit_timeout_error(
                "camera did not confirm release before the deadline")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::CanonicalErrorCode;

    #[test]
    fn taxonomy_codes_are_distinct() {
        let id = CameraId::new("0");
        assert!(matches!(already_open_error(&id).code,
                         CanonicalErrorCode::AlreadyExists));
        assert!(matches!(camera_permission_error(&id).code,
                         CanonicalErrorCode::PermissionDenied));
        assert!(matches!(invalid_surface_set_error("empty").code,
                         CanonicalErrorCode::InvalidArgument));
        assert!(matches!(device_disconnected_error(&id).code,
                         CanonicalErrorCode::NotFound));
        assert!(matches!(configure_failed_error("x").code,
                         CanonicalErrorCode::Aborted));
        assert!(matches!(session_busy_error("x").code,
                         CanonicalErrorCode::Unavailable));
        assert!(matches!(fatal_device_error(&id, 3).code,
                         CanonicalErrorCode::Internal));
        assert!(matches!(exit_timeout_error("x").code,
                         CanonicalErrorCode::DeadlineExceeded));
    }

    #[test]
    fn shutdown_outcome_into_result() {
        assert!(ShutdownOutcome::Released.into_result().is_ok());
        let err = ShutdownOutcome::TimedOut.into_result().unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::DeadlineExceeded));
    }

    #[test]
    fn terminal_signal_maps_to_internal() {
        let signal = TerminalSignal::FatalDeviceError{
            camera_id: CameraId::new("1"), error_code: 4};
        assert!(matches!(signal.to_error().code, CanonicalErrorCode::Internal));
        assert_eq!(signal.to_string(), "fatal error 4 on camera 1");
    }
}
