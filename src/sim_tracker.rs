// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Stand-ins for the tracking pipeline and the renderer's texture, for tests
//! and the demo binary.

use std::sync::{Mutex, MutexGuard, PoisonError};

use canonical_error::{CanonicalError, failed_precondition_error, unavailable_error};
use log::debug;

use crate::abstract_camera::CameraId;
use crate::abstract_tracker::{SharedTexture, TextureId, TrackedFrame, TrackingProvider,
                              TrackingState};
use crate::surface::{Surface, SurfaceId, SurfaceKind};

// Nominal interval between simulated tracking updates.
const FRAME_INTERVAL_NS: i64 = 33_333_333;

#[derive(Default)]
struct SimTrackerState {
    resumed: bool,
    resumes: u32,
    pauses: u32,
    frames_pulled: u64,
    timestamp_ns: i64,
    texture_target: Option<TextureId>,
    app_surfaces: Vec<SurfaceId>,
    fail_resume: bool,
}

pub struct SimTracker {
    surfaces: Vec<Surface>,
    state: Mutex<SimTrackerState>,
}

impl SimTracker {
    pub fn new(num_surfaces: usize) -> Self {
        let surfaces = (0..num_surfaces).map(|_| Surface::new(SurfaceKind::Tracking)).collect();
        SimTracker{surfaces, state: Mutex::new(SimTrackerState::default())}
    }

    fn state(&self) -> MutexGuard<'_, SimTrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_resumed(&self) -> bool { self.state().resumed }
    pub fn resume_count(&self) -> u32 { self.state().resumes }
    pub fn pause_count(&self) -> u32 { self.state().pauses }
    pub fn frames_pulled(&self) -> u64 { self.state().frames_pulled }
    pub fn texture_target(&self) -> Option<TextureId> { self.state().texture_target }
    pub fn app_surfaces(&self) -> Vec<SurfaceId> { self.state().app_surfaces.clone() }

    /// Makes subsequent session_resume() calls fail, as when the tracking
    /// runtime cannot get the camera.
    pub fn set_fail_resume(&self, fail: bool) {
        self.state().fail_resume = fail;
    }
}

impl TrackingProvider for SimTracker {
    fn tracking_surfaces(&self) -> Vec<Surface> {
        self.surfaces.clone()
    }

    fn set_app_surfaces(&self, camera_id: &CameraId, surfaces: &[Surface]) {
        debug!("Tracker sharing camera {} with {} app surfaces", camera_id, surfaces.len());
        self.state().app_surfaces = surfaces.iter().map(Surface::id).collect();
    }

    fn notify_texture_target(&self, texture_id: TextureId) {
        self.state().texture_target = Some(texture_id);
    }

    fn session_resume(&self) -> Result<(), CanonicalError> {
        let mut state = self.state();
        if state.fail_resume {
            return Err(unavailable_error("tracking camera not available"));
        }
        state.resumed = true;
        state.resumes += 1;
        Ok(())
    }

    fn session_pause(&self) -> Result<(), CanonicalError> {
        let mut state = self.state();
        state.resumed = false;
        state.pauses += 1;
        Ok(())
    }

    fn pull_latest_frame(&self) -> Result<Option<TrackedFrame>, CanonicalError> {
        let mut state = self.state();
        if !state.resumed {
            return Err(failed_precondition_error("tracking session is paused"));
        }
        state.frames_pulled += 1;
        state.timestamp_ns += FRAME_INTERVAL_NS;
        Ok(Some(TrackedFrame{timestamp_ns: state.timestamp_ns,
                             tracking_state: TrackingState::Tracking}))
    }
}

/// Texture that behaves like a GL external texture: attach/detach must
/// alternate, and nothing can be latched while detached.
#[derive(Default)]
pub struct SimTexture {
    attached_to: Option<TextureId>,
    attach_count: u32,
    updates: u64,
}

impl SimTexture {
    /// Starts detached.
    pub fn new() -> Self {
        SimTexture::default()
    }

    pub fn attached_to(&self) -> Option<TextureId> { self.attached_to }
    pub fn attach_count(&self) -> u32 { self.attach_count }
    pub fn updates(&self) -> u64 { self.updates }
}

impl SharedTexture for SimTexture {
    fn detach(&mut self) -> Result<(), CanonicalError> {
        match self.attached_to.take() {
            Some(_) => Ok(()),
            None => Err(failed_precondition_error("texture is not attached")),
        }
    }

    fn attach(&mut self, texture_id: TextureId) -> Result<(), CanonicalError> {
        if let Some(current) = self.attached_to {
            return Err(failed_precondition_error(
                format!("texture already attached to {}", current).as_str()));
        }
        self.attached_to = Some(texture_id);
        self.attach_count += 1;
        Ok(())
    }

    fn update_tex_image(&mut self) -> Result<(), CanonicalError> {
        if self.attached_to.is_none() {
            return Err(failed_precondition_error("update on detached texture"));
        }
        self.updates += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::CanonicalErrorCode;

    #[test]
    fn frames_only_while_resumed() {
        let tracker = SimTracker::new(1);
        let err = tracker.pull_latest_frame().unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::FailedPrecondition));
        tracker.session_resume().unwrap();
        let first = tracker.pull_latest_frame().unwrap().unwrap();
        let second = tracker.pull_latest_frame().unwrap().unwrap();
        assert!(second.timestamp_ns > first.timestamp_ns);
        tracker.session_pause().unwrap();
        assert!(tracker.pull_latest_frame().is_err());
        assert_eq!(tracker.frames_pulled(), 2);
        assert_eq!((tracker.resume_count(), tracker.pause_count()), (1, 1));
    }

    #[test]
    fn texture_rejects_double_attach() {
        let mut texture = SimTexture::new();
        assert!(texture.detach().is_err());
        assert!(texture.update_tex_image().is_err());
        texture.attach(TextureId(3)).unwrap();
        assert!(texture.attach(TextureId(3)).is_err());
        texture.update_tex_image().unwrap();
        assert_eq!(texture.updates(), 1);
    }
}
