// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Mutex, PoisonError, Weak};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use canonical_error::CanonicalError;
use log::{debug, trace};

use crate::abstract_tracker::{SharedTexture, TextureId, TrackedFrame, TrackingProvider,
                              TrackingState};
use crate::capture_session::{SessionState, SessionStatus};

/// Which consumer currently owns the GPU-visible camera texture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameSourceMode {
    RawCapture,
    Tracking,
}

/// Result of one render tick.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RenderOutcome {
    /// No frame pending (or none may be steered right now).
    Skipped,
    /// The tracking pipeline produced an update.
    Tracking(TrackedFrame),
    /// The tracking pipeline had nothing new.
    TrackingEmpty,
    /// The raw stream was latched into the texture. `reattached` is true on
    /// the first raw frame after a mode switch.
    RawCapture { reattached: bool },
}

/// Decides, per rendered frame, which pipeline feeds the shared texture.
/// Written by the background worker (frame ready, tracking on/off) and read
/// by the render thread; never blocks either.
pub struct DualPipelineArbiter {
    texture_id: TextureId,

    // Read only. The arbiter never closes or reconfigures the session.
    session: Weak<SessionStatus>,

    tracking_active: AtomicBool,

    // Single slot; repeated captures before a render coalesce into one.
    frame_pending: AtomicBool,

    // Armed on every tracking transition, consumed by the next raw frame.
    first_frame_after_switch: AtomicBool,

    tracking_resumes: AtomicU32,
    last_tracking_state: Mutex<Option<TrackingState>>,
}

impl DualPipelineArbiter {
    pub fn new(texture_id: TextureId, session: Weak<SessionStatus>) -> Self {
        DualPipelineArbiter{texture_id,
                            session,
                            tracking_active: AtomicBool::new(false),
                            frame_pending: AtomicBool::new(false),
                            first_frame_after_switch: AtomicBool::new(true),
                            tracking_resumes: AtomicU32::new(0),
                            last_tracking_state: Mutex::new(None)}
    }

    pub fn texture_id(&self) -> TextureId {
        self.texture_id
    }

    pub fn select_source(&self) -> FrameSourceMode {
        if self.tracking_active() {
            FrameSourceMode::Tracking
        } else {
            FrameSourceMode::RawCapture
        }
    }

    pub fn tracking_active(&self) -> bool {
        self.tracking_active.load(Ordering::Acquire)
    }

    /// Records a tracking pipeline transition. Any change arms the one-time
    /// texture re-attachment on the raw path.
    pub fn set_tracking_active(&self, active: bool) {
        let was_active = self.tracking_active.swap(active, Ordering::AcqRel);
        if was_active == active {
            return;
        }
        self.first_frame_after_switch.store(true, Ordering::Release);
        if active {
            self.tracking_resumes.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Tracking pipeline {}", if active { "resumed" } else { "paused" });
    }

    /// Number of inactive -> active tracking transitions so far.
    pub fn tracking_resumes(&self) -> u32 {
        self.tracking_resumes.load(Ordering::Relaxed)
    }

    pub fn session_active(&self) -> bool {
        match self.session.upgrade() {
            Some(status) => status.get() == SessionState::Active,
            None => false,
        }
    }

    /// Called from the capture-completion callback.
    pub fn on_frame_ready(&self) {
        self.frame_pending.store(true, Ordering::Release);
    }

    pub fn is_frame_ready(&self) -> bool {
        self.frame_pending.load(Ordering::Acquire)
    }

    /// Takes the pending frame. True at most once per batch of captures.
    pub fn consume_frame(&self) -> bool {
        self.frame_pending.swap(false, Ordering::AcqRel)
    }

    pub fn clear_pending_frame(&self) {
        self.frame_pending.store(false, Ordering::Release);
    }

    pub fn last_tracking_state(&self) -> Option<TrackingState> {
        *self.last_tracking_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One render tick. Never waits: without a pending frame this is a no-op.
    pub fn render_step(&self, texture: &mut dyn SharedTexture,
                       tracker: &dyn TrackingProvider)
                       -> Result<RenderOutcome, CanonicalError> {
        if !self.consume_frame() {
            return Ok(RenderOutcome::Skipped);
        }
        match self.select_source() {
            FrameSourceMode::Tracking => {
                if !self.session_active() {
                    trace!("Not steering to tracking; session not active");
                    return Ok(RenderOutcome::Skipped);
                }
                match tracker.pull_latest_frame()? {
                    Some(frame) => {
                        *self.last_tracking_state.lock()
                            .unwrap_or_else(PoisonError::into_inner) =
                            Some(frame.tracking_state);
                        Ok(RenderOutcome::Tracking(frame))
                    },
                    None => Ok(RenderOutcome::TrackingEmpty),
                }
            },
            FrameSourceMode::RawCapture => {
                let reattached = self.first_frame_after_switch.swap(false, Ordering::AcqRel);
                if reattached {
                    // Already detached is fine.
                    if let Err(e) = texture.detach() {
                        debug!("Ignoring texture detach failure: {}", e);
                    }
                    texture.attach(self.texture_id)?;
                }
                texture.update_tex_image()?;
                Ok(RenderOutcome::RawCapture{reattached})
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::capture_request::{EffectMode, RequestTemplate};
    use crate::capture_session::CaptureSessionCoordinator;
    use crate::safety_barrier::SessionSafetyBarrier;
    use crate::sim_tracker::{SimTexture, SimTracker};

    fn arbiter_without_session() -> DualPipelineArbiter {
        DualPipelineArbiter::new(TextureId(7), Weak::new())
    }

    #[test]
    fn render_without_pending_frame_is_a_noop() {
        let arbiter = arbiter_without_session();
        let mut texture = SimTexture::new();
        let tracker = SimTracker::new(2);
        assert_eq!(arbiter.render_step(&mut texture, &tracker).unwrap(),
                   RenderOutcome::Skipped);
        assert_eq!(texture.updates(), 0);
    }

    #[test]
    fn pending_frames_coalesce() {
        let arbiter = arbiter_without_session();
        let mut texture = SimTexture::new();
        let tracker = SimTracker::new(2);
        for _ in 0..5 {
            arbiter.on_frame_ready();
        }
        assert!(matches!(arbiter.render_step(&mut texture, &tracker).unwrap(),
                         RenderOutcome::RawCapture{..}));
        assert_eq!(arbiter.render_step(&mut texture, &tracker).unwrap(),
                   RenderOutcome::Skipped);
        assert_eq!(texture.updates(), 1);
    }

    #[test]
    fn first_raw_frame_reattaches_once_and_swallows_detach_failure() {
        let arbiter = arbiter_without_session();
        // Starts detached, so the first detach fails.
        let mut texture = SimTexture::new();
        let tracker = SimTracker::new(2);

        arbiter.on_frame_ready();
        assert_eq!(arbiter.render_step(&mut texture, &tracker).unwrap(),
                   RenderOutcome::RawCapture{reattached: true});
        assert_eq!(texture.attached_to(), Some(TextureId(7)));
        assert_eq!(texture.attach_count(), 1);

        arbiter.on_frame_ready();
        assert_eq!(arbiter.render_step(&mut texture, &tracker).unwrap(),
                   RenderOutcome::RawCapture{reattached: false});
        assert_eq!(texture.attach_count(), 1);

        // Round trip through tracking re-arms it.
        arbiter.set_tracking_active(true);
        arbiter.set_tracking_active(false);
        arbiter.on_frame_ready();
        assert_eq!(arbiter.render_step(&mut texture, &tracker).unwrap(),
                   RenderOutcome::RawCapture{reattached: true});
        assert_eq!(texture.attach_count(), 2);
        assert_eq!(arbiter.tracking_resumes(), 1);
    }

    #[test]
    fn no_steering_to_tracking_unless_session_active() {
        let barrier = Arc::new(SessionSafetyBarrier::new());
        let coordinator = CaptureSessionCoordinator::new(
            barrier, RequestTemplate::Record, EffectMode::Off);
        let arbiter = DualPipelineArbiter::new(TextureId(1),
                                               Arc::downgrade(coordinator.status()));
        let mut texture = SimTexture::new();
        let tracker = SimTracker::new(2);
        tracker.session_resume().unwrap();

        arbiter.set_tracking_active(true);
        assert_eq!(arbiter.select_source(), FrameSourceMode::Tracking);
        arbiter.on_frame_ready();
        // Session is Unconfigured.
        assert_eq!(arbiter.render_step(&mut texture, &tracker).unwrap(),
                   RenderOutcome::Skipped);
        assert_eq!(tracker.frames_pulled(), 0);
        assert_eq!(texture.updates(), 0);
    }

    #[test]
    fn dropped_session_reads_as_inactive() {
        let barrier = Arc::new(SessionSafetyBarrier::new());
        let coordinator = CaptureSessionCoordinator::new(
            barrier, RequestTemplate::Record, EffectMode::Off);
        let arbiter = DualPipelineArbiter::new(TextureId(1),
                                               Arc::downgrade(coordinator.status()));
        drop(coordinator);
        assert!(!arbiter.session_active());
    }
}
