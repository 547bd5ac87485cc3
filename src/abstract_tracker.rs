// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::CanonicalError;

use crate::abstract_camera::CameraId;
use crate::surface::Surface;

/// Name of the GPU texture that the camera stream is rendered into.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrackingState {
    Tracking,
    Paused,
    Stopped,
}

/// One update from the tracking pipeline.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TrackedFrame {
    /// Camera timestamp of the image this update was derived from.
    pub timestamp_ns: i64,
    pub tracking_state: TrackingState,
}

/// The external tracking pipeline, treated as a black box that shares the
/// camera stream. Its session is resumed and paused in lock-step with the
/// capture session; the renderer pulls frames from it.
/// Implementations must tolerate calls from the background worker (resume,
/// pause, surface negotiation) concurrently with the render thread
/// (pull_latest_frame).
pub trait TrackingProvider: Send + Sync {
    /// Surfaces the tracking pipeline needs the capture session to feed.
    fn tracking_surfaces(&self) -> Vec<Surface>;

    /// Registers additional app-owned surfaces (the CPU image reader) that
    /// will share the stream.
    fn set_app_surfaces(&self, camera_id: &CameraId, surfaces: &[Surface]);

    /// Tells the tracking pipeline which GPU texture to render the camera
    /// image into.
    fn notify_texture_target(&self, texture_id: TextureId);

    fn session_resume(&self) -> Result<(), CanonicalError>;
    fn session_pause(&self) -> Result<(), CanonicalError>;

    /// Latest update, or None if nothing new is available.
    fn pull_latest_frame(&self) -> Result<Option<TrackedFrame>, CanonicalError>;
}

/// The renderer's GPU-visible texture that receives the raw camera stream.
/// Only ever touched from the render thread.
pub trait SharedTexture {
    /// Detaches from the current GPU context. Fails if already detached.
    fn detach(&mut self) -> Result<(), CanonicalError>;

    fn attach(&mut self, texture_id: TextureId) -> Result<(), CanonicalError>;

    /// Latches the most recent camera image into the texture.
    fn update_tex_image(&mut self) -> Result<(), CanonicalError>;
}
