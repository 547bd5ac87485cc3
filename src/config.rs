// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use crate::abstract_camera::CameraId;
use crate::abstract_tracker::TextureId;
use crate::capture_request::{EffectMode, RequestTemplate};
use crate::pipeline_arbiter::FrameSourceMode;

#[derive(Clone, Debug)]
pub struct SharedCameraConfig {
    pub camera_id: CameraId,

    /// Which pipeline should own the texture once the session is active.
    pub frame_source: FrameSourceMode,

    /// Longest a UI-thread call waits for a pending session mutation to
    /// settle before giving up with SessionBusy.
    pub safety_timeout: Duration,

    /// Bound on how long reconfigure() waits for the session to be safe
    /// before failing with SessionBusy. Zero makes it fail fast.
    pub reconfigure_wait: Duration,

    /// Longest pause/shutdown waits for the camera to confirm release.
    pub exit_timeout: Duration,

    /// (width, height) of the CPU image reader.
    pub cpu_image_size: (u32, u32),

    pub template: RequestTemplate,
    pub effect_mode: EffectMode,

    /// Texture the camera stream is rendered into.
    pub texture_id: TextureId,
}

impl Default for SharedCameraConfig {
    fn default() -> Self {
        SharedCameraConfig{camera_id: CameraId::new("0"),
                           frame_source: FrameSourceMode::Tracking,
                           safety_timeout: Duration::from_secs(2),
                           reconfigure_wait: Duration::from_millis(250),
                           exit_timeout: Duration::from_secs(3),
                           cpu_image_size: (640, 480),
                           template: RequestTemplate::Record,
                           effect_mode: EffectMode::Sepia,
                           texture_id: TextureId(1)}
    }
}
