// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, invalid_argument_error};
use log::{debug, warn};

use crate::surface::{PendingSurfaceSet, SurfaceId};

/// Capture request templates, tuned by the device for a use case.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview,
    Record,
    StillCapture,
}

/// Keys of a capture request that a device may list as session keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestKey {
    ControlEffectMode,
    ControlAeMode,
    ControlAfMode,
    FpsRange,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EffectMode {
    Off,
    Mono,
    Negative,
    Sepia,
}

/// Immutable capture configuration handed to the hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureRequest {
    pub template: RequestTemplate,
    pub targets: Vec<SurfaceId>,
    /// None means the device default.
    pub effect_mode: Option<EffectMode>,
}

/// Accumulates a capture configuration subject to what the device allows.
#[derive(Clone, Debug)]
pub struct CaptureRequestBuilder {
    template: RequestTemplate,
    targets: Vec<SurfaceId>,
    effect_mode: Option<EffectMode>,

    // None if the device could not say which keys are costly to change.
    delay_keys: Option<Vec<RequestKey>>,
}

impl CaptureRequestBuilder {
    pub fn new(template: RequestTemplate, delay_keys: Option<Vec<RequestKey>>)
               -> CaptureRequestBuilder {
        CaptureRequestBuilder{template, targets: vec![], effect_mode: None, delay_keys}
    }

    pub fn add_target(&mut self, target: SurfaceId) -> &mut Self {
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
        self
    }

    pub fn add_targets(&mut self, surfaces: &PendingSurfaceSet) -> &mut Self {
        for id in surfaces.ids() {
            self.add_target(id);
        }
        self
    }

    pub fn targets(&self) -> &[SurfaceId] {
        &self.targets
    }

    /// Whether changing `key` may stall capture.
    pub fn key_can_cause_delay(&self, key: RequestKey) -> bool {
        match &self.delay_keys {
            Some(keys) => keys.contains(&key),
            None => {
                warn!("Changing {:?} may cause a noticeable capture delay; \
                       device did not report its session keys", key);
                false
            }
        }
    }

    /// Returns whether the effect was applied. An effect whose key is a
    /// session key is skipped, since applying it would stall transitions.
    pub fn set_effect_mode(&mut self, effect: EffectMode) -> bool {
        if self.key_can_cause_delay(RequestKey::ControlEffectMode) {
            warn!("Not setting {:?} since it can cause delays between transitions",
                  RequestKey::ControlEffectMode);
            return false;
        }
        debug!("Setting effect mode to {:?}", effect);
        self.effect_mode = Some(effect);
        true
    }

    pub fn effect_mode(&self) -> Option<EffectMode> {
        self.effect_mode
    }

    pub fn build(&self) -> Result<CaptureRequest, CanonicalError> {
        if self.targets.is_empty() {
            return Err(invalid_argument_error("capture request has no targets"));
        }
        Ok(CaptureRequest{template: self.template,
                          targets: self.targets.clone(),
                          effect_mode: self.effect_mode})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{Surface, SurfaceKind};
    use canonical_error::CanonicalErrorCode;

    #[test]
    fn build_without_targets_fails() {
        let builder = CaptureRequestBuilder::new(RequestTemplate::Record, Some(vec![]));
        let err = builder.build().unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::InvalidArgument));
    }

    #[test]
    fn effect_skipped_when_it_is_a_session_key() {
        let mut builder = CaptureRequestBuilder::new(
            RequestTemplate::Record, Some(vec![RequestKey::ControlEffectMode]));
        builder.add_target(Surface::new(SurfaceKind::Tracking).id());
        assert!(!builder.set_effect_mode(EffectMode::Sepia));
        assert_eq!(builder.build().unwrap().effect_mode, None);
    }

    #[test]
    fn effect_applied_when_keys_unknown_or_absent() {
        for keys in [None, Some(vec![RequestKey::FpsRange])] {
            let mut builder = CaptureRequestBuilder::new(RequestTemplate::Preview, keys);
            builder.add_target(Surface::new(SurfaceKind::Tracking).id());
            assert!(builder.set_effect_mode(EffectMode::Sepia));
            let request = builder.build().unwrap();
            assert_eq!(request.effect_mode, Some(EffectMode::Sepia));
            assert_eq!(request.template, RequestTemplate::Preview);
        }
    }

    #[test]
    fn targets_are_deduplicated_in_order() {
        let a = Surface::new(SurfaceKind::Tracking);
        let reader = Surface::new(SurfaceKind::CpuImageReader);
        let set = PendingSurfaceSet::from_parts(vec![a.clone()], reader.clone());
        let mut builder = CaptureRequestBuilder::new(RequestTemplate::Record, None);
        builder.add_targets(&set).add_target(a.id());
        assert_eq!(builder.targets(), &[a.id(), reader.id()]);
    }
}
