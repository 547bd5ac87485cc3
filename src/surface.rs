// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use canonical_error::CanonicalError;

use crate::errors::invalid_surface_set_error;

static NEXT_SURFACE_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceId(u32);

impl SurfaceId {
    /// Allocates a process-unique id.
    pub fn next() -> SurfaceId {
        SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Which consumer a capture target feeds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Internal input of the tracking pipeline.
    Tracking,
    /// The raw-capture CPU image reader.
    CpuImageReader,
}

/// A sink that a capture session writes frames into. Clones share the same
/// released flag: once any holder calls release(), every clone reports
/// released.
#[derive(Clone, Debug)]
pub struct Surface {
    id: SurfaceId,
    kind: SurfaceKind,
    released: Arc<AtomicBool>,
}

impl Surface {
    pub fn new(kind: SurfaceKind) -> Surface {
        Surface{id: SurfaceId::next(),
                kind,
                released: Arc::new(AtomicBool::new(false))}
    }

    pub fn id(&self) -> SurfaceId { self.id }
    pub fn kind(&self) -> SurfaceKind { self.kind }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

/// The sinks that must all be attached before a session counts as correctly
/// configured: the tracking pipeline's internal surfaces plus the raw-capture
/// image-reader surface.
#[derive(Clone, Debug, Default)]
pub struct PendingSurfaceSet {
    surfaces: Vec<Surface>,
}

impl PendingSurfaceSet {
    pub fn new(surfaces: Vec<Surface>) -> PendingSurfaceSet {
        PendingSurfaceSet{surfaces}
    }

    /// Tracking surfaces first, reader surface last.
    pub fn from_parts(tracking: Vec<Surface>, reader: Surface) -> PendingSurfaceSet {
        let mut surfaces = tracking;
        surfaces.push(reader);
        PendingSurfaceSet{surfaces}
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn ids(&self) -> Vec<SurfaceId> {
        self.surfaces.iter().map(Surface::id).collect()
    }

    pub fn len(&self) -> usize { self.surfaces.len() }
    pub fn is_empty(&self) -> bool { self.surfaces.is_empty() }

    /// Non-empty, and no member released.
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.surfaces.is_empty() {
            return Err(invalid_surface_set_error("no target surfaces"));
        }
        if let Some(s) = self.surfaces.iter().find(|s| s.is_released()) {
            return Err(invalid_surface_set_error(
                format!("{} ({:?}) has been released", s.id(), s.kind()).as_str()));
        }
        Ok(())
    }

    /// True while every member is still valid. Checked again when the session
    /// goes Active.
    pub fn all_valid(&self) -> bool {
        !self.surfaces.iter().any(Surface::is_released)
    }
}
