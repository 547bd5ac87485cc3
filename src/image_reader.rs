// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::GrayImage;
use log::{trace, warn};

use crate::surface::{Surface, SurfaceKind};

/// CPU-side sink of the raw camera stream. Holds the surface the capture
/// session writes into and consumes each image as it becomes available, so
/// at most one image is ever held.
pub struct CpuImageReader {
    surface: Surface,
    width: u32,
    height: u32,
    images_processed: u64,
    skipped: u64,
}

impl CpuImageReader {
    pub fn new(width: u32, height: u32) -> Self {
        CpuImageReader{surface: Surface::new(SurfaceKind::CpuImageReader),
                       width, height,
                       images_processed: 0,
                       skipped: 0}
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn images_processed(&self) -> u64 {
        self.images_processed
    }

    pub fn images_skipped(&self) -> u64 {
        self.skipped
    }

    pub fn is_closed(&self) -> bool {
        self.surface.is_released()
    }

    /// Takes the latest image; it is released as soon as this returns.
    pub fn on_image_available(&mut self, image: Option<GrayImage>) {
        if self.is_closed() {
            trace!("Image after reader closed");
            return;
        }
        let image = match image {
            Some(i) => i,
            None => {
                warn!("Skipping null image");
                self.skipped += 1;
                return;
            }
        };
        if image.dimensions() != (self.width, self.height) {
            warn!("Image {:?} does not match reader size {}x{}",
                  image.dimensions(), self.width, self.height);
        }
        self.images_processed += 1;
    }

    /// Releases the surface. Must only happen once no session targets it.
    pub fn close(&mut self) {
        self.surface.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_images_and_skips_nulls() {
        let mut reader = CpuImageReader::new(4, 2);
        reader.on_image_available(Some(GrayImage::new(4, 2)));
        reader.on_image_available(None);
        reader.on_image_available(Some(GrayImage::new(4, 2)));
        assert_eq!(reader.images_processed(), 2);
        assert_eq!(reader.images_skipped(), 1);
    }

    #[test]
    fn close_releases_surface_and_stops_counting() {
        let mut reader = CpuImageReader::new(4, 2);
        let surface = reader.surface().clone();
        reader.close();
        assert!(surface.is_released());
        reader.on_image_available(Some(GrayImage::new(4, 2)));
        assert_eq!(reader.images_processed(), 0);
    }
}
