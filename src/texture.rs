//! Render cache: the pixel buffer a display layer uploads, kept in lock-step
//! with the controller's committed image.
//!
//! Realizing the cache does not copy pixels; it pins the committed
//! `Arc<Image>` and bumps a generation counter so consumers can tell a new
//! upload is needed.  The actual GPU transfer belongs to the consumer, which
//! can spread it over several frames with an [`UploadCursor`].

use std::sync::Arc;
use std::time::Instant;

use crate::raster::Image;

#[derive(Debug)]
pub struct RenderCache {
    source: Option<Arc<Image>>,
    dirty: bool,
    generation: u64,
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderCache {
    pub fn new() -> Self {
        Self {
            source: None,
            dirty: true,
            generation: 0,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Re-pin `current` if the cache is dirty and return the realization.
    pub fn realize(&mut self, current: &Arc<Image>) -> Texture<'_> {
        if self.dirty || self.source.is_none() {
            let start = Instant::now();
            self.source = Some(Arc::clone(current));
            self.dirty = false;
            self.generation += 1;
            crate::log_debug!(
                "Render cache: realized {}×{} (generation {}) in {:.2?}",
                current.width(),
                current.height(),
                self.generation,
                start.elapsed()
            );
        }
        let image = self.source.get_or_insert_with(|| Arc::clone(current));
        Texture {
            image,
            generation: self.generation,
        }
    }

    /// Drop the pinned buffer so the committed image is uniquely owned again.
    pub fn release(&mut self) {
        self.source = None;
        self.dirty = true;
    }

    /// Last realization, if any.
    pub fn texture(&self) -> Option<Texture<'_>> {
        self.source.as_deref().map(|image| Texture {
            image,
            generation: self.generation,
        })
    }
}

/// Read-only view of a realized render cache.
#[derive(Clone, Copy, Debug)]
pub struct Texture<'a> {
    image: &'a Image,
    generation: u64,
}

impl<'a> Texture<'a> {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Bumped every time the cache is realized from a new commit.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn image(&self) -> &'a Image {
        self.image
    }

    /// Interleaved RGBA floats, row-major.
    pub fn pixels(&self) -> &'a [f32] {
        self.image.as_raw()
    }

    /// The same pixels as raw bytes, ready for an `Rgba32Float` upload.
    pub fn bytes(&self) -> &'a [u8] {
        bytemuck::cast_slice(self.image.as_raw())
    }

    /// Iterate the image in whole-scanline chunks of at most
    /// `chunk_pixels` pixels (always at least one row).
    pub fn upload_cursor(&self, chunk_pixels: usize) -> UploadCursor<'a> {
        let width = self.image.width() as usize;
        let rows_per_chunk = if width == 0 {
            1
        } else {
            (chunk_pixels / width).max(1)
        };
        UploadCursor {
            data: self.image.as_raw(),
            width,
            height: self.image.height() as usize,
            rows_per_chunk,
            next_row: 0,
        }
    }
}

/// One piece of an incremental upload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UploadChunk<'a> {
    pub y_offset: u32,
    pub rows: u32,
    pub pixels: &'a [f32],
}

/// Scanline-chunked iterator over a texture.
#[derive(Clone, Debug)]
pub struct UploadCursor<'a> {
    data: &'a [f32],
    width: usize,
    height: usize,
    rows_per_chunk: usize,
    next_row: usize,
}

impl UploadCursor<'_> {
    pub fn is_finished(&self) -> bool {
        self.next_row >= self.height
    }
}

impl<'a> Iterator for UploadCursor<'a> {
    type Item = UploadChunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_finished() || self.width == 0 {
            return None;
        }
        let rows = self.rows_per_chunk.min(self.height - self.next_row);
        let stride = self.width * 4;
        let start = self.next_row * stride;
        let chunk = UploadChunk {
            y_offset: self.next_row as u32,
            rows: rows as u32,
            pixels: &self.data[start..start + rows * stride],
        };
        self.next_row += rows;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster;

    #[test]
    fn realize_only_when_dirty() {
        let img = Arc::new(raster::filled(3, 2, [0.5; 4]));
        let mut cache = RenderCache::new();
        assert!(cache.texture().is_none());
        assert_eq!(cache.realize(&img).generation(), 1);
        assert_eq!(cache.realize(&img).generation(), 1);
        cache.mark_dirty();
        assert_eq!(cache.realize(&img).generation(), 2);
        assert_eq!(cache.texture().map(|t| t.generation()), Some(2));
    }

    #[test]
    fn release_unpins_the_image() {
        let img = Arc::new(raster::filled(1, 1, [1.0; 4]));
        let mut cache = RenderCache::new();
        cache.realize(&img);
        assert_eq!(Arc::strong_count(&img), 2);
        cache.release();
        assert_eq!(Arc::strong_count(&img), 1);
        assert!(cache.is_dirty());
    }

    #[test]
    fn bytes_cover_every_channel() {
        let img = Arc::new(raster::filled(4, 3, [0.25; 4]));
        let mut cache = RenderCache::new();
        let tex = cache.realize(&img);
        assert_eq!(tex.bytes().len(), 4 * 3 * 4 * 4);
        assert_eq!(&tex.bytes()[..4], &0.25f32.to_ne_bytes());
    }

    #[test]
    fn upload_cursor_walks_whole_rows() {
        let img = Arc::new(raster::from_fn(4, 5, |_, y| [y as f32; 4]));
        let mut cache = RenderCache::new();
        let tex = cache.realize(&img);
        let chunks: Vec<_> = tex.upload_cursor(8).collect();
        assert_eq!(chunks.iter().map(|c| c.rows).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(chunks[2].y_offset, 4);
        assert_eq!(chunks[2].pixels[0], 4.0);
        // chunk smaller than a row still makes progress
        assert_eq!(tex.upload_cursor(1).count(), 5);
    }
}
