// ============================================================================
// TRANSFORM OPERATIONS — flip, rotate, resample
// ============================================================================
//
// Flips and quarter-turn rotations are exact permutations of pixels, so
// their commands carry a closed-form undo record instead of a snapshot.
// Resampling loses information and falls back to a full snapshot.

use std::sync::Arc;

use image::imageops;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::components::history::UndoRecord;
use crate::controller::{CommandOutput, CommandResult};
use crate::error::EditError;
use crate::progress::AtomicProgress;
use crate::raster::{self, Image};

pub fn flipped_horizontal(img: &Image) -> Image {
    imageops::flip_horizontal(img)
}

pub fn flipped_vertical(img: &Image) -> Image {
    imageops::flip_vertical(img)
}

pub fn rotated_90cw(img: &Image) -> Image {
    imageops::rotate90(img)
}

pub fn rotated_90ccw(img: &Image) -> Image {
    imageops::rotate270(img)
}

pub fn rotated_180(img: &Image) -> Image {
    imageops::rotate180(img)
}

/// Pixel-permuting transforms with an exact inverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    FlipHorizontal,
    FlipVertical,
    Rotate90Cw,
    Rotate90Ccw,
    Rotate180,
}

impl Transform {
    pub fn label(&self) -> &'static str {
        match self {
            Transform::FlipHorizontal => "Flip Horizontal",
            Transform::FlipVertical => "Flip Vertical",
            Transform::Rotate90Cw => "Rotate 90° CW",
            Transform::Rotate90Ccw => "Rotate 90° CCW",
            Transform::Rotate180 => "Rotate 180°",
        }
    }

    pub fn inverse(&self) -> Transform {
        match self {
            Transform::Rotate90Cw => Transform::Rotate90Ccw,
            Transform::Rotate90Ccw => Transform::Rotate90Cw,
            other => *other,
        }
    }

    pub fn apply(&self, img: &Image) -> Image {
        match self {
            Transform::FlipHorizontal => flipped_horizontal(img),
            Transform::FlipVertical => flipped_vertical(img),
            Transform::Rotate90Cw => rotated_90cw(img),
            Transform::Rotate90Ccw => rotated_90ccw(img),
            Transform::Rotate180 => rotated_180(img),
        }
    }

    /// Closed-form undo record for this transform.
    pub fn undo_record(&self) -> UndoRecord {
        let forward = *self;
        let backward = self.inverse();
        UndoRecord::closed_form(
            self.label(),
            move |img: &Image| forward.apply(img),
            move |img: &Image| backward.apply(img),
        )
    }

    /// Command for `ImageController::modify`.
    pub fn command(
        self,
    ) -> impl FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static {
        move |img: Arc<Image>, progress: &AtomicProgress| {
            if raster::is_null(&img) {
                return Err(EditError::EmptyImage);
            }
            progress.set_progress(0.0);
            let out = self.apply(&img);
            Ok(CommandOutput::edit(out, self.undo_record()))
        }
    }
}

/// Resampling filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
}

/// Parameters of the resize dialog.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResizeParams {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub interpolation: Interpolation,
}

/// Resample `src` to the requested size without clamping HDR values.
/// Checks for cancellation once per output row.
pub fn resampled(
    src: &Image,
    params: ResizeParams,
    progress: &AtomicProgress,
) -> Result<Image, EditError> {
    let (sw, sh) = (src.width() as usize, src.height() as usize);
    let (dw, dh) = (params.width as usize, params.height as usize);
    if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
        return Err(EditError::EmptyImage);
    }

    let mut rows = progress.clone();
    rows.set_num_steps(dh);
    let raw = src.as_raw();
    let sx_scale = sw as f32 / dw as f32;
    let sy_scale = sh as f32 / dh as f32;

    let mut out = vec![0.0f32; dw * dh * 4];
    out.par_chunks_mut(dw * 4).enumerate().for_each(|(y, row_out)| {
        if rows.is_cancelled() {
            return;
        }
        let fy = ((y as f32 + 0.5) * sy_scale - 0.5).clamp(0.0, (sh - 1) as f32);
        for x in 0..dw {
            let fx = ((x as f32 + 0.5) * sx_scale - 0.5).clamp(0.0, (sw - 1) as f32);
            let px = &mut row_out[x * 4..x * 4 + 4];
            match params.interpolation {
                Interpolation::Nearest => {
                    let idx = (fy.round() as usize * sw + fx.round() as usize) * 4;
                    px.copy_from_slice(&raw[idx..idx + 4]);
                }
                Interpolation::Bilinear => {
                    let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
                    let (x1, y1) = ((x0 + 1).min(sw - 1), (y0 + 1).min(sh - 1));
                    let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);
                    for c in 0..4 {
                        let at = |xx: usize, yy: usize| raw[(yy * sw + xx) * 4 + c];
                        let top = at(x0, y0) * (1.0 - tx) + at(x1, y0) * tx;
                        let bottom = at(x0, y1) * (1.0 - tx) + at(x1, y1) * tx;
                        px[c] = top * (1.0 - ty) + bottom * ty;
                    }
                }
            }
        }
        rows.advance(1);
    });

    if progress.is_cancelled() {
        return Err(EditError::Cancelled);
    }
    Image::from_raw(params.width, params.height, out)
        .ok_or_else(|| EditError::Failed("resample produced a malformed buffer".to_string()))
}

/// Resize command with snapshot undo.
pub fn resize_command(
    params: ResizeParams,
) -> impl FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static {
    move |img: Arc<Image>, progress: &AtomicProgress| {
        let out = resampled(&img, params, progress)?;
        let label = format!("Resize to {}×{}", params.width, params.height);
        Ok(CommandOutput::edit(
            out,
            UndoRecord::full_snapshot(label, (*img).clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asymmetric() -> Image {
        raster::from_fn(4, 3, |x, y| [x as f32, y as f32, (x * 10 + y) as f32, 1.0])
    }

    const ALL: [Transform; 5] = [
        Transform::FlipHorizontal,
        Transform::FlipVertical,
        Transform::Rotate90Cw,
        Transform::Rotate90Ccw,
        Transform::Rotate180,
    ];

    #[test]
    fn inverses_are_exact() {
        let img = asymmetric();
        for t in ALL {
            assert_eq!(t.inverse().apply(&t.apply(&img)), img, "{:?}", t);
            assert_eq!(t.apply(&t.inverse().apply(&img)), img, "{:?}", t);
        }
    }

    #[test]
    fn quarter_turn_swaps_dimensions() {
        let img = asymmetric();
        let r = rotated_90cw(&img);
        assert_eq!(r.dimensions(), (3, 4));
        // top-left of the result is bottom-left of the source
        assert_eq!(r.get_pixel(0, 0), img.get_pixel(0, 2));
    }

    #[test]
    fn undo_record_restores_original() {
        let img = asymmetric();
        for t in ALL {
            let mut edited = t.apply(&img);
            let mut record = t.undo_record();
            record.undo(&mut edited);
            assert_eq!(edited, img);
            record.redo(&mut edited);
            assert_eq!(edited, t.apply(&img));
        }
    }

    #[test]
    fn resample_keeps_hdr_values() {
        let img = raster::filled(4, 4, [8.0, 2.0, 0.5, 1.0]);
        let params = ResizeParams {
            width: 2,
            height: 3,
            interpolation: Interpolation::Bilinear,
        };
        let out = resampled(&img, params, &AtomicProgress::new()).unwrap();
        assert_eq!(out.dimensions(), (2, 3));
        for p in out.pixels() {
            assert!((p[0] - 8.0).abs() < 1e-5);
        }
    }

    #[test]
    fn resample_observes_cancellation() {
        let img = raster::filled(8, 8, [1.0; 4]);
        let progress = AtomicProgress::new();
        progress.request_cancel();
        let params = ResizeParams {
            width: 4,
            height: 4,
            interpolation: Interpolation::Nearest,
        };
        assert_eq!(resampled(&img, params, &progress), Err(EditError::Cancelled));
    }
}
