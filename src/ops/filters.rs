// ============================================================================
// IMAGE FILTERS — Gaussian blur, exposure, invert, desaturation
// ============================================================================
//
// Every filter works on linear float pixels, runs row-parallel on rayon,
// reports one progress step per row and bails out with
// `EditError::Cancelled` as soon as the token is cancelled.  None of them
// has an exact inverse, so their commands record a full snapshot.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::controller::{CommandResult, snapshot_command};
use crate::error::EditError;
use crate::ops::transform::{self, ResizeParams};
use crate::progress::AtomicProgress;
use crate::raster::Image;

/// Parameters of the Gaussian blur dialog.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlurParams {
    pub sigma: f32,
}

/// Parameters of the exposure dialog, in photographic stops.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExposureParams {
    pub stops: f32,
}

impl ExposureParams {
    pub fn gain(&self) -> f32 {
        self.stops.exp2()
    }
}

/// Blur followed by a resample, e.g. for downscaling without aliasing.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SoftenParams {
    pub blur: BlurParams,
    pub resize: ResizeParams,
}

// ---------------------------------------------------------------------------
//  Per-pixel maps
// ---------------------------------------------------------------------------

/// Apply `f` to every pixel, row-parallel.
fn map_pixels(
    src: &Image,
    progress: &AtomicProgress,
    f: impl Fn([f32; 4]) -> [f32; 4] + Sync,
) -> Result<Image, EditError> {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 {
        return Err(EditError::EmptyImage);
    }

    let mut rows = progress.clone();
    rows.set_num_steps(h);
    let src_raw = src.as_raw();
    let stride = w * 4;
    let mut dst_raw = vec![0.0f32; w * h * 4];

    dst_raw.par_chunks_mut(stride).enumerate().for_each(|(y, row_out)| {
        if rows.is_cancelled() {
            return;
        }
        let row_in = &src_raw[y * stride..(y + 1) * stride];
        for (px_out, px_in) in row_out.chunks_exact_mut(4).zip(row_in.chunks_exact(4)) {
            px_out.copy_from_slice(&f([px_in[0], px_in[1], px_in[2], px_in[3]]));
        }
        rows.advance(1);
    });

    if progress.is_cancelled() {
        return Err(EditError::Cancelled);
    }
    Image::from_raw(w as u32, h as u32, dst_raw)
        .ok_or_else(|| EditError::Failed("filter produced a malformed buffer".to_string()))
}

/// Multiply colour channels by `2^stops`.  Alpha is left alone.
pub fn exposure(src: &Image, params: ExposureParams, progress: &AtomicProgress) -> Result<Image, EditError> {
    let gain = params.gain();
    map_pixels(src, progress, |[r, g, b, a]| [r * gain, g * gain, b * gain, a])
}

/// `1 - c` per colour channel.
pub fn invert(src: &Image, progress: &AtomicProgress) -> Result<Image, EditError> {
    map_pixels(src, progress, |[r, g, b, a]| [1.0 - r, 1.0 - g, 1.0 - b, a])
}

/// Greyscale using the BT.709 luminance weights.
pub fn desaturate(src: &Image, progress: &AtomicProgress) -> Result<Image, EditError> {
    map_pixels(src, progress, |[r, g, b, a]| {
        let lum = 0.2126 * r + 0.7152 * g + 0.0722 * b;
        [lum, lum, lum, a]
    })
}

// ---------------------------------------------------------------------------
//  Parallel separable Gaussian blur (rayon)
// ---------------------------------------------------------------------------

/// Build a 1-D Gaussian kernel truncated at ceil(3*sigma).
fn build_gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(0.0) as usize;
    if radius == 0 {
        return vec![1.0];
    }
    let s2 = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..radius * 2 + 1)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / s2).exp()
        })
        .collect();
    let inv = 1.0 / kernel.iter().sum::<f32>();
    for v in &mut kernel {
        *v *= inv;
    }
    kernel
}

/// One 1-D pass.  `sample(row, tap)` returns the index of the source pixel
/// for output row `row` and tap offset `tap`, already clamped to the edge.
fn convolve_pass(
    src: &[f32],
    w: usize,
    h: usize,
    kernel: &[f32],
    progress: &AtomicProgress,
    sample: impl Fn(usize, usize, isize) -> usize + Sync,
) -> Vec<f32> {
    let radius = (kernel.len() / 2) as isize;
    let mut rows = progress.clone();
    rows.set_num_steps(h);
    let mut out = vec![0.0f32; w * h * 4];

    out.par_chunks_mut(w * 4).enumerate().for_each(|(y, row_out)| {
        if rows.is_cancelled() {
            return;
        }
        for x in 0..w {
            let mut acc = [0.0f32; 4];
            for (ki, &kv) in kernel.iter().enumerate() {
                let idx = sample(x, y, ki as isize - radius) * 4;
                for c in 0..4 {
                    acc[c] += src[idx + c] * kv;
                }
            }
            row_out[x * 4..x * 4 + 4].copy_from_slice(&acc);
        }
        rows.advance(1);
    });
    out
}

/// Rayon-parallelized separable Gaussian blur with clamped edges.
pub fn gaussian_blur(src: &Image, params: BlurParams, progress: &AtomicProgress) -> Result<Image, EditError> {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 {
        return Err(EditError::EmptyImage);
    }
    if !params.sigma.is_finite() || params.sigma < 0.0 {
        return Err(EditError::Failed(format!("invalid blur sigma {}", params.sigma)));
    }

    let kernel = build_gaussian_kernel(params.sigma);
    let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

    // --- Horizontal pass ---
    let horizontal = progress.child(0.5);
    let buf_h = convolve_pass(src.as_raw(), w, h, &kernel, &horizontal, |x, y, d| {
        y * w + clamp(x as isize + d, w)
    });
    if progress.is_cancelled() {
        return Err(EditError::Cancelled);
    }

    // --- Vertical pass ---
    let vertical = progress.child(1.0);
    let buf_v = convolve_pass(&buf_h, w, h, &kernel, &vertical, |x, y, d| {
        clamp(y as isize + d, h) * w + x
    });
    if progress.is_cancelled() {
        return Err(EditError::Cancelled);
    }

    Image::from_raw(w as u32, h as u32, buf_v)
        .ok_or_else(|| EditError::Failed("blur produced a malformed buffer".to_string()))
}

/// Blur then resample, splitting the progress range 70/30.
pub fn soften(src: &Image, params: SoftenParams, progress: &AtomicProgress) -> Result<Image, EditError> {
    let blurred = gaussian_blur(src, params.blur, &progress.child(0.7))?;
    transform::resampled(&blurred, params.resize, &progress.child(1.0))
}

// ---------------------------------------------------------------------------
//  Commands
// ---------------------------------------------------------------------------

pub fn blur_command(
    params: BlurParams,
) -> impl FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static {
    snapshot_command(format!("Gaussian Blur ({:.1})", params.sigma), move |img: &Image, p: &AtomicProgress| {
        gaussian_blur(img, params, p)
    })
}

pub fn exposure_command(
    params: ExposureParams,
) -> impl FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static {
    snapshot_command(format!("Exposure {:+.2} EV", params.stops), move |img: &Image, p: &AtomicProgress| {
        exposure(img, params, p)
    })
}

pub fn invert_command() -> impl FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static {
    snapshot_command("Invert", invert)
}

pub fn desaturate_command() -> impl FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static {
    snapshot_command("Desaturate", desaturate)
}

pub fn soften_command(
    params: SoftenParams,
) -> impl FnOnce(Arc<Image>, &AtomicProgress) -> CommandResult + Send + 'static {
    snapshot_command("Soften", move |img: &Image, p: &AtomicProgress| soften(img, params, p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressState;
    use crate::raster;

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let k = build_gaussian_kernel(1.5);
        assert_eq!(k.len(), 2 * 5 + 1);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((k[0] - k[k.len() - 1]).abs() < 1e-7);
        assert_eq!(build_gaussian_kernel(0.0), vec![1.0]);
    }

    #[test]
    fn blur_preserves_flat_fields_and_hdr_range() {
        let img = raster::filled(9, 7, [4.0, 0.25, 12.0, 1.0]);
        let out = gaussian_blur(&img, BlurParams { sigma: 2.0 }, &AtomicProgress::new()).unwrap();
        for p in out.pixels() {
            assert!((p[0] - 4.0).abs() < 1e-4);
            assert!((p[2] - 12.0).abs() < 1e-4);
        }
    }

    #[test]
    fn blur_spreads_an_impulse() {
        let img = raster::from_fn(5, 5, |x, y| {
            let v = if x == 2 && y == 2 { 1.0 } else { 0.0 };
            [v, v, v, 1.0]
        });
        let out = gaussian_blur(&img, BlurParams { sigma: 1.0 }, &AtomicProgress::new()).unwrap();
        assert!(out.get_pixel(2, 2)[0] < 1.0);
        assert!(out.get_pixel(1, 2)[0] > 0.0);
        assert!((out.get_pixel(1, 2)[0] - out.get_pixel(3, 2)[0]).abs() < 1e-6);
    }

    #[test]
    fn blur_reports_full_progress() {
        let img = raster::filled(6, 4, [0.5; 4]);
        let progress = AtomicProgress::new();
        gaussian_blur(&img, BlurParams { sigma: 1.0 }, &progress).unwrap();
        match progress.progress() {
            ProgressState::Fraction(f) => assert!((f - 1.0).abs() < 1e-4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cancelled_filters_return_cancelled() {
        let img = raster::filled(6, 4, [0.5; 4]);
        let progress = AtomicProgress::new();
        progress.request_cancel();
        assert_eq!(
            gaussian_blur(&img, BlurParams { sigma: 1.0 }, &progress),
            Err(EditError::Cancelled)
        );
        assert_eq!(invert(&img, &progress), Err(EditError::Cancelled));
    }

    #[test]
    fn exposure_scales_colour_not_alpha() {
        let img = raster::filled(2, 2, [0.5, 1.0, 2.0, 0.75]);
        let out = exposure(&img, ExposureParams { stops: 1.0 }, &AtomicProgress::new()).unwrap();
        assert_eq!(out.get_pixel(1, 1).0, [1.0, 2.0, 4.0, 0.75]);
    }

    #[test]
    fn desaturate_uses_luminance() {
        let img = raster::filled(1, 1, [1.0, 0.0, 0.0, 1.0]);
        let out = desaturate(&img, &AtomicProgress::new()).unwrap();
        assert!((out.get_pixel(0, 0)[1] - 0.2126).abs() < 1e-6);
    }

    #[test]
    fn empty_input_is_rejected() {
        let img = raster::empty_image();
        assert_eq!(invert(&img, &AtomicProgress::new()), Err(EditError::EmptyImage));
    }

    #[test]
    fn soften_changes_size() {
        let img = raster::filled(8, 8, [0.3; 4]);
        let params = SoftenParams {
            blur: BlurParams { sigma: 1.0 },
            resize: ResizeParams {
                width: 4,
                height: 2,
                interpolation: Default::default(),
            },
        };
        let out = soften(&img, params, &AtomicProgress::new()).unwrap();
        assert_eq!(out.dimensions(), (4, 2));
    }
}
