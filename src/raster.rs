//! The pixel raster every edit works on: linear-light RGBA, `f32` per channel.

use image::{Rgba, Rgba32FImage};

/// Exclusively owned, immutable-once-published RGBA float raster.
pub type Image = Rgba32FImage;

/// 0×0 image used before anything is loaded.
pub fn empty_image() -> Image {
    Image::new(0, 0)
}

pub fn is_null(img: &Image) -> bool {
    img.width() == 0 || img.height() == 0
}

/// Bytes held by the pixel data.
pub fn memory_bytes(img: &Image) -> usize {
    img.as_raw().len() * std::mem::size_of::<f32>()
}

/// Solid-colour image, handy for new documents and tests.
pub fn filled(width: u32, height: u32, rgba: [f32; 4]) -> Image {
    Image::from_pixel(width, height, Rgba(rgba))
}

/// Image whose pixels are a function of their coordinates.
pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> [f32; 4]) -> Image {
    Image::from_fn(width, height, |x, y| Rgba(f(x, y)))
}

pub fn linear_to_srgb(a: f32) -> f32 {
    if a < 0.0031308 {
        12.92 * a
    } else {
        1.055 * a.powf(1.0 / 2.4) - 0.055
    }
}

pub fn srgb_to_linear(a: f32) -> f32 {
    if a < 0.04045 {
        a / 12.92
    } else {
        ((a + 0.055) / 1.055).powf(2.4)
    }
}

fn log_scale(val: f32) -> f32 {
    const EPS: f32 = 0.001;
    let log_eps = EPS.ln();
    if val > 0.0 {
        (val + EPS).ln() - log_eps
    } else {
        -((-val + EPS).ln() - log_eps)
    }
}

/// Log mapping where 0 → 0 and 1 → 1, used for log-scale histograms.
pub fn normalized_log_scale(val: f32) -> f32 {
    let min_log = log_scale(0.0);
    let diff_log = log_scale(1.0) - min_log;
    (log_scale(val) - min_log) / diff_log
}
