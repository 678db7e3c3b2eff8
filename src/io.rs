// ============================================================================
// IMAGE FILE I/O — decode into linear float, encode with tonemapping
// ============================================================================
//
// Everything in memory is linear-light RGBA f32.  Float formats (.exr,
// .hdr, .pfm) are stored as-is apart from the exposure gain; 8-bit formats
// get gain, then sRGB or gamma encoding, then optional dithering before
// quantization.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;

use image::codecs::hdr::HdrEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::openexr::OpenExrEncoder;
use image::{ColorType, DynamicImage, ImageEncoder, ImageError, ImageFormat, Rgb};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::EditError;
use crate::raster::{self, Image};

const JPEG_QUALITY: u8 = 100;

/// Output container, picked from the file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Exr,
    Hdr,
    Pfm,
    Png,
    Jpeg,
    Bmp,
    Tga,
    Tiff,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<Self, EditError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        Ok(match ext.as_str() {
            "exr" => FileFormat::Exr,
            "hdr" => FileFormat::Hdr,
            "pfm" => FileFormat::Pfm,
            "png" => FileFormat::Png,
            "jpg" | "jpeg" => FileFormat::Jpeg,
            "bmp" => FileFormat::Bmp,
            "tga" => FileFormat::Tga,
            "tif" | "tiff" => FileFormat::Tiff,
            "" => {
                return Err(EditError::Unsupported(format!(
                    "'{}' has no file extension",
                    path.display()
                )));
            }
            other => return Err(EditError::Unsupported(format!("'.{}' output", other))),
        })
    }

    /// Stores floats; no gamma or quantization on save.
    pub fn is_hdr(&self) -> bool {
        matches!(self, FileFormat::Exr | FileFormat::Hdr | FileFormat::Pfm)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Exr => "exr",
            FileFormat::Hdr => "hdr",
            FileFormat::Pfm => "pfm",
            FileFormat::Png => "png",
            FileFormat::Jpeg => "jpg",
            FileFormat::Bmp => "bmp",
            FileFormat::Tga => "tga",
            FileFormat::Tiff => "tiff",
        }
    }
}

/// Tonemapping applied while saving.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveParams {
    /// Linear multiplier, applied to every format.
    pub gain: f32,
    /// Display gamma for 8-bit formats; ignored when `srgb` is set.
    pub gamma: f32,
    /// Encode 8-bit output with the sRGB curve.
    pub srgb: bool,
    /// Add sub-LSB noise before quantizing to 8 bits.
    pub dither: bool,
}

impl Default for SaveParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gamma: 2.2,
            srgb: true,
            dither: true,
        }
    }
}

impl SaveParams {
    /// Gain for an exposure in stops.
    pub fn with_exposure(mut self, stops: f32) -> Self {
        self.gain = stops.exp2();
        self
    }
}

fn io_error(path: &Path, e: impl std::fmt::Display) -> EditError {
    EditError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

fn decode_error(path: &Path, e: impl std::fmt::Display) -> EditError {
    EditError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

fn encode_error(path: &Path, e: impl std::fmt::Display) -> EditError {
    EditError::Encode {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

fn map_image_error(path: &Path, e: ImageError, decoding: bool) -> EditError {
    match e {
        ImageError::IoError(io) => io_error(path, io),
        ImageError::Unsupported(u) => EditError::Unsupported(u.to_string()),
        other if decoding => decode_error(path, other),
        other => encode_error(path, other),
    }
}

// ============================================================================
// LOADING
// ============================================================================

/// Decode `path` into a linear float image.  8-bit and 16-bit sources are
/// assumed to be sRGB encoded.
pub fn load_image(path: &Path) -> Result<Image, EditError> {
    let start = Instant::now();
    let is_pfm = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pfm"));

    let img = if is_pfm {
        read_pfm(path)?
    } else {
        let decoded = image::open(path).map_err(|e| map_image_error(path, e, true))?;
        let linear = matches!(
            decoded,
            DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_)
        );
        let mut img = decoded.into_rgba32f();
        if !linear {
            img.par_chunks_mut(4).for_each(|px| {
                for c in &mut px[..3] {
                    *c = raster::srgb_to_linear(*c);
                }
            });
        }
        img
    };

    if raster::is_null(&img) {
        return Err(decode_error(path, "image has no pixels"));
    }
    crate::log_info!(
        "Loaded '{}' ({}×{}) in {:.2?}",
        path.display(),
        img.width(),
        img.height(),
        start.elapsed()
    );
    Ok(img)
}

// ============================================================================
// SAVING
// ============================================================================

/// Apply gain (and, for 8-bit targets, the transfer curve) to a copy.
fn tonemapped(img: &Image, format: FileFormat, params: &SaveParams) -> Image {
    let mut out = img.clone();
    let gain = params.gain;
    let inv_gamma = 1.0 / params.gamma;
    let encode = !format.is_hdr();
    out.par_chunks_mut(4).for_each(|px| {
        for c in &mut px[..3] {
            let mut v = *c * gain;
            if encode {
                v = if params.srgb {
                    raster::linear_to_srgb(v)
                } else if params.gamma != 1.0 {
                    v.max(0.0).powf(inv_gamma)
                } else {
                    v
                };
            }
            *c = v;
        }
    });
    out
}

/// Deterministic noise in `[-0.5, 0.5)` for pixel `(x, y)`.
fn dither_noise(x: u32, y: u32) -> f32 {
    let mut h = x.wrapping_mul(0x8da6_b343) ^ y.wrapping_mul(0xd816_3841);
    h ^= h >> 13;
    h = h.wrapping_mul(0x2c1b_3c6d);
    h ^= h >> 16;
    (h >> 8) as f32 / (1u32 << 24) as f32 - 0.5
}

/// Quantize to 8 bits per channel.  Alpha is never dithered.
fn quantize(img: &Image, channels: usize, dither: bool) -> Vec<u8> {
    let w = img.width() as usize;
    let stride = w * channels;
    let mut data = vec![0u8; stride * img.height() as usize];
    let src = img.as_raw();
    data.par_chunks_mut(stride.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w {
                let px = &src[(y * w + x) * 4..(y * w + x) * 4 + 4];
                let noise = if dither {
                    dither_noise(x as u32, y as u32) / 255.0
                } else {
                    0.0
                };
                for c in 0..channels {
                    let v = if c < 3 { px[c] + noise } else { px[c] };
                    row[x * channels + c] = (v * 255.0).clamp(0.0, 255.0) as u8;
                }
            }
        });
    data
}

/// Write `img` to `path` in the format named by its extension.
pub fn save_image(img: &Image, path: &Path, params: &SaveParams) -> Result<(), EditError> {
    if raster::is_null(img) {
        return Err(EditError::EmptyImage);
    }
    let format = FileFormat::from_path(path)?;
    let start = Instant::now();

    let needs_copy = params.gain != 1.0 || (!format.is_hdr() && (params.srgb || params.gamma != 1.0));
    let mapped;
    let img = if needs_copy {
        mapped = tonemapped(img, format, params);
        &mapped
    } else {
        img
    };

    let (w, h) = img.dimensions();
    let file = File::create(path).map_err(|e| io_error(path, e))?;
    let mut writer = BufWriter::new(file);

    let written: Result<(), ImageError> = match format {
        FileFormat::Exr => OpenExrEncoder::new(&mut writer).write_image(
            bytemuck::cast_slice(img.as_raw()),
            w,
            h,
            ColorType::Rgba32F,
        ),
        FileFormat::Hdr => {
            let rgb: Vec<Rgb<f32>> = img.pixels().map(|p| Rgb([p[0], p[1], p[2]])).collect();
            HdrEncoder::new(&mut writer).encode(&rgb, w as usize, h as usize)
        }
        FileFormat::Pfm => {
            write_pfm(img, &mut writer).map_err(|e| io_error(path, e))?;
            Ok(())
        }
        FileFormat::Jpeg => {
            let data = quantize(img, 3, params.dither);
            JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY).encode(&data, w, h, ColorType::Rgb8)
        }
        FileFormat::Png | FileFormat::Bmp | FileFormat::Tga | FileFormat::Tiff => {
            let data = quantize(img, 4, params.dither);
            let image_format = match format {
                FileFormat::Png => ImageFormat::Png,
                FileFormat::Bmp => ImageFormat::Bmp,
                FileFormat::Tga => ImageFormat::Tga,
                _ => ImageFormat::Tiff,
            };
            image::write_buffer_with_format(&mut writer, &data, w, h, ColorType::Rgba8, image_format)
        }
    };
    written.map_err(|e| map_image_error(path, e, false))?;
    writer.flush().map_err(|e| io_error(path, e))?;

    crate::log_info!(
        "Saved '{}' ({}×{}, gain {:.3}) in {:.2?}",
        path.display(),
        w,
        h,
        params.gain,
        start.elapsed()
    );
    Ok(())
}

// ============================================================================
// PFM — portable float map, rows stored bottom to top
// ============================================================================

fn write_pfm(img: &Image, out: &mut impl Write) -> std::io::Result<()> {
    let (w, h) = img.dimensions();
    write!(out, "PF\n{} {}\n-1.0\n", w, h)?;
    let mut row_bytes = Vec::with_capacity(w as usize * 12);
    for y in (0..h).rev() {
        row_bytes.clear();
        for x in 0..w {
            let p = img.get_pixel(x, y);
            for c in 0..3 {
                row_bytes.extend_from_slice(&p[c].to_le_bytes());
            }
        }
        out.write_all(&row_bytes)?;
    }
    Ok(())
}

fn read_header_token(reader: &mut impl BufRead) -> std::io::Result<String> {
    let mut token = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0].is_ascii_whitespace() {
            if token.is_empty() {
                continue;
            }
            break;
        }
        token.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&token).into_owned())
}

fn read_pfm(path: &Path) -> Result<Image, EditError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut reader = BufReader::new(file);
    let mut token = || read_header_token(&mut reader).map_err(|e| decode_error(path, e));

    let channels = match token()?.as_str() {
        "PF" => 3,
        "Pf" => 1,
        other => return Err(decode_error(path, format!("bad PFM magic '{}'", other))),
    };
    let width: u32 = token()?
        .parse()
        .map_err(|e| decode_error(path, format!("bad width: {}", e)))?;
    let height: u32 = token()?
        .parse()
        .map_err(|e| decode_error(path, format!("bad height: {}", e)))?;
    let scale: f32 = token()?
        .parse()
        .map_err(|e| decode_error(path, format!("bad scale: {}", e)))?;
    if width == 0 || height == 0 {
        return Err(decode_error(path, "zero-sized PFM"));
    }

    let big_endian = scale > 0.0;
    let scale = scale.abs();
    let needed = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(channels * 4))
        .ok_or_else(|| decode_error(path, format!("PFM size {}×{} overflows", width, height)))?;
    // Grow with the data actually present rather than trusting the header.
    let mut bytes = Vec::new();
    reader
        .by_ref()
        .take(needed as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| decode_error(path, e))?;
    if bytes.len() != needed {
        return Err(decode_error(
            path,
            format!("truncated pixel data: {} of {} bytes", bytes.len(), needed),
        ));
    }

    let floats: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| {
            let raw = [b[0], b[1], b[2], b[3]];
            let v = if big_endian {
                f32::from_be_bytes(raw)
            } else {
                f32::from_le_bytes(raw)
            };
            v * scale
        })
        .collect();

    Ok(raster::from_fn(width, height, |x, y| {
        let row = (height - 1 - y) as usize;
        let i = (row * width as usize + x as usize) * channels;
        if channels == 3 {
            [floats[i], floats[i + 1], floats[i + 2], 1.0]
        } else {
            [floats[i], floats[i], floats[i], 1.0]
        }
    }))
}
