// ============================================================================
// LumaEdit CLI — headless batch editing via command-line arguments
// ============================================================================
//
// Usage examples:
//   lumaedit -i render.exr -o preview.png --exposure 1.5 --srgb --dither
//   lumaedit -i shots/*.hdr --op flip-h --op blur=2 --output-dir out/ -f exr
//   lumaedit -i scan.pfm --op resize=1024x768 --op invert --undo 1 -o a.pfm
//
// Every file goes through an ImageController exactly like an interactive
// session would: load, queue each --op as an edit, optionally undo some of
// them, then save with the requested tonemapping.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use crate::config::EngineSettings;
use crate::controller::{DrainOutcome, ImageController, snapshot_command};
use crate::io::{FileFormat, SaveParams};
use crate::ops::filters::{self, BlurParams, ExposureParams};
use crate::ops::transform::{self, Interpolation, ResizeParams, Transform};
use crate::progress::AtomicProgress;
use crate::raster::Image;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// LumaEdit headless HDR image processor.
#[derive(Parser, Debug)]
#[command(
    name = "lumaedit",
    about = "LumaEdit headless batch HDR image editor",
    long_about = "Apply undoable edits to HDR and LDR images and convert between formats.\n\
                  Reads EXR, HDR, PFM, PNG, JPEG, WEBP, BMP, TGA, TIFF; writes EXR, HDR,\n\
                  PFM, PNG, JPEG, BMP, TGA, TIFF.\n\n\
                  Example:\n  \
                  lumaedit -i render.exr --op blur=1.5 --exposure -1 -o out.png --srgb"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.exr", "shots/*.hdr").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: exr, hdr, pfm, png, jpg, bmp, tga, tiff.
    /// When omitted, the format is inferred from --output's extension, defaulting to png.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Edit to apply, in order. One of: flip-h, flip-v, rotate-cw,
    /// rotate-ccw, rotate-180, blur=SIGMA, gain=X, invert, desaturate,
    /// resize=WxH, soften=SIGMA@SCALE.
    #[arg(long = "op", value_name = "OP")]
    pub ops: Vec<EditOp>,

    /// Exposure in stops applied when saving (gain = 2^EV).
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true, value_name = "EV")]
    pub exposure: f32,

    /// Display gamma for 8-bit output (ignored with --srgb).
    #[arg(long, default_value_t = 2.2, value_name = "G")]
    pub gamma: f32,

    /// Encode 8-bit output with the sRGB curve.
    #[arg(long)]
    pub srgb: bool,

    /// Dither before quantizing to 8 bits.
    #[arg(long)]
    pub dither: bool,

    /// Undo this many of the applied edits before saving.
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub undo: usize,

    /// Print progress and per-file timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

impl CliArgs {
    pub fn save_params(&self) -> SaveParams {
        SaveParams {
            gain: 1.0,
            gamma: self.gamma,
            srgb: self.srgb,
            dither: self.dither,
        }
        .with_exposure(self.exposure)
    }
}

// ============================================================================
// Edit operations
// ============================================================================

/// One `--op` argument.
#[derive(Clone, Debug, PartialEq)]
pub enum EditOp {
    Transform(Transform),
    Blur(f32),
    Gain(f32),
    Invert,
    Desaturate,
    Resize(u32, u32),
    Soften { sigma: f32, scale: f32 },
}

impl FromStr for EditOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once('=') {
            Some((n, a)) => (n.trim(), Some(a.trim())),
            None => (s.trim(), None),
        };
        let number = |what: &str| -> Result<f32, String> {
            let raw = arg.ok_or_else(|| format!("'{}' needs a value: {}={}", name, name, what))?;
            raw.parse::<f32>()
                .map_err(|e| format!("bad {} '{}': {}", what, raw, e))
        };

        let op = match name.to_lowercase().as_str() {
            "flip-h" => EditOp::Transform(Transform::FlipHorizontal),
            "flip-v" => EditOp::Transform(Transform::FlipVertical),
            "rotate-cw" => EditOp::Transform(Transform::Rotate90Cw),
            "rotate-ccw" => EditOp::Transform(Transform::Rotate90Ccw),
            "rotate-180" => EditOp::Transform(Transform::Rotate180),
            "invert" => EditOp::Invert,
            "desaturate" => EditOp::Desaturate,
            "blur" => {
                let sigma = number("SIGMA")?;
                if !(sigma >= 0.0) {
                    return Err(format!("blur sigma must be >= 0, got {}", sigma));
                }
                EditOp::Blur(sigma)
            }
            "gain" => {
                let gain = number("X")?;
                if !(gain > 0.0) {
                    return Err(format!("gain must be > 0, got {}", gain));
                }
                EditOp::Gain(gain)
            }
            "resize" => {
                let raw = arg.ok_or("resize needs a size: resize=WxH")?;
                let (w, h) = raw
                    .split_once(['x', 'X'])
                    .ok_or_else(|| format!("bad size '{}', expected WxH", raw))?;
                let w: u32 = w.parse().map_err(|e| format!("bad width '{}': {}", w, e))?;
                let h: u32 = h.parse().map_err(|e| format!("bad height '{}': {}", h, e))?;
                if w == 0 || h == 0 {
                    return Err(format!("size must be non-zero, got {}x{}", w, h));
                }
                EditOp::Resize(w, h)
            }
            "soften" => {
                let raw = arg.ok_or("soften needs parameters: soften=SIGMA@SCALE")?;
                let (sigma, scale) = raw
                    .split_once('@')
                    .ok_or_else(|| format!("bad soften '{}', expected SIGMA@SCALE", raw))?;
                let sigma: f32 = sigma.parse().map_err(|e| format!("bad sigma '{}': {}", sigma, e))?;
                let scale: f32 = scale.parse().map_err(|e| format!("bad scale '{}': {}", scale, e))?;
                if !(sigma >= 0.0) || !(scale > 0.0) {
                    return Err(format!("soften needs sigma >= 0 and scale > 0, got {}", raw));
                }
                EditOp::Soften { sigma, scale }
            }
            other => return Err(format!("unknown op '{}'", other)),
        };
        Ok(op)
    }
}

impl fmt::Display for EditOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditOp::Transform(t) => write!(f, "{}", t.label()),
            EditOp::Blur(sigma) => write!(f, "Gaussian Blur ({})", sigma),
            EditOp::Gain(gain) => write!(f, "Gain ×{}", gain),
            EditOp::Invert => write!(f, "Invert"),
            EditOp::Desaturate => write!(f, "Desaturate"),
            EditOp::Resize(w, h) => write!(f, "Resize to {}×{}", w, h),
            EditOp::Soften { sigma, scale } => write!(f, "Soften ({} @ {})", sigma, scale),
        }
    }
}

impl EditOp {
    /// Queue this operation on `controller`.
    pub fn apply(&self, controller: &mut ImageController) {
        let label = self.to_string();
        match *self {
            EditOp::Transform(t) => controller.modify(label, t.command()),
            EditOp::Blur(sigma) => controller.modify(label, filters::blur_command(BlurParams { sigma })),
            EditOp::Gain(gain) => controller.modify(
                label,
                filters::exposure_command(ExposureParams { stops: gain.log2() }),
            ),
            EditOp::Invert => controller.modify(label, filters::invert_command()),
            EditOp::Desaturate => controller.modify(label, filters::desaturate_command()),
            EditOp::Resize(width, height) => controller.modify(
                label,
                transform::resize_command(ResizeParams {
                    width,
                    height,
                    interpolation: Interpolation::Bilinear,
                }),
            ),
            EditOp::Soften { sigma, scale } => {
                // The target size depends on the image the edit ends up running on.
                let command = snapshot_command(label.clone(), move |img: &Image, p: &AtomicProgress| {
                    let params = filters::SoftenParams {
                        blur: BlurParams { sigma },
                        resize: ResizeParams {
                            width: ((img.width() as f32 * scale).round() as u32).max(1),
                            height: ((img.height() as f32 * scale).round() as u32).max(1),
                            interpolation: Interpolation::Bilinear,
                        },
                    };
                    filters::soften(img, params, p)
                });
                controller.modify(label, command);
            }
        }
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    crate::logger::set_echo(args.verbose);
    if args.verbose {
        crate::logger::set_level(crate::logger::Level::Debug);
    }

    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let format = match parse_format(args.format.as_deref(), args.output.as_deref()) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!(
            "error: could not create output directory '{}': {}",
            dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let settings = EngineSettings::load();
    let save_params = args.save_params();
    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }

        let file_start = Instant::now();

        let Some(output_path) = build_output_path(
            input_path,
            args.output.as_deref(),
            args.output_dir.as_deref(),
            format,
        ) else {
            eprintln!(
                "  error: cannot determine output path for '{}'.",
                input_path.display()
            );
            any_failure = true;
            continue;
        };

        match run_one(
            input_path,
            &output_path,
            &args.ops,
            args.undo,
            &save_params,
            &settings,
            args.verbose,
        ) {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                crate::log_err!("{}: {}", input_path.display(), e);
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if any_failure {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

// ============================================================================
// Per-file processing pipeline
// ============================================================================

fn run_one(
    input: &Path,
    output: &Path,
    ops: &[EditOp],
    undo: usize,
    save_params: &SaveParams,
    settings: &EngineSettings,
    verbose: bool,
) -> Result<(), String> {
    // -- Step 1: Load ----------------------------------------------------
    let mut controller = ImageController::open(input, settings.clone());
    if let DrainOutcome::Failed(e) = drive(&mut controller, "load", verbose) {
        return Err(format!("load failed: {}", e));
    }

    // -- Step 2: Edit ----------------------------------------------------
    for op in ops {
        op.apply(&mut controller);
        let label = op.to_string();
        if let DrainOutcome::Failed(e) = drive(&mut controller, &label, verbose) {
            return Err(format!("{} failed: {}", label, e));
        }
    }

    // -- Step 3: Undo (optional) -----------------------------------------
    let undone = (0..undo).take_while(|_| controller.undo()).count();
    if undone < undo {
        crate::log_warn!("Only {} of {} requested undo step(s) available", undone, undo);
    }
    if verbose && undone > 0 {
        println!("  undid {} edit(s)", undone);
    }

    // -- Step 4: Save ----------------------------------------------------
    controller
        .save(output, save_params)
        .map_err(|e| format!("save failed: {}", e))
}

/// Wait for the pending edit, printing a progress line in verbose mode.
fn drive(controller: &mut ImageController, label: &str, verbose: bool) -> DrainOutcome {
    if !verbose {
        return controller.wait_for_async_result();
    }
    while controller.is_editing() {
        match controller.progress().fraction() {
            Some(f) => eprint!("\r  {} {:>3.0}%", label, f * 100.0),
            None => eprint!("\r  {} …", label),
        }
        let _ = std::io::stderr().flush();
        std::thread::sleep(POLL_INTERVAL);
    }
    eprintln!();
    controller
        .take_finished()
        .unwrap_or(DrainOutcome::NothingPending)
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Choose the output format from `--format` or the `--output` extension.
/// Defaults to PNG when neither is given.
fn parse_format(format_arg: Option<&str>, output: Option<&Path>) -> Result<FileFormat, String> {
    if let Some(f) = format_arg {
        return FileFormat::from_path(Path::new(&format!("out.{}", f))).map_err(|e| e.to_string());
    }
    if let Some(out) = output {
        return FileFormat::from_path(out).map_err(|e| e.to_string());
    }
    Ok(FileFormat::Png)
}

/// Compute the output path for a single input file.
///
/// Priority:
/// 1. `--output` (explicit path, used for single-file input)
/// 2. `--output-dir` (batch directory, derives filename from input stem)
/// 3. Fallback: same directory as input, same stem, new extension
///    (appends `_out` to stem if it would collide with the input path)
fn build_output_path(
    input: &Path,
    output: Option<&Path>,
    output_dir: Option<&Path>,
    format: FileFormat,
) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }

    let ext = format.extension();
    let stem = input.file_stem()?.to_string_lossy().into_owned();

    if let Some(dir) = output_dir {
        return Some(dir.join(format!("{}.{}", stem, ext)));
    }

    let parent = input.parent().unwrap_or(Path::new("."));
    let candidate = parent.join(format!("{}.{}", stem, ext));

    if candidate == input {
        Some(parent.join(format!("{}_out.{}", stem, ext)))
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster;
    use crate::task::Schedule;

    #[test]
    fn parses_every_op() {
        assert_eq!("flip-h".parse(), Ok(EditOp::Transform(Transform::FlipHorizontal)));
        assert_eq!("rotate-ccw".parse(), Ok(EditOp::Transform(Transform::Rotate90Ccw)));
        assert_eq!("blur=2.5".parse(), Ok(EditOp::Blur(2.5)));
        assert_eq!("gain=0.5".parse(), Ok(EditOp::Gain(0.5)));
        assert_eq!("invert".parse(), Ok(EditOp::Invert));
        assert_eq!("resize=640x480".parse(), Ok(EditOp::Resize(640, 480)));
        assert_eq!(
            "soften=1.5@0.5".parse(),
            Ok(EditOp::Soften {
                sigma: 1.5,
                scale: 0.5
            })
        );
    }

    #[test]
    fn rejects_bad_ops() {
        for bad in ["sharpen", "blur", "blur=-1", "gain=0", "resize=10", "resize=0x5", "soften=2"] {
            assert!(bad.parse::<EditOp>().is_err(), "{}", bad);
        }
    }

    #[test]
    fn cli_flags_parse() {
        let args = CliArgs::try_parse_from([
            "lumaedit", "-i", "a.exr", "--op", "flip-v", "--op", "blur=1",
            "--exposure", "-1", "--srgb", "--undo", "1", "-o", "b.png",
        ])
        .unwrap();
        assert_eq!(args.ops.len(), 2);
        assert_eq!(args.undo, 1);
        let params = args.save_params();
        assert_eq!(params.gain, 0.5);
        assert!(params.srgb);
        assert!(!params.dither);
    }

    #[test]
    fn output_path_rules() {
        let input = Path::new("dir/shot.png");
        assert_eq!(
            build_output_path(input, None, Some(Path::new("out")), FileFormat::Exr),
            Some(PathBuf::from("out/shot.exr"))
        );
        assert_eq!(
            build_output_path(input, None, None, FileFormat::Png),
            Some(PathBuf::from("dir/shot_out.png"))
        );
        assert_eq!(parse_format(Some("PFM"), None), Ok(FileFormat::Pfm));
        assert_eq!(parse_format(None, None), Ok(FileFormat::Png));
    }

    #[test]
    fn run_one_edits_undoes_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.pfm");
        let output = dir.path().join("out.pfm");
        let img = raster::from_fn(4, 2, |x, y| [x as f32, y as f32, 1.0, 1.0]);
        crate::io::save_image(&img, &input, &SaveParams::default()).unwrap();

        let settings = EngineSettings {
            schedule: Schedule::Dedicated,
            ..EngineSettings::default()
        };
        let ops = vec![
            EditOp::Transform(Transform::FlipHorizontal),
            EditOp::Gain(2.0),
        ];
        run_one(&input, &output, &ops, 1, &SaveParams::default(), &settings, false).unwrap();

        let saved = crate::io::load_image(&output).unwrap();
        assert_eq!(saved, transform::flipped_horizontal(&img));
    }

    #[test]
    fn run_one_reports_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_one(
            &dir.path().join("missing.exr"),
            &dir.path().join("out.png"),
            &[],
            0,
            &SaveParams::default(),
            &EngineSettings::default(),
            false,
        )
        .unwrap_err();
        assert!(err.starts_with("load failed"), "{}", err);
    }
}
