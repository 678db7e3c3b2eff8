use std::sync::Arc;

use lumaedit::ops::filters::{self, BlurParams, ExposureParams};
use lumaedit::ops::transform::{self, Transform};
use lumaedit::{
    raster, AtomicProgress, DrainOutcome, EngineSettings, Image, ImageController, SaveParams,
    Schedule,
};

fn settings() -> EngineSettings {
    EngineSettings {
        schedule: Schedule::Dedicated,
        ..EngineSettings::default()
    }
}

fn checker() -> Image {
    raster::from_fn(8, 6, |x, y| {
        let v = if (x + y) % 2 == 0 { 4.0 } else { 0.125 };
        [v, v * 0.5, x as f32 / 7.0, 1.0]
    })
}

fn loaded(dir: &tempfile::TempDir) -> ImageController {
    let path = dir.path().join("a.pfm");
    lumaedit::io::save_image(&checker(), &path, &SaveParams::default()).unwrap();
    let mut c = ImageController::open(&path, settings());
    assert_eq!(c.wait_for_async_result(), DrainOutcome::Replaced);
    assert_eq!(c.path(), Some(path.as_path()));
    c
}

#[test]
fn load_flip_blur_then_undo_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = loaded(&dir);
    let a = c.image().clone();
    assert_eq!(a, checker());
    assert!(!c.has_undo());
    assert!(!c.is_modified());

    c.modify("flip", Transform::FlipHorizontal.command());
    c.modify("blur", filters::blur_command(BlurParams { sigma: 1.5 }));
    c.wait_for_async_result();
    let blurred = c.image().clone();
    assert_eq!(c.history().len(), 2);

    assert!(c.undo());
    assert_eq!(*c.image(), transform::flipped_horizontal(&a));
    assert!(c.undo());
    assert_eq!(*c.image(), a);
    assert!(!c.has_undo());
    assert!(c.has_redo());
    // a load starts a fresh, saved history
    assert!(!c.is_modified());

    assert!(c.redo());
    assert!(c.redo());
    assert_eq!(*c.image(), blurred);
    assert!(!c.has_redo());
}

#[test]
fn undo_sequences_are_linear() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = loaded(&dir);
    let edits: Vec<Box<dyn Fn(&mut ImageController)>> = vec![
        Box::new(|c: &mut ImageController| c.modify("rotate", Transform::Rotate90Cw.command())),
        Box::new(|c: &mut ImageController| c.modify("gain", filters::exposure_command(ExposureParams { stops: 1.0 }))),
        Box::new(|c: &mut ImageController| c.modify("invert", filters::invert_command())),
        Box::new(|c: &mut ImageController| c.modify("flip", Transform::FlipVertical.command())),
    ];
    for edit in &edits {
        edit(&mut c);
    }
    let last = c.image().clone();

    for k in 0..=edits.len() {
        for _ in 0..k {
            assert!(c.undo());
        }
        assert_eq!(c.has_redo(), k > 0);
        for _ in 0..k {
            assert!(c.redo());
        }
        assert_eq!(*c.image(), last, "after {} undo/redo pairs", k);
    }
}

#[test]
fn modified_flag_follows_saved_position() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = loaded(&dir);
    c.modify("flip", Transform::FlipVertical.command());
    c.save(dir.path().join("b.exr"), &SaveParams::default()).unwrap();
    assert!(!c.is_modified());

    c.modify("invert", filters::invert_command());
    assert!(c.is_modified());
    assert!(c.undo());
    assert!(!c.is_modified());
    assert!(c.undo());
    assert!(c.is_modified());
    assert_eq!(c.display_title(), "b.exr*");
}

#[test]
fn render_cache_always_shows_the_committed_image() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = loaded(&dir);
    let mut last_generation = 0;
    let commands: Vec<Box<dyn FnOnce(&mut ImageController)>> = vec![
        Box::new(|c: &mut ImageController| c.modify("rotate", Transform::Rotate90Ccw.command())),
        Box::new(|c: &mut ImageController| c.modify("desaturate", filters::desaturate_command())),
        Box::new(|c: &mut ImageController| {
            c.modify("halve", move |img: Arc<Image>, p: &AtomicProgress| {
                let params = transform::ResizeParams {
                    width: img.width() / 2,
                    height: img.height() / 2,
                    interpolation: transform::Interpolation::Nearest,
                };
                transform::resize_command(params)(img, p)
            })
        }),
    ];
    for command in commands {
        command(&mut c);
        let committed = {
            let tex = c.texture();
            assert!(tex.generation() > last_generation);
            last_generation = tex.generation();
            (tex.width(), tex.height(), tex.pixels().to_vec())
        };
        let img = c.committed_image();
        assert_eq!(committed, (img.width(), img.height(), img.as_raw().clone()));
    }
    assert_eq!(c.texture().width(), 3);
}

#[test]
fn corrupt_pfm_load_is_a_failed_drain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huge.pfm");
    std::fs::write(&path, "PF\n200000 200000\n-1.0\n").unwrap();
    let mut c = ImageController::open(&path, settings());
    match c.wait_for_async_result() {
        DrainOutcome::Failed(lumaedit::EditError::Decode { .. }) => {}
        other => panic!("expected a decode failure, got {:?}", other),
    }
    assert!(c.is_null());
    assert_eq!(c.path(), None);
}
