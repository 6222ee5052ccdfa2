//! End-to-end tests of the counting pipeline with a scripted engine.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use image::DynamicImage;

use cytoseg::config::{CountOptions, SizePolicy};
use cytoseg::detection::BoundingBox;
use cytoseg::engine::{DenseInstance, DenseOutput, InferenceEngine, RawOutput};
use cytoseg::segmenter::Segmenter;

const IMAGE_SIZE: u32 = 100;

/// Engine that replays scripted instances and counts how often the
/// expensive inference path is taken.
struct ScriptedEngine {
    instances: Vec<DenseInstance>,
    calls: Rc<RefCell<usize>>,
}

impl ScriptedEngine {
    fn new(instances: Vec<DenseInstance>) -> (Self, Rc<RefCell<usize>>) {
        let calls = Rc::new(RefCell::new(0));
        (
            Self {
                instances,
                calls: Rc::clone(&calls),
            },
            calls,
        )
    }
}

impl InferenceEngine for ScriptedEngine {
    fn infer(&mut self, _image_path: &Path) -> Result<RawOutput> {
        *self.calls.borrow_mut() += 1;
        Ok(RawOutput::Dense(DenseOutput {
            instances: self.instances.clone(),
            image: DynamicImage::ImageRgb8(image::RgbImage::new(IMAGE_SIZE, IMAGE_SIZE)),
        }))
    }

    fn default_min_score(&self) -> f32 {
        0.05
    }
}

/// Instance with a normalized box whose denormalized extent is
/// `extent` pixels.
fn instance(confidence: f32, extent: f32) -> DenseInstance {
    let side = extent / IMAGE_SIZE as f32;
    DenseInstance {
        bbox: BoundingBox::new(0.0, 0.0, side, side / 2.0),
        mask: None,
        confidence,
        class_id: 0,
    }
}

fn wide_open_policy() -> SizePolicy {
    SizePolicy::new(0.0, f32::INFINITY)
}

fn options_in(dir: &tempfile::TempDir) -> CountOptions {
    CountOptions {
        overlay_path: dir.path().join("overlay.png"),
        ..Default::default()
    }
}

fn image_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("field.png")
}

#[test]
fn test_repeated_counts_run_inference_once() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, calls) = ScriptedEngine::new(vec![instance(0.9, 50.0), instance(0.3, 30.0)]);
    let mut segmenter = Segmenter::new(engine, wide_open_policy());

    let path = image_path(&dir);
    let mut options = options_in(&dir);

    segmenter.count(&path, &options).unwrap();

    // Different threshold, same image: the cache must absorb the call.
    options.min_score = Some(0.5);
    let second = segmenter.count(&path, &options).unwrap().unwrap();

    assert_eq!(*calls.borrow(), 1);
    assert_eq!(second.len(), 1);
}

#[test]
fn test_confidence_threshold_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![
        instance(0.1, 50.0),
        instance(0.3, 50.0),
        instance(0.9, 50.0),
    ]);
    let mut segmenter = Segmenter::new(engine, wide_open_policy());

    let options = CountOptions {
        min_score: Some(0.2),
        ..options_in(&dir)
    };
    let table = segmenter.count(&image_path(&dir), &options).unwrap().unwrap();

    assert_eq!(table.len(), 2);
}

#[test]
fn test_confidence_exactly_at_cutoff_is_retained() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![instance(0.2, 50.0)]);
    let mut segmenter = Segmenter::new(engine, wide_open_policy());

    let options = CountOptions {
        min_score: Some(0.2),
        ..options_in(&dir)
    };
    let table = segmenter.count(&image_path(&dir), &options).unwrap().unwrap();

    assert_eq!(table.len(), 1);
}

#[test]
fn test_default_min_score_comes_from_engine() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![instance(0.01, 50.0), instance(0.5, 50.0)]);
    let mut segmenter = Segmenter::new(engine, wide_open_policy());

    let table = segmenter
        .count(&image_path(&dir), &options_in(&dir))
        .unwrap()
        .unwrap();

    // Engine default of 0.05 drops the 0.01 row
    assert_eq!(table.len(), 1);
}

#[test]
fn test_size_policy_bounds_applied() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![
        instance(0.9, 5.0),
        instance(0.9, 15.0),
        instance(0.9, 60.0),
    ]);
    let mut segmenter = Segmenter::new(engine, SizePolicy::new(10.0, 50.0));

    let table = segmenter
        .count(&image_path(&dir), &options_in(&dir))
        .unwrap()
        .unwrap();

    assert_eq!(table.len(), 1);
    assert!((table.rows[0].bbox.extent() - 15.0).abs() < 1e-3);
}

#[test]
fn test_zero_survivors_returns_none_and_no_overlay_file() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![instance(0.9, 500.0)]);
    // Nothing fits in [1, 10]
    let mut segmenter = Segmenter::new(engine, SizePolicy::new(1.0, 10.0));

    let options = options_in(&dir);
    // A stale overlay from an earlier call must not survive either
    std::fs::write(&options.overlay_path, b"stale").unwrap();

    let result = segmenter.count(&image_path(&dir), &options).unwrap();

    assert!(result.is_none());
    assert!(!options.overlay_path.exists());
}

#[test]
fn test_overlay_written_when_rows_survive() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![instance(0.9, 50.0)]);
    let mut segmenter = Segmenter::new(engine, wide_open_policy());

    let options = options_in(&dir);
    let result = segmenter.count(&image_path(&dir), &options).unwrap();

    assert!(result.is_some());
    assert!(options.overlay_path.exists());
}

#[test]
fn test_render_can_be_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![instance(0.9, 50.0)]);
    let mut segmenter = Segmenter::new(engine, wide_open_policy());

    let options = CountOptions {
        render: false,
        ..options_in(&dir)
    };
    let result = segmenter.count(&image_path(&dir), &options).unwrap();

    assert!(result.is_some());
    assert!(!options.overlay_path.exists());
}

#[test]
fn test_set_size_signal_fires_once_with_full_box_set() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![
        instance(0.1, 50.0),
        instance(0.3, 50.0),
        instance(0.9, 50.0),
    ]);

    let events: Rc<RefCell<Vec<(String, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    let policy = SizePolicy::new(0.0, f32::INFINITY).with_signal(Box::new(move |event, boxes| {
        sink.borrow_mut().push((event.to_string(), boxes.len()));
    }));

    let mut segmenter = Segmenter::new(engine, policy);
    let path = image_path(&dir);
    let options = options_in(&dir);

    segmenter.count(&path, &options).unwrap();
    segmenter.count(&path, &options).unwrap();

    let events = events.borrow();
    // Once per fresh inference, with the unfiltered box set
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], ("set_size".to_string(), 3));
}

#[test]
fn test_counting_other_image_requires_reset() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, calls) = ScriptedEngine::new(vec![instance(0.9, 50.0)]);
    let mut segmenter = Segmenter::new(engine, wide_open_policy());

    let options = options_in(&dir);
    let first = dir.path().join("first.png");
    let second = dir.path().join("second.png");

    segmenter.count(&first, &options).unwrap();
    assert!(segmenter.is_cached());

    // Stale cache misuse surfaces as an error, not silent wrong results
    let err = segmenter.count(&second, &options).unwrap_err();
    assert!(err.to_string().contains("reset"));
    assert_eq!(*calls.borrow(), 1);

    segmenter.reset();
    assert!(!segmenter.is_cached());
    segmenter.count(&second, &options).unwrap();
    assert_eq!(*calls.borrow(), 2);
}

#[test]
fn test_returned_boxes_are_in_pixel_units() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = ScriptedEngine::new(vec![instance(0.9, 50.0)]);
    let mut segmenter = Segmenter::new(engine, wide_open_policy());

    let table = segmenter
        .count(&image_path(&dir), &options_in(&dir))
        .unwrap()
        .unwrap();

    let b = table.rows[0].bbox;
    assert!((b.x2 - 50.0).abs() < 1e-3);
    assert!(b.x1 >= 0.0 && b.x2 <= IMAGE_SIZE as f32);
    assert!(b.y1 >= 0.0 && b.y2 <= IMAGE_SIZE as f32);
    assert_eq!(table.image_width, IMAGE_SIZE);
    assert_eq!(table.image_height, IMAGE_SIZE);
}
