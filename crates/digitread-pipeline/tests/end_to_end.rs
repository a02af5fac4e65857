//! Integration test: draw digits, encode them as PNG, and run them through
//! the full recognizer with a freshly trained model.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use digitread_pipeline::classify::PATCH_PIXELS;
use digitread_pipeline::{
    CancellationToken, Dataset, LabeledSample, MemoryModelStore, ModelCache, ModelStatus,
    NoProgress, PatchTensor, Progress, RecognitionError, Recognizer, RecognizerConfig, RgbaImage,
    Stage, TrainingConfig,
};
use image::Rgba;
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

const INK: Rgba<u8> = Rgba([20, 20, 20, 255]);
const PAPER: Rgba<u8> = Rgba([255, 255, 255, 255]);
const STROKE: u32 = 3;

/// Seven-segment style strokes for a digit in a 15x30 cell at `x0`.
fn draw_digit(img: &mut RgbaImage, digit: u8, x0: i32, y0: i32) {
    let (w, h) = (15, 30);
    let s = STROKE;
    let top = Rect::at(x0, y0).of_size(w, s);
    let middle = Rect::at(x0, y0 + 14).of_size(w, s);
    let bottom = Rect::at(x0, y0 + 27).of_size(w, s);
    let upper_right = Rect::at(x0 + 12, y0).of_size(s, 17);
    let lower_right = Rect::at(x0 + 12, y0 + 14).of_size(s, 16);
    let lower_left = Rect::at(x0, y0 + 14).of_size(s, 16);
    let full_right = Rect::at(x0 + 12, y0).of_size(s, h);

    let strokes = match digit {
        1 => vec![Rect::at(x0 + 5, y0).of_size(5, h)],
        2 => vec![top, upper_right, middle, lower_left, bottom],
        3 => vec![top, middle, bottom, full_right],
        _ => vec![top, upper_right, lower_right, bottom, lower_left],
    };
    for r in strokes {
        draw_filled_rect_mut(img, r, INK);
    }
}

fn encode_png(img: &RgbaImage) -> Vec<u8> {
    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    image::ImageEncoder::write_image(
        encoder,
        img.as_raw(),
        img.width(),
        img.height(),
        image::ExtendedColorType::Rgba8,
    )
    .unwrap();
    buf
}

fn one_two_three_png() -> Vec<u8> {
    let mut img = RgbaImage::from_pixel(110, 50, PAPER);
    for (i, digit) in [1u8, 2, 3].into_iter().enumerate() {
        let x = 10 + 35 * i32::try_from(i).unwrap();
        draw_digit(&mut img, digit, x, 10);
    }
    encode_png(&img)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A tiny training set: flat patches whose brightness encodes the label.
fn tiny_dataset() -> Dataset {
    let samples = (0..20)
        .map(|i| {
            let label = u8::try_from(i % 10).unwrap();
            let values = vec![f32::from(label) / 9.0; PATCH_PIXELS];
            LabeledSample {
                input: PatchTensor::from_values(&values).unwrap(),
                label,
            }
        })
        .collect();
    Dataset::new(samples)
}

fn cache() -> ModelCache {
    init_logging();
    let training = TrainingConfig {
        batch_size: 10,
        sample_limit: 20,
        ..TrainingConfig::default()
    };
    ModelCache::new(
        Arc::new(MemoryModelStore::new()),
        Arc::new(tiny_dataset()),
        training,
    )
}

#[test]
fn three_drawn_digits_yield_three_glyphs_in_order() {
    let cache = cache();
    let recognizer = Recognizer::new(&cache, RecognizerConfig::default());
    let mut events: Vec<Progress> = Vec::new();

    let result = recognizer
        .recognize(
            &one_two_three_png(),
            &mut |p: Progress| events.push(p),
            &CancellationToken::new(),
        )
        .unwrap()
        .expect("not cancelled");

    assert_eq!(result.digits.len(), 3, "{:?}", result.digits);
    assert_eq!(result.combined_text.chars().count(), 3);
    assert!(
        result
            .digits
            .windows(2)
            .all(|w| w[0].bbox.x < w[1].bbox.x)
    );
    for d in &result.digits {
        assert!((0.0..=100.0).contains(&d.prediction.confidence));
        let sum: f32 = d.prediction.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3);
    }

    assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
    assert_eq!(events.last().unwrap().stage, Stage::Done);

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["digits"].as_array().unwrap().len(), 3);
    assert_eq!(json["combined_text"], result.combined_text.as_str());
}

#[test]
fn blank_page_has_no_digits() {
    let cache = cache();
    let recognizer = Recognizer::new(&cache, RecognizerConfig::default());
    let blank = encode_png(&RgbaImage::from_pixel(80, 40, PAPER));

    let err = recognizer
        .recognize(&blank, &mut NoProgress, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, RecognitionError::NoDigitsDetected));
}

#[test]
fn disposed_model_refuses_to_classify() {
    let cache = cache();
    cache.ensure_ready().unwrap();
    cache.dispose();

    let patch = RgbaImage::from_pixel(28, 28, INK);
    assert!(matches!(
        cache.classify(&patch),
        Err(RecognitionError::ModelUnavailable(_))
    ));
    assert_eq!(cache.status(), ModelStatus::Absent);
}

#[test]
fn concurrent_requests_share_the_model_and_agree() {
    let cache = cache();
    let png = one_two_three_png();

    let texts: Vec<String> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    Recognizer::new(&cache, RecognizerConfig::default())
                        .recognize(&png, &mut NoProgress, &CancellationToken::new())
                        .unwrap()
                        .unwrap()
                        .combined_text
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(texts[0], texts[1]);
    assert!(cache.last_training_report().is_some());
}

#[test]
fn cancellation_mid_classification_discards_work() {
    let cache = cache();
    let recognizer = Recognizer::new(&cache, RecognizerConfig::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut saw_done = false;

    let result = recognizer
        .recognize(
            &one_two_three_png(),
            &mut |p: Progress| match p.stage {
                Stage::ClassifyingDigits { index: 1, .. } => trigger.cancel(),
                Stage::Done => saw_done = true,
                _ => {}
            },
            &cancel,
        )
        .unwrap();

    assert!(result.is_none());
    assert!(!saw_done);
}
