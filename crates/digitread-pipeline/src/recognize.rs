//! End-to-end recognition of an uploaded image.
//!
//! [`Recognizer::recognize`] drives one request through model readiness,
//! preprocessing, segmentation, and per-glyph classification. Progress is
//! reported inline to a [`ProgressSink`]; a [`CancellationToken`] is
//! checked between stages and between glyphs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{ModelCache, ModelStatus};
use crate::classify::{self, DigitClassifier};
use crate::diagnostics::{RecognitionDiagnostics, RecognitionSummary, StageDiagnostics, StageMetrics};
use crate::filter;
use crate::segment::{self, Segmenter};
use crate::types::{
    DigitPrediction, HandwritingResult, RecognitionError, RecognizedDigit, RecognizerConfig,
    SegmentedDigit,
};

const MODEL_START: u8 = 10;
const MODEL_DONE: u8 = 25;
const PREPROCESS_DONE: u8 = 45;
const SEGMENT_START: u8 = 55;
const CLASSIFY_SPAN: u8 = 40;
const CLASSIFY_DONE: u8 = SEGMENT_START + CLASSIFY_SPAN;
const COMPLETE: u8 = 100;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Not started.
    Idle,
    /// Waiting for the classifier to load or train.
    LoadingModel,
    /// Decoding and filtering the upload.
    Preprocessing,
    /// Reading back the filtered pixels and counting foreground.
    Decoding,
    /// Isolating glyphs.
    Segmenting,
    /// Classifying glyph `index` (zero-based) of `total`.
    ClassifyingDigits {
        /// Glyph being classified.
        index: usize,
        /// Number of glyphs.
        total: usize,
    },
    /// Finished with a result.
    Done,
    /// Finished with an error.
    Failed,
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Completion in percent, never decreasing within a request.
    pub percent: u8,
    /// Current stage.
    pub stage: Stage,
    /// Short human-readable status line.
    pub status: String,
}

/// Receives progress notifications.
pub trait ProgressSink {
    /// Called at every stage transition.
    fn report(&mut self, progress: Progress);
}

impl<F: FnMut(Progress)> ProgressSink for F {
    fn report(&mut self, progress: Progress) {
        self(progress);
    }
}

/// A [`ProgressSink`] that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _: Progress) {}
}

/// Cooperative cancellation flag shared between a request and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next checkpoint.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Forwards progress to a sink while keeping the percentage monotonic.
struct Tracker<'s, S: ProgressSink + ?Sized> {
    sink: &'s mut S,
    percent: u8,
}

impl<'s, S: ProgressSink + ?Sized> Tracker<'s, S> {
    const fn new(sink: &'s mut S) -> Self {
        Self { sink, percent: 0 }
    }

    fn emit(&mut self, percent: u8, stage: Stage, status: impl Into<String>) {
        self.percent = self.percent.max(percent.min(COMPLETE));
        self.sink.report(Progress {
            percent: self.percent,
            stage,
            status: status.into(),
        });
    }
}

/// Recognizes handwritten digits using a shared [`ModelCache`].
#[derive(Debug)]
pub struct Recognizer<'a> {
    cache: &'a ModelCache,
    config: RecognizerConfig,
}

impl<'a> Recognizer<'a> {
    /// A recognizer using `cache` and `config`.
    #[must_use]
    pub const fn new(cache: &'a ModelCache, config: RecognizerConfig) -> Self {
        Self { cache, config }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    /// Recognize the digits in an encoded image.
    ///
    /// Returns `Ok(None)` if `cancel` fired; nothing computed so far is
    /// returned. On error a [`Stage::Failed`] event carrying the message
    /// is reported before returning.
    ///
    /// # Errors
    ///
    /// - [`RecognitionError::ModelUnavailable`] if the classifier cannot
    ///   be made ready.
    /// - [`RecognitionError::DecodeFailed`] for unusable bytes.
    /// - [`RecognitionError::InvalidConfig`] or
    ///   [`RecognitionError::UnsupportedSurface`] from preprocessing or
    ///   segmentation.
    /// - [`RecognitionError::NoDigitsDetected`] if the filtered raster has
    ///   no foreground pixels or segmentation finds no glyphs.
    pub fn recognize<S: ProgressSink + ?Sized>(
        &self,
        bytes: &[u8],
        progress: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Option<HandwritingResult>, RecognitionError> {
        let mut tracker = Tracker::new(progress);
        let result = self.run(bytes, &mut tracker, cancel);
        match &result {
            Ok(Some(_)) => {}
            Ok(None) => log::debug!("recognition cancelled"),
            Err(e) => {
                log::debug!("recognition failed: {e}");
                tracker.emit(tracker.percent, Stage::Failed, e.to_string());
            }
        }
        result
    }

    fn run<S: ProgressSink + ?Sized>(
        &self,
        bytes: &[u8],
        tracker: &mut Tracker<'_, S>,
        cancel: &CancellationToken,
    ) -> Result<Option<HandwritingResult>, RecognitionError> {
        let started = web_time::Instant::now();

        // Model
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let t = web_time::Instant::now();
        let cached = self.cache.status() == ModelStatus::Ready;
        tracker.emit(MODEL_START, Stage::LoadingModel, "loading recognition model");
        let model = self.cache.ensure_ready()?;
        tracker.emit(MODEL_DONE, Stage::LoadingModel, "recognition model ready");
        let model_stage = StageDiagnostics {
            duration: t.elapsed(),
            metrics: StageMetrics::Model { cached },
        };

        // Decode and filter
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let t = web_time::Instant::now();
        tracker.emit(MODEL_DONE, Stage::Preprocessing, "preprocessing image");
        let decoded = filter::decode(bytes)?;
        let (input_width, input_height) = decoded.dimensions();
        let preprocessed = filter::preprocess(decoded, &self.config.filter)?;

        // Read back the filtered pixels; a raster without ink cannot hold digits.
        tracker.emit(PREPROCESS_DONE, Stage::Decoding, "reading preprocessed pixels");
        let (output_width, output_height) = preprocessed.dimensions();
        let foreground_pixels = segment::foreground_pixels(&preprocessed);
        log::debug!("{foreground_pixels} foreground pixels in {output_width}x{output_height}");
        if foreground_pixels == 0 {
            return Err(RecognitionError::NoDigitsDetected);
        }
        let preprocess_stage = StageDiagnostics {
            duration: t.elapsed(),
            metrics: StageMetrics::Preprocess {
                input_bytes: bytes.len(),
                input_width,
                input_height,
                output_width,
                output_height,
                foreground_pixels,
            },
        };

        // Segment
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let t = web_time::Instant::now();
        tracker.emit(SEGMENT_START, Stage::Segmenting, "finding digits");
        let glyphs = self.config.segmentation.segment(&preprocessed)?;
        if glyphs.is_empty() {
            return Err(RecognitionError::NoDigitsDetected);
        }
        log::debug!("segmented {} glyphs", glyphs.len());
        let segment_stage = StageDiagnostics {
            duration: t.elapsed(),
            metrics: StageMetrics::Segment {
                strategy: self.config.segmentation,
                glyph_count: glyphs.len(),
            },
        };

        // Classify
        let t = web_time::Instant::now();
        let Some(digits) = classify_glyphs(&model, &glyphs, tracker, cancel) else {
            return Ok(None);
        };
        let failed_count = digits.iter().filter(|d| d.prediction.digit.is_none()).count();
        let classify_stage = StageDiagnostics {
            duration: t.elapsed(),
            metrics: StageMetrics::Classify {
                glyph_count: digits.len(),
                failed_count,
                mean_confidence: mean_confidence(&digits),
            },
        };

        let combined_text: String = digits.iter().map(|d| d.prediction.symbol()).collect();
        let total_duration = started.elapsed();
        let diagnostics = RecognitionDiagnostics {
            model: model_stage,
            preprocess: preprocess_stage,
            segment: segment_stage,
            classify: classify_stage,
            total_duration,
            summary: RecognitionSummary {
                image_width: input_width,
                image_height: input_height,
                glyph_count: digits.len(),
                failed_glyph_count: failed_count,
            },
        };

        tracker.emit(COMPLETE, Stage::Done, format!("recognized {combined_text}"));
        Ok(Some(HandwritingResult {
            digits,
            combined_text,
            processing_time_ms: millis(total_duration),
            preprocessed_image: preprocessed,
            diagnostics,
        }))
    }
}

/// Classify glyphs in order, reporting progress across the classify span.
///
/// A glyph whose inference fails gets [`DigitPrediction::unrecognized`].
/// Returns `None` if cancelled before any glyph.
fn classify_glyphs<C, S>(
    model: &C,
    glyphs: &[SegmentedDigit],
    tracker: &mut Tracker<'_, S>,
    cancel: &CancellationToken,
) -> Option<Vec<RecognizedDigit>>
where
    C: DigitClassifier + ?Sized,
    S: ProgressSink + ?Sized,
{
    let total = glyphs.len();
    let mut digits = Vec::with_capacity(total);

    for (index, glyph) in glyphs.iter().enumerate() {
        if cancel.is_cancelled() {
            return None;
        }
        tracker.emit(
            classify_percent(index, total),
            Stage::ClassifyingDigits { index, total },
            format!("recognizing digit {} of {total}", index + 1),
        );
        let prediction = classify::classify(model, &glyph.patch).unwrap_or_else(|e| {
            log::warn!("glyph {index} at {:?} could not be classified: {e}", glyph.bbox);
            DigitPrediction::unrecognized()
        });
        digits.push(RecognizedDigit {
            prediction,
            bbox: glyph.bbox,
        });
    }

    tracker.emit(
        CLASSIFY_DONE,
        Stage::ClassifyingDigits {
            index: total.saturating_sub(1),
            total,
        },
        "digits recognized",
    );
    Some(digits)
}

/// Percent reported before classifying glyph `index` of `total`.
fn classify_percent(index: usize, total: usize) -> u8 {
    let step = usize::from(CLASSIFY_SPAN) * index / total.max(1);
    SEGMENT_START.saturating_add(u8::try_from(step).unwrap_or(CLASSIFY_SPAN))
}

#[allow(clippy::cast_precision_loss)]
fn mean_confidence(digits: &[RecognizedDigit]) -> f32 {
    let recognized: Vec<f32> = digits
        .iter()
        .filter(|d| d.prediction.digit.is_some())
        .map(|d| d.prediction.confidence)
        .collect();
    if recognized.is_empty() {
        0.0
    } else {
        recognized.iter().sum::<f32>() / recognized.len() as f32
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
