//! digitread-pipeline: Handwritten digit recognition (sans-IO).
//!
//! Turns an uploaded photo of handwritten digits into a digit string:
//! decode -> filter (scale, grayscale, contrast, binarize, sharpen) ->
//! segment into glyphs -> classify each glyph with a small CNN.
//!
//! The classifier lives in a [`ModelCache`] that loads persisted weights
//! through a [`ModelStore`] or trains them from a [`DatasetSource`] the
//! first time it is needed. [`Recognizer`] drives a request end to end
//! with progress reporting and cooperative cancellation.
//!
//! This crate has **no I/O dependencies**: it works on in-memory bytes
//! and rasters. Filesystem stores and dataset loading live in
//! `digitread-io`.

pub mod cache;
pub mod classify;
pub mod dataset;
pub mod diagnostics;
pub mod filter;
pub mod network;
pub mod recognize;
pub mod segment;
pub mod store;
pub mod train;
pub mod types;

pub use cache::{ModelCache, ModelHandle, ModelStatus};
pub use classify::{DigitClassifier, PatchTensor};
pub use dataset::{Dataset, DatasetError, DatasetSource, LabelEncoding, LabeledSample, SpriteLayout};
pub use diagnostics::RecognitionDiagnostics;
pub use network::{DigitModel, DigitNet, InferenceBackend, ModelFormatError};
pub use recognize::{CancellationToken, NoProgress, Progress, ProgressSink, Recognizer, Stage};
pub use segment::{Segmentation, Segmenter};
pub use store::{MODEL_KEY, MemoryModelStore, ModelStore, StoreError};
pub use train::{TrainingBackend, TrainingConfig, TrainingError, TrainingReport};
pub use types::{
    BoundingBox, DigitPrediction, FilterConfig, HandwritingResult, RecognitionError,
    RecognizedDigit, RecognizerConfig, RgbaImage, SegmentedDigit,
};
