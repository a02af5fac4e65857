//! Shared types for the digitread recognition pipeline.

use serde::{Deserialize, Serialize};

use crate::diagnostics::RecognitionDiagnostics;
use crate::segment::Segmentation;

/// Re-export `RgbaImage` so downstream crates can pass rasters around
/// without depending on `image` directly.
///
/// Every pipeline stage consumes or produces one of these; the
/// `len == width * height * 4` invariant is upheld by the `image` crate.
pub use image::RgbaImage;

/// Re-export `GrayImage` for single-channel intermediates (dataset
/// sprites, normalized patches).
pub use image::GrayImage;

/// Number of output classes of the digit classifier.
pub const CLASS_COUNT: usize = 10;

/// Axis-aligned rectangle in the coordinates of the segmented raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge (pixels from the left of the raster).
    pub x: u32,
    /// Top edge (pixels from the top of the raster).
    pub y: u32,
    /// Width in pixels. Always greater than zero.
    pub width: u32,
    /// Height in pixels. Always greater than zero.
    pub height: u32,
}

impl BoundingBox {
    /// Create a new bounding box.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Area in pixels.
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Grow the box by `padding` on every side, clamped to a
    /// `limit_width` x `limit_height` raster.
    #[must_use]
    pub fn padded(&self, padding: u32, limit_width: u32, limit_height: u32) -> Self {
        let x = self.x.saturating_sub(padding);
        let y = self.y.saturating_sub(padding);
        let right = (self.x + self.width).saturating_add(padding).min(limit_width);
        let bottom = (self.y + self.height)
            .saturating_add(padding)
            .min(limit_height);
        Self {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }
}

/// One glyph isolated by the segmenter.
#[derive(Debug, Clone)]
pub struct SegmentedDigit {
    /// Padded, clamped region of the source raster this glyph came from.
    pub bbox: BoundingBox,
    /// Square, white-background patch with the glyph centered.
    pub patch: RgbaImage,
}

/// Classifier output for a single glyph.
///
/// `digit` is `None` when the glyph could not be classified. Such a
/// prediction has zero confidence and a uniform distribution, so
/// `probabilities` always sums to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitPrediction {
    /// Predicted class, serialized as `-1` when unrecognized.
    #[serde(with = "digit_serde")]
    pub digit: Option<u8>,
    /// Probability of the predicted class as a percentage (0 to 100).
    pub confidence: f32,
    /// Full softmax distribution over the ten classes.
    pub probabilities: [f32; CLASS_COUNT],
}

impl DigitPrediction {
    /// Prediction recorded for a glyph whose inference failed.
    #[must_use]
    pub const fn unrecognized() -> Self {
        Self {
            digit: None,
            confidence: 0.0,
            probabilities: [0.1; CLASS_COUNT],
        }
    }

    /// Character for this prediction: the digit itself or `?`.
    #[must_use]
    pub fn symbol(&self) -> char {
        self.digit
            .and_then(|d| char::from_digit(u32::from(d), 10))
            .unwrap_or('?')
    }
}

/// Serde support for `Option<u8>` digits using `-1` as the sentinel.
mod digit_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(digit: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        digit.map_or(-1, i16::from).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
        let raw = i16::deserialize(deserializer)?;
        match raw {
            -1 => Ok(None),
            0..=9 => Ok(u8::try_from(raw).ok()),
            other => Err(serde::de::Error::custom(format!(
                "digit must be -1 or in 0..=9, got {other}"
            ))),
        }
    }
}

/// A prediction paired with where its glyph was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedDigit {
    /// Classifier output.
    pub prediction: DigitPrediction,
    /// Region of the preprocessed raster holding the glyph.
    pub bbox: BoundingBox,
}

/// Pixel filter settings for [`crate::filter::preprocess`].
///
/// The [`Default`] is the preset tuned for handwritten digits on a light
/// background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Upscale factor applied before any other step. Must be positive.
    pub scale: f32,
    /// Replace color with BT.601 luma.
    pub grayscale: bool,
    /// Contrast multiplier around mid-gray. Must be non-negative.
    pub contrast: f32,
    /// Brightness multiplier applied after contrast. Must be non-negative.
    pub brightness: f32,
    /// Apply a mild secondary contrast/brightness boost last.
    pub sharpen: bool,
    /// Binarization threshold; `None` leaves intensities continuous.
    pub threshold: Option<u8>,
}

impl FilterConfig {
    /// Default upscale factor.
    pub const DEFAULT_SCALE: f32 = 3.0;
    /// Default contrast multiplier.
    pub const DEFAULT_CONTRAST: f32 = 2.5;
    /// Default brightness multiplier.
    pub const DEFAULT_BRIGHTNESS: f32 = 1.2;
    /// Default binarization threshold.
    pub const DEFAULT_THRESHOLD: u8 = 140;

    /// Check the numeric invariants.
    ///
    /// # Errors
    ///
    /// Returns [`RecognitionError::InvalidConfig`] when `scale` is not a
    /// positive finite number or when `contrast`/`brightness` are
    /// negative or non-finite.
    pub fn validate(&self) -> Result<(), RecognitionError> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(RecognitionError::InvalidConfig(format!(
                "scale must be positive and finite, got {}",
                self.scale
            )));
        }
        if !self.contrast.is_finite() || self.contrast < 0.0 {
            return Err(RecognitionError::InvalidConfig(format!(
                "contrast must be non-negative, got {}",
                self.contrast
            )));
        }
        if !self.brightness.is_finite() || self.brightness < 0.0 {
            return Err(RecognitionError::InvalidConfig(format!(
                "brightness must be non-negative, got {}",
                self.brightness
            )));
        }
        Ok(())
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            scale: Self::DEFAULT_SCALE,
            grayscale: true,
            contrast: Self::DEFAULT_CONTRAST,
            brightness: Self::DEFAULT_BRIGHTNESS,
            sharpen: false,
            threshold: Some(Self::DEFAULT_THRESHOLD),
        }
    }
}

/// Configuration for a [`crate::recognize::Recognizer`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Preprocessing applied to the decoded upload.
    pub filter: FilterConfig,
    /// How glyphs are isolated from the preprocessed raster.
    pub segmentation: Segmentation,
}

/// Final output of a recognition request.
///
/// Does not derive `Serialize` directly because `RgbaImage` has no serde
/// support; see the manual impl below, which writes the preprocessed
/// raster as a `(width, height, raw_pixels)` tuple.
#[derive(Debug, Clone)]
pub struct HandwritingResult {
    /// Recognized glyphs in left-to-right order.
    pub digits: Vec<RecognizedDigit>,
    /// One character per glyph; `?` marks an unrecognized glyph.
    pub combined_text: String,
    /// Wall-clock duration of the whole request.
    pub processing_time_ms: u64,
    /// The raster that was fed to segmentation.
    pub preprocessed_image: RgbaImage,
    /// Per-stage timings and counts.
    pub diagnostics: RecognitionDiagnostics,
}

#[derive(Serialize)]
struct HandwritingResultProxy<'a> {
    digits: &'a [RecognizedDigit],
    combined_text: &'a str,
    processing_time_ms: u64,
    preprocessed_image: (u32, u32, &'a [u8]),
    diagnostics: &'a RecognitionDiagnostics,
}

impl Serialize for HandwritingResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        HandwritingResultProxy {
            digits: &self.digits,
            combined_text: &self.combined_text,
            processing_time_ms: self.processing_time_ms,
            preprocessed_image: (
                self.preprocessed_image.width(),
                self.preprocessed_image.height(),
                self.preprocessed_image.as_raw(),
            ),
            diagnostics: &self.diagnostics,
        }
        .serialize(serializer)
    }
}

/// Errors that can occur while recognizing digits.
#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    /// No raster surface of the requested size could be allocated.
    #[error("unable to allocate a drawing surface of {width}x{height}")]
    UnsupportedSurface {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// The input image is empty, malformed, or in an unsupported format.
    #[error("failed to decode image: {0}")]
    DecodeFailed(#[from] image::ImageError),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The classifier could be neither loaded nor trained, or is not
    /// initialized.
    #[error("digit model unavailable: {0}")]
    ModelUnavailable(String),

    /// Segmentation found nothing that looks like a digit.
    #[error(
        "no digits detected; try a darker pen, a plainer background, or a tighter crop"
    )]
    NoDigitsDetected,

    /// A single forward pass failed.
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Serde-compatible proxy for `RecognitionError`.
///
/// `image::ImageError` does not implement serde, so `DecodeFailed`
/// carries its `Display` string.
#[derive(Serialize, Deserialize)]
enum RecognitionErrorProxy {
    UnsupportedSurface { width: u32, height: u32 },
    DecodeFailed(String),
    InvalidConfig(String),
    ModelUnavailable(String),
    NoDigitsDetected,
    InferenceFailed(String),
}

impl Serialize for RecognitionError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::UnsupportedSurface { width, height } => RecognitionErrorProxy::UnsupportedSurface {
                width: *width,
                height: *height,
            },
            Self::DecodeFailed(e) => RecognitionErrorProxy::DecodeFailed(e.to_string()),
            Self::InvalidConfig(s) => RecognitionErrorProxy::InvalidConfig(s.clone()),
            Self::ModelUnavailable(s) => RecognitionErrorProxy::ModelUnavailable(s.clone()),
            Self::NoDigitsDetected => RecognitionErrorProxy::NoDigitsDetected,
            Self::InferenceFailed(s) => RecognitionErrorProxy::InferenceFailed(s.clone()),
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RecognitionError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = RecognitionErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            RecognitionErrorProxy::UnsupportedSurface { width, height } => {
                Self::UnsupportedSurface { width, height }
            }
            // The typed image error cannot be rebuilt; keep the message.
            RecognitionErrorProxy::DecodeFailed(msg) => Self::DecodeFailed(
                image::ImageError::Decoding(image::error::DecodingError::new(
                    image::error::ImageFormatHint::Unknown,
                    msg,
                )),
            ),
            RecognitionErrorProxy::InvalidConfig(s) => Self::InvalidConfig(s),
            RecognitionErrorProxy::ModelUnavailable(s) => Self::ModelUnavailable(s),
            RecognitionErrorProxy::NoDigitsDetected => Self::NoDigitsDetected,
            RecognitionErrorProxy::InferenceFailed(s) => Self::InferenceFailed(s),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn padded_box_clamps_to_raster() {
        let bbox = BoundingBox::new(2, 3, 10, 10);
        let padded = bbox.padded(5, 14, 100);
        assert_eq!(padded, BoundingBox::new(0, 0, 14, 18));
    }

    #[test]
    fn padded_box_grows_on_every_side() {
        let bbox = BoundingBox::new(20, 20, 10, 12);
        let padded = bbox.padded(5, 100, 100);
        assert_eq!(padded, BoundingBox::new(15, 15, 20, 22));
    }

    #[test]
    fn unrecognized_prediction_is_a_distribution() {
        let p = DigitPrediction::unrecognized();
        assert_eq!(p.digit, None);
        assert!(p.confidence.abs() < f32::EPSILON);
        let sum: f32 = p.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3);
        assert_eq!(p.symbol(), '?');
    }

    #[test]
    fn symbol_maps_digits() {
        let p = DigitPrediction {
            digit: Some(7),
            confidence: 90.0,
            probabilities: [0.1; CLASS_COUNT],
        };
        assert_eq!(p.symbol(), '7');
    }

    #[test]
    fn unrecognized_digit_serializes_as_minus_one() {
        let json = serde_json::to_value(DigitPrediction::unrecognized()).unwrap();
        assert_eq!(json["digit"], -1);
        let back: DigitPrediction = serde_json::from_value(json).unwrap();
        assert_eq!(back.digit, None);
    }

    #[test]
    fn out_of_range_digit_is_rejected() {
        let json = serde_json::json!({
            "digit": 12,
            "confidence": 0.0,
            "probabilities": [0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1],
        });
        assert!(serde_json::from_value::<DigitPrediction>(json).is_err());
    }

    #[test]
    fn default_filter_is_tuned_preset() {
        let config = FilterConfig::default();
        assert!((config.scale - 3.0).abs() < f32::EPSILON);
        assert!(config.grayscale);
        assert!((config.contrast - 2.5).abs() < f32::EPSILON);
        assert!((config.brightness - 1.2).abs() < f32::EPSILON);
        assert!(!config.sharpen);
        assert_eq!(config.threshold, Some(140));
    }

    #[test]
    fn validate_rejects_bad_scale() {
        for scale in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            let config = FilterConfig {
                scale,
                ..FilterConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(RecognitionError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn validate_rejects_negative_multipliers() {
        let config = FilterConfig {
            contrast: -0.5,
            ..FilterConfig::default()
        };
        assert!(config.validate().is_err());
        let config = FilterConfig {
            brightness: -0.5,
            ..FilterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn recognizer_config_round_trips_through_json() {
        let config = RecognizerConfig {
            filter: FilterConfig {
                threshold: None,
                ..FilterConfig::default()
            },
            segmentation: Segmentation::FixedColumns(4),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RecognizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn error_proxy_preserves_variant() {
        let json = serde_json::to_string(&RecognitionError::NoDigitsDetected).unwrap();
        let back: RecognitionError = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, RecognitionError::NoDigitsDetected));

        let json =
            serde_json::to_string(&RecognitionError::ModelUnavailable("gone".into())).unwrap();
        let back: RecognitionError = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, RecognitionError::ModelUnavailable(ref m) if m == "gone"));
    }
}
