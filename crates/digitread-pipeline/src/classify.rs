//! Patch normalization and single-glyph classification.
//!
//! A segmented patch is square and white-backed, but its size varies and
//! its ink is dark. The network expects the opposite: a 28x28 grid of
//! intensities in `[0, 1]` with a bright glyph on a dark field.
//! [`normalize_patch`] bridges the two, and [`classify`] turns the
//! network's distribution into a [`DigitPrediction`].

use image::imageops::FilterType;

use crate::filter::luma;
use crate::types::{CLASS_COUNT, DigitPrediction, RecognitionError, RgbaImage};

/// Side length of the network input, in pixels.
pub const PATCH_SIDE: u32 = 28;

/// Number of input values of the network.
pub const PATCH_PIXELS: usize = (PATCH_SIDE * PATCH_SIDE) as usize;

/// Allowed deviation of a probability vector's sum from one.
pub const PROBABILITY_TOLERANCE: f32 = 1e-3;

/// Network input: 28x28 row-major intensities in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchTensor(Box<[f32; PATCH_PIXELS]>);

impl PatchTensor {
    /// Build a tensor from exactly [`PATCH_PIXELS`] values, clamped to
    /// `[0, 1]`.
    ///
    /// Returns `None` when the length is wrong.
    #[must_use]
    pub fn from_values(values: &[f32]) -> Option<Self> {
        if values.len() != PATCH_PIXELS {
            return None;
        }
        let mut data = Box::new([0.0; PATCH_PIXELS]);
        for (dst, src) in data.iter_mut().zip(values) {
            *dst = if src.is_nan() { 0.0 } else { src.clamp(0.0, 1.0) };
        }
        Some(Self(data))
    }

    /// The raw values.
    #[must_use]
    pub fn values(&self) -> &[f32; PATCH_PIXELS] {
        &self.0
    }

    /// Mean intensity.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f32 {
        self.0.iter().sum::<f32>() / PATCH_PIXELS as f32
    }

    /// Flip every intensity `v` to `1 - v`.
    pub fn invert(&mut self) {
        for v in self.0.iter_mut() {
            *v = 1.0 - *v;
        }
    }
}

/// Anything that maps a normalized patch to a class distribution.
pub trait DigitClassifier {
    /// Run one forward pass.
    ///
    /// # Errors
    ///
    /// Returns [`RecognitionError::InferenceFailed`] when the model cannot
    /// produce a distribution for this input.
    fn predict(&self, input: &PatchTensor) -> Result<[f32; CLASS_COUNT], RecognitionError>;
}

/// Resize a glyph patch to 28x28, reduce it to intensity, and make sure
/// the glyph is the bright part.
///
/// The patch is inverted when its mean intensity exceeds 0.5, i.e. when
/// the background is lighter than the ink.
///
/// # Errors
///
/// Returns [`RecognitionError::InferenceFailed`] for an empty patch.
pub fn normalize_patch(patch: &RgbaImage) -> Result<PatchTensor, RecognitionError> {
    if patch.width() == 0 || patch.height() == 0 {
        return Err(RecognitionError::InferenceFailed(
            "cannot classify an empty patch".into(),
        ));
    }

    let resized = image::imageops::resize(patch, PATCH_SIDE, PATCH_SIDE, FilterType::Triangle);
    let mut data = Box::new([0.0; PATCH_PIXELS]);
    for (dst, p) in data.iter_mut().zip(resized.pixels()) {
        let [r, g, b, _] = p.0;
        *dst = f32::from(luma(r, g, b)) / 255.0;
    }

    let mut tensor = PatchTensor(data);
    if tensor.mean() > 0.5 {
        tensor.invert();
    }
    Ok(tensor)
}

/// Turn a class distribution into a prediction.
///
/// # Errors
///
/// Returns [`RecognitionError::InferenceFailed`] if any probability is
/// outside `[0, 1]` or non-finite, or if the vector does not sum to one
/// within [`PROBABILITY_TOLERANCE`].
pub fn prediction_from_probabilities(
    probabilities: [f32; CLASS_COUNT],
) -> Result<DigitPrediction, RecognitionError> {
    if probabilities
        .iter()
        .any(|p| !p.is_finite() || *p < 0.0 || *p > 1.0 + PROBABILITY_TOLERANCE)
    {
        return Err(RecognitionError::InferenceFailed(format!(
            "model produced invalid probabilities: {probabilities:?}"
        )));
    }
    let sum: f32 = probabilities.iter().sum();
    if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
        return Err(RecognitionError::InferenceFailed(format!(
            "probabilities sum to {sum}, expected 1"
        )));
    }

    let (best, p) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

    Ok(DigitPrediction {
        digit: u8::try_from(best).ok(),
        confidence: (p * 100.0).clamp(0.0, 100.0),
        probabilities,
    })
}

/// Normalize `patch` and classify it with `model`.
///
/// Never mutates the model.
///
/// # Errors
///
/// Returns [`RecognitionError::InferenceFailed`] if normalization or the
/// forward pass fails, or if the model's output is not a distribution.
pub fn classify<C>(model: &C, patch: &RgbaImage) -> Result<DigitPrediction, RecognitionError>
where
    C: DigitClassifier + ?Sized,
{
    let input = normalize_patch(patch)?;
    let probabilities = model.predict(&input)?;
    prediction_from_probabilities(probabilities)
}
