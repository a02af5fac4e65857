//! Labeled training samples and the reference sprite-sheet format.
//!
//! The reference dataset ships as two files: a grayscale sprite image
//! holding the glyphs and a byte array holding their labels. Decoding is
//! pure and lives here; fetching the files is an I/O concern behind
//! [`DatasetSource`].

use serde::{Deserialize, Serialize};

use crate::classify::{PATCH_PIXELS, PATCH_SIDE, PatchTensor};
use crate::types::{CLASS_COUNT, GrayImage};

/// Number of samples decoded from the reference dataset by default.
pub const DEFAULT_SAMPLE_LIMIT: usize = 5000;

/// How glyphs are packed into the sprite image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpriteLayout {
    /// One sample per row: each row is 784 pixels, the 28x28 glyph
    /// flattened row-major.
    #[default]
    FlatRows,
    /// A grid of 28x28 tiles read left to right, top to bottom.
    Tiles,
}

/// How labels are stored in the label byte array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LabelEncoding {
    /// Ten bytes per sample; the non-zero byte marks the class.
    #[default]
    OneHot,
    /// One byte per sample holding the class index.
    Index,
}

/// Errors from decoding or fetching a dataset.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// The sprite's dimensions do not match its layout.
    #[error("sprite of {width}x{height} does not fit the {layout:?} layout")]
    SpriteShape {
        /// Sprite width.
        width: u32,
        /// Sprite height.
        height: u32,
        /// Expected layout.
        layout: SpriteLayout,
    },

    /// A label is out of range or not one-hot.
    #[error("label {index} is invalid")]
    InvalidLabel {
        /// Sample index.
        index: usize,
    },

    /// No samples could be decoded.
    #[error("dataset is empty")]
    Empty,

    /// The dataset could not be fetched.
    #[error("dataset unavailable: {0}")]
    Unavailable(String),
}

/// One training example.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSample {
    /// Normalized glyph, bright on dark.
    pub input: PatchTensor,
    /// Class index, `0..=9`.
    pub label: u8,
}

/// An ordered collection of training examples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    samples: Vec<LabeledSample>,
}

impl Dataset {
    /// Wrap existing samples.
    #[must_use]
    pub const fn new(samples: Vec<LabeledSample>) -> Self {
        Self { samples }
    }

    /// Decode up to `limit` samples from a sprite and its labels.
    ///
    /// Pixel intensities are scaled to `[0, 1]`. The sample count is the
    /// smallest of `limit`, the glyphs in the sprite, and the labels in
    /// `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::SpriteShape`] if the sprite does not match
    /// `layout`, [`DatasetError::InvalidLabel`] for a bad label, and
    /// [`DatasetError::Empty`] if no samples result.
    pub fn from_sprite(
        sprite: &GrayImage,
        layout: SpriteLayout,
        labels: &[u8],
        encoding: LabelEncoding,
        limit: usize,
    ) -> Result<Self, DatasetError> {
        let (width, height) = sprite.dimensions();
        let shape_error = || DatasetError::SpriteShape {
            width,
            height,
            layout,
        };

        let (available, tiles_per_row) = match layout {
            SpriteLayout::FlatRows => {
                if width as usize != PATCH_PIXELS {
                    return Err(shape_error());
                }
                (height as usize, 0)
            }
            SpriteLayout::Tiles => {
                if width == 0 || width % PATCH_SIDE != 0 || height % PATCH_SIDE != 0 {
                    return Err(shape_error());
                }
                let per_row = width / PATCH_SIDE;
                ((per_row * (height / PATCH_SIDE)) as usize, per_row)
            }
        };

        let label_count = match encoding {
            LabelEncoding::OneHot => labels.len() / CLASS_COUNT,
            LabelEncoding::Index => labels.len(),
        };

        let count = limit.min(available).min(label_count);
        if count == 0 {
            return Err(DatasetError::Empty);
        }

        let raw = sprite.as_raw();
        let mut samples = Vec::with_capacity(count);
        let mut values = vec![0.0_f32; PATCH_PIXELS];
        for index in 0..count {
            match layout {
                SpriteLayout::FlatRows => {
                    let row = &raw[index * PATCH_PIXELS..(index + 1) * PATCH_PIXELS];
                    for (dst, src) in values.iter_mut().zip(row) {
                        *dst = f32::from(*src) / 255.0;
                    }
                }
                SpriteLayout::Tiles => {
                    let tile = u32::try_from(index).map_err(|_| shape_error())?;
                    let x0 = (tile % tiles_per_row) * PATCH_SIDE;
                    let y0 = (tile / tiles_per_row) * PATCH_SIDE;
                    let tile_pixels = (0..PATCH_SIDE)
                        .flat_map(|dy| (0..PATCH_SIDE).map(move |dx| (x0 + dx, y0 + dy)));
                    for (dst, (x, y)) in values.iter_mut().zip(tile_pixels) {
                        *dst = f32::from(sprite.get_pixel(x, y).0[0]) / 255.0;
                    }
                }
            }

            let label = decode_label(labels, encoding, index)?;
            let input = PatchTensor::from_values(&values).ok_or_else(shape_error)?;
            samples.push(LabeledSample { input, label });
        }

        Ok(Self { samples })
    }

    /// The samples in order.
    #[must_use]
    pub fn samples(&self) -> &[LabeledSample] {
        &self.samples
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Split off the last `fraction` of samples for validation.
    ///
    /// Returns `(training, validation)`. The validation part holds
    /// `floor(len * fraction)` samples.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn split(&self, fraction: f32) -> (&[LabeledSample], &[LabeledSample]) {
        let fraction = f64::from(fraction.clamp(0.0, 1.0));
        let validation = (self.samples.len() as f64 * fraction).floor() as usize;
        self.samples.split_at(self.samples.len() - validation)
    }
}

fn decode_label(labels: &[u8], encoding: LabelEncoding, index: usize) -> Result<u8, DatasetError> {
    let invalid = || DatasetError::InvalidLabel { index };
    match encoding {
        LabelEncoding::Index => {
            let label = labels[index];
            if usize::from(label) < CLASS_COUNT {
                Ok(label)
            } else {
                Err(invalid())
            }
        }
        LabelEncoding::OneHot => {
            let row = &labels[index * CLASS_COUNT..(index + 1) * CLASS_COUNT];
            let mut hot = row.iter().enumerate().filter(|(_, v)| **v != 0);
            match (hot.next(), hot.next()) {
                (Some((class, _)), None) => u8::try_from(class).map_err(|_| invalid()),
                _ => Err(invalid()),
            }
        }
    }
}

/// Where reference training data comes from.
pub trait DatasetSource: Send + Sync {
    /// Fetch up to `limit` labeled samples.
    ///
    /// # Errors
    ///
    /// Returns a [`DatasetError`] when the data cannot be fetched or
    /// decoded.
    fn fetch(&self, limit: usize) -> Result<Dataset, DatasetError>;
}

impl DatasetSource for Dataset {
    fn fetch(&self, limit: usize) -> Result<Dataset, DatasetError> {
        if self.samples.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self {
            samples: self.samples.iter().take(limit).cloned().collect(),
        })
    }
}
