//! Glyph segmentation: split a binarized raster into per-digit patches.
//!
//! This module defines the [`Segmenter`] trait and the [`Segmentation`]
//! enum for selecting a strategy at runtime, following the same
//! strategy pattern as the filter and classifier stages.
//!
//! The default strategy labels dark regions with an 8-connected flood
//! fill, throws away blobs that cannot be digits, and emits one square,
//! centered patch per surviving region in left-to-right order. The
//! fixed-column strategy skips labeling entirely and cuts the raster into
//! `n` equal vertical bands.

use image::Rgba;
use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, RecognitionError, RgbaImage, SegmentedDigit};

/// A pixel is foreground when its red channel is below this value.
pub const FOREGROUND_THRESHOLD: u8 = 128;

/// Components with fewer pixels than this are noise.
pub const MIN_COMPONENT_PIXELS: u64 = 50;

/// Components whose bounding box covers more than this fraction of the
/// raster are background mistaken for ink.
pub const MAX_AREA_FRACTION: f64 = 0.9;

/// Components narrower or shorter than this are too thin to be digits.
pub const MIN_COMPONENT_DIMENSION: u32 = 10;

/// Padding added around each accepted component before centering.
pub const GLYPH_PADDING: u32 = 5;

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Selects how glyphs are isolated from the preprocessed raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Segmentation {
    /// Flood-fill labeling with noise, background, and thinness rejection.
    #[default]
    ConnectedComponents,
    /// Exactly `n` equal-width vertical bands, for inputs with a known
    /// digit count.
    FixedColumns(u32),
}

/// Trait for segmentation strategies.
///
/// Input: a binarized raster (dark ink on a light background).
/// Output: glyph patches ordered left to right.
pub trait Segmenter {
    /// Isolate the glyphs in `image`.
    ///
    /// # Errors
    ///
    /// Returns [`RecognitionError::InvalidConfig`] when the strategy's
    /// parameters do not fit the raster.
    fn segment(&self, image: &RgbaImage) -> Result<Vec<SegmentedDigit>, RecognitionError>;
}

impl Segmenter for Segmentation {
    fn segment(&self, image: &RgbaImage) -> Result<Vec<SegmentedDigit>, RecognitionError> {
        match *self {
            Self::ConnectedComponents => Ok(segment(image)),
            Self::FixedColumns(n) => segment_fixed_columns(image, n),
        }
    }
}

/// Region discovered by the flood fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Component {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    pixel_count: u64,
}

impl Component {
    const fn seed(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            pixel_count: 0,
        }
    }

    fn include(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.pixel_count += 1;
    }

    const fn bbox(&self) -> BoundingBox {
        BoundingBox::new(
            self.min_x,
            self.min_y,
            self.max_x - self.min_x + 1,
            self.max_y - self.min_y + 1,
        )
    }

    fn rejection(&self, raster_area: u64) -> Option<Rejection> {
        let bbox = self.bbox();
        #[allow(clippy::cast_precision_loss)]
        let covers_raster = bbox.area() as f64 > raster_area as f64 * MAX_AREA_FRACTION;
        if self.pixel_count < MIN_COMPONENT_PIXELS {
            Some(Rejection::Noise)
        } else if covers_raster {
            Some(Rejection::Background)
        } else if bbox.width < MIN_COMPONENT_DIMENSION || bbox.height < MIN_COMPONENT_DIMENSION {
            Some(Rejection::TooThin)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Noise,
    Background,
    TooThin,
}

fn is_foreground(image: &RgbaImage, x: u32, y: u32) -> bool {
    image.get_pixel(x, y).0[0] < FOREGROUND_THRESHOLD
}

/// Number of pixels whose red channel is below [`FOREGROUND_THRESHOLD`].
#[must_use]
pub fn foreground_pixels(image: &RgbaImage) -> u64 {
    image
        .pixels()
        .filter(|p| p.0[0] < FOREGROUND_THRESHOLD)
        .map(|_| 1_u64)
        .sum()
}

/// Label every 8-connected foreground region in raster-scan order of
/// their first pixel.
///
/// The fill uses an explicit stack so large glyphs cannot exhaust the
/// call stack.
pub(crate) fn find_components(image: &RgbaImage) -> Vec<Component> {
    let (width, height) = image.dimensions();
    let index = |x: u32, y: u32| y as usize * width as usize + x as usize;

    let mut visited = vec![false; width as usize * height as usize];
    let mut stack: Vec<(u32, u32)> = Vec::new();
    let mut components = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if visited[index(x, y)] || !is_foreground(image, x, y) {
                continue;
            }

            visited[index(x, y)] = true;
            stack.push((x, y));
            let mut component = Component::seed(x, y);

            while let Some((cx, cy)) = stack.pop() {
                component.include(cx, cy);
                for dy in -1_i32..=1 {
                    for dx in -1_i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let (Some(nx), Some(ny)) =
                            (cx.checked_add_signed(dx), cy.checked_add_signed(dy))
                        else {
                            continue;
                        };
                        if nx >= width || ny >= height {
                            continue;
                        }
                        let n = index(nx, ny);
                        if !visited[n] && is_foreground(image, nx, ny) {
                            visited[n] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }

            components.push(component);
        }
    }

    components
}

/// Isolate digit glyphs with connected-component labeling.
///
/// Foreground is any pixel whose red channel is below
/// [`FOREGROUND_THRESHOLD`]; callers should binarize first. A region is
/// dropped when it has fewer than [`MIN_COMPONENT_PIXELS`] pixels, when
/// its bounding box covers more than [`MAX_AREA_FRACTION`] of the raster,
/// or when either side is shorter than [`MIN_COMPONENT_DIMENSION`].
///
/// Survivors are sorted by left edge (ties keep scan order), padded by
/// [`GLYPH_PADDING`], and centered on square white canvases. An image
/// with no surviving regions yields an empty vector.
#[must_use]
pub fn segment(image: &RgbaImage) -> Vec<SegmentedDigit> {
    let (width, height) = image.dimensions();
    let raster_area = u64::from(width) * u64::from(height);

    let components = find_components(image);
    let total = components.len();

    let mut rejected = [0_usize; 3];
    let mut accepted: Vec<Component> = components
        .into_iter()
        .filter(|c| match c.rejection(raster_area) {
            None => true,
            Some(reason) => {
                rejected[reason as usize] += 1;
                false
            }
        })
        .collect();
    accepted.sort_by_key(|c| c.min_x);

    log::debug!(
        "segmentation: {total} components, {} accepted, rejected noise={} background={} thin={}",
        accepted.len(),
        rejected[Rejection::Noise as usize],
        rejected[Rejection::Background as usize],
        rejected[Rejection::TooThin as usize],
    );

    accepted
        .iter()
        .map(|c| {
            let bbox = c.bbox().padded(GLYPH_PADDING, width, height);
            SegmentedDigit {
                bbox,
                patch: center_on_square(image, bbox),
            }
        })
        .collect()
}

/// Cut the raster into `columns` equal-width vertical bands and center
/// each on a square white canvas.
///
/// Band `i` spans `[i * width / columns, (i + 1) * width / columns)` so
/// the bands tile the raster exactly.
///
/// # Errors
///
/// Returns [`RecognitionError::InvalidConfig`] if `columns` is zero or
/// exceeds the raster width, or if the raster has no rows.
pub fn segment_fixed_columns(
    image: &RgbaImage,
    columns: u32,
) -> Result<Vec<SegmentedDigit>, RecognitionError> {
    let (width, height) = image.dimensions();
    if columns == 0 || columns > width || height == 0 {
        return Err(RecognitionError::InvalidConfig(format!(
            "cannot split a {width}x{height} raster into {columns} columns"
        )));
    }

    let edge = |i: u32| {
        let x = u64::from(i) * u64::from(width) / u64::from(columns);
        // x <= width, so it always fits.
        u32::try_from(x).unwrap_or(width)
    };

    Ok((0..columns)
        .map(|i| {
            let left = edge(i);
            let bbox = BoundingBox::new(left, 0, edge(i + 1) - left, height);
            SegmentedDigit {
                bbox,
                patch: center_on_square(image, bbox),
            }
        })
        .collect())
}

/// Copy `region` of `image` onto the center of a white square canvas
/// whose side is the longer side of `region`.
#[must_use]
pub fn center_on_square(image: &RgbaImage, region: BoundingBox) -> RgbaImage {
    let side = region.width.max(region.height);
    let mut canvas = RgbaImage::from_pixel(side, side, BACKGROUND);
    let crop = image::imageops::crop_imm(image, region.x, region.y, region.width, region.height)
        .to_image();
    let offset_x = (side - region.width) / 2;
    let offset_y = (side - region.height) / 2;
    image::imageops::replace(
        &mut canvas,
        &crop,
        i64::from(offset_x),
        i64::from(offset_y),
    );
    canvas
}
