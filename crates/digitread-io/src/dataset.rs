//! Loading the reference training dataset from disk.

use std::path::{Path, PathBuf};

use digitread_pipeline::types::GrayImage;
use digitread_pipeline::{Dataset, DatasetError, DatasetSource, LabelEncoding, SpriteLayout};

/// A sprite image and a label file on disk.
#[derive(Debug, Clone)]
pub struct FsDatasetSource {
    sprite: PathBuf,
    labels: PathBuf,
    encoding: LabelEncoding,
    layout: SpriteLayout,
}

impl FsDatasetSource {
    /// A source reading `sprite` and `labels` with the default
    /// [`SpriteLayout`].
    #[must_use]
    pub fn new(sprite: impl Into<PathBuf>, labels: impl Into<PathBuf>, encoding: LabelEncoding) -> Self {
        Self {
            sprite: sprite.into(),
            labels: labels.into(),
            encoding,
            layout: SpriteLayout::default(),
        }
    }

    /// Use a different sprite layout.
    #[must_use]
    pub const fn with_layout(mut self, layout: SpriteLayout) -> Self {
        self.layout = layout;
        self
    }
}

impl DatasetSource for FsDatasetSource {
    fn fetch(&self, limit: usize) -> Result<Dataset, DatasetError> {
        let sprite = read_sprite(&self.sprite)?;
        let labels = std::fs::read(&self.labels).map_err(|e| unavailable(&self.labels, &e))?;
        log::info!(
            "decoding up to {limit} samples from {} ({}x{}) and {}",
            self.sprite.display(),
            sprite.width(),
            sprite.height(),
            self.labels.display(),
        );
        Dataset::from_sprite(&sprite, self.layout, &labels, self.encoding, limit)
    }
}

/// Decode the sprite and keep its red channel.
fn read_sprite(path: &Path) -> Result<GrayImage, DatasetError> {
    let bytes = std::fs::read(path).map_err(|e| unavailable(path, &e))?;
    let rgba = image::load_from_memory(&bytes)
        .map_err(|e| unavailable(path, &e))?
        .to_rgba8();
    Ok(GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        image::Luma([rgba.get_pixel(x, y).0[0]])
    }))
}

fn unavailable(path: &Path, e: &dyn std::fmt::Display) -> DatasetError {
    DatasetError::Unavailable(format!("{}: {e}", path.display()))
}
