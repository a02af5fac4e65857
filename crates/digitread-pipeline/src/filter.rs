//! Pixel filters: upscale, grayscale, contrast/brightness, binarization.
//!
//! [`preprocess`] turns a decoded upload into the high-contrast raster
//! the segmenter expects. The steps always run in the same order:
//!
//! 1. Bilinear upscale by `config.scale`
//! 2. Optional BT.601 grayscale
//! 3. Contrast, then brightness
//! 4. Optional binarization against `config.threshold`
//! 5. Optional sharpening (a second, milder contrast/brightness pass)
//!
//! Every step is total over the raster and keeps channel values inside
//! `[0, 255]`. Alpha is never touched.

use image::Rgba;
use image::imageops::FilterType;

use crate::types::{FilterConfig, RecognitionError, RgbaImage};

/// BT.601 luma weights for red, green, and blue.
pub const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Contrast multiplier of the sharpening pass.
pub const SHARPEN_CONTRAST: f32 = 1.2;

/// Brightness multiplier of the sharpening pass.
pub const SHARPEN_BRIGHTNESS: f32 = 1.1;

/// Largest raster, in pixels, [`preprocess`] will allocate (1 GiB of RGBA).
pub const MAX_SURFACE_PIXELS: u64 = 1 << 28;

/// Decode raw image bytes (PNG, JPEG, GIF, BMP, WebP) into RGBA.
///
/// # Errors
///
/// Returns [`RecognitionError::DecodeFailed`] if `bytes` is empty, the
/// format is unrecognized, or the data is corrupt.
pub fn decode(bytes: &[u8]) -> Result<RgbaImage, RecognitionError> {
    if bytes.is_empty() {
        return Err(RecognitionError::DecodeFailed(image::ImageError::Decoding(
            image::error::DecodingError::new(
                image::error::ImageFormatHint::Unknown,
                "input image data is empty",
            ),
        )));
    }
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgba8())
}

/// BT.601 luma of an RGB triple, rounded to the nearest integer.
#[must_use]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = LUMA_WEIGHTS[0].mul_add(
        f32::from(r),
        LUMA_WEIGHTS[1].mul_add(f32::from(g), LUMA_WEIGHTS[2] * f32::from(b)),
    );
    clamp_channel(y)
}

/// Apply contrast around mid-gray and then brightness to one channel.
///
/// `v' = clamp(((v - 128) * contrast + 128) * brightness, 0, 255)`
#[must_use]
pub fn adjust_channel(value: u8, contrast: f32, brightness: f32) -> u8 {
    let contrasted = (f32::from(value) - 128.0).mul_add(contrast, 128.0);
    clamp_channel(contrasted * brightness)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_channel(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 255.0) as u8
}

/// Output dimensions for an upscale of `width` x `height` by `scale`.
///
/// Each axis is `floor(dim * scale)`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn scaled_dimensions(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let scale = f64::from(scale);
    let w = (f64::from(width) * scale).floor();
    let h = (f64::from(height) * scale).floor();
    (
        w.clamp(0.0, f64::from(u32::MAX)) as u32,
        h.clamp(0.0, f64::from(u32::MAX)) as u32,
    )
}

/// Run the full filter chain on a decoded image.
///
/// Consumes the input; the returned raster is a fresh buffer of
/// [`scaled_dimensions`].
///
/// # Errors
///
/// Returns [`RecognitionError::InvalidConfig`] if the config fails
/// [`FilterConfig::validate`]. Returns
/// [`RecognitionError::UnsupportedSurface`] if the scaled raster would be
/// empty or larger than [`MAX_SURFACE_PIXELS`].
pub fn preprocess(image: RgbaImage, config: &FilterConfig) -> Result<RgbaImage, RecognitionError> {
    config.validate()?;

    let (width, height) = scaled_dimensions(image.width(), image.height(), config.scale);
    let fits = u64::from(width)
        .checked_mul(u64::from(height))
        .is_some_and(|pixels| pixels <= MAX_SURFACE_PIXELS);
    if width == 0 || height == 0 || !fits {
        return Err(RecognitionError::UnsupportedSurface { width, height });
    }

    let mut out = if (width, height) == image.dimensions() {
        image
    } else {
        image::imageops::resize(&image, width, height, FilterType::Triangle)
    };

    if config.grayscale {
        to_grayscale(&mut out);
    }

    adjust(&mut out, config.contrast, config.brightness);

    if let Some(threshold) = config.threshold {
        binarize(&mut out, threshold);
    }

    if config.sharpen {
        adjust(&mut out, SHARPEN_CONTRAST, SHARPEN_BRIGHTNESS);
    }

    log::debug!(
        "preprocessed raster: {width}x{height} (scale {}, threshold {:?})",
        config.scale,
        config.threshold
    );
    Ok(out)
}

/// Replace R, G, and B of every pixel with its BT.601 luma.
pub fn to_grayscale(image: &mut RgbaImage) {
    for Rgba([r, g, b, _]) in image.pixels_mut() {
        let y = luma(*r, *g, *b);
        *r = y;
        *g = y;
        *b = y;
    }
}

/// Apply [`adjust_channel`] to R, G, and B of every pixel.
#[allow(clippy::cast_possible_truncation)]
pub fn adjust(image: &mut RgbaImage, contrast: f32, brightness: f32) {
    // Every channel maps through the same function of one byte.
    let table: [u8; 256] = std::array::from_fn(|v| adjust_channel(v as u8, contrast, brightness));
    for Rgba([r, g, b, _]) in image.pixels_mut() {
        *r = table[usize::from(*r)];
        *g = table[usize::from(*g)];
        *b = table[usize::from(*b)];
    }
}

/// Force each pixel to pure white when the mean of R, G, and B exceeds
/// `threshold`, and to pure black otherwise.
pub fn binarize(image: &mut RgbaImage, threshold: u8) {
    for Rgba([r, g, b, _]) in image.pixels_mut() {
        let sum = u16::from(*r) + u16::from(*g) + u16::from(*b);
        // mean > threshold  <=>  sum > 3 * threshold
        let v = if sum > 3 * u16::from(threshold) {
            255
        } else {
            0
        };
        *r = v;
        *g = v;
        *b = v;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            #[allow(clippy::cast_possible_truncation)]
            let v = ((x * 37 + y * 91) % 256) as u8;
            Rgba([v, v.wrapping_mul(3), v.wrapping_add(100), 200])
        })
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

    #[test]
    fn decode_empty_input() {
        let err = decode(&[]).unwrap_err();
        assert!(matches!(err, RecognitionError::DecodeFailed(_)));
        assert!(err.to_string().contains("empty"), "{err}");
    }

    #[test]
    fn decode_corrupt_input() {
        assert!(matches!(
            decode(&[0xFF, 0x00, 0x12]),
            Err(RecognitionError::DecodeFailed(_))
        ));
    }

    #[test]
    fn decode_valid_png() {
        let img = gradient(7, 5);
        let decoded = decode(&encode_png(&img)).unwrap();
        assert_eq!(decoded.dimensions(), img.dimensions());
        assert_eq!(decoded.as_raw(), img.as_raw());
    }

    #[test]
    fn luma_uses_bt601_weights() {
        assert_eq!(luma(255, 0, 0), 76);
        assert_eq!(luma(0, 255, 0), 150);
        assert_eq!(luma(0, 0, 255), 29);
        assert_eq!(luma(255, 255, 255), 255);
    }

    #[test]
    fn adjust_channel_formula() {
        // Identity multipliers leave values alone.
        assert_eq!(adjust_channel(37, 1.0, 1.0), 37);
        // ((200 - 128) * 2 + 128) * 1 = 272 -> 255
        assert_eq!(adjust_channel(200, 2.0, 1.0), 255);
        // ((100 - 128) * 2 + 128) * 1.5 = 108
        assert_eq!(adjust_channel(100, 2.0, 1.5), 108);
        // ((0 - 128) * 2.5 + 128) -> negative -> 0
        assert_eq!(adjust_channel(0, 2.5, 1.2), 0);
        // Zero contrast collapses to mid-gray.
        assert_eq!(adjust_channel(3, 0.0, 1.0), 128);
    }

    #[test]
    fn scaled_dimensions_floor() {
        assert_eq!(scaled_dimensions(10, 7, 3.0), (30, 21));
        assert_eq!(scaled_dimensions(10, 7, 1.55), (15, 10));
        assert_eq!(scaled_dimensions(3, 3, 0.2), (0, 0));
    }

    #[test]
    fn output_dimensions_follow_scale() {
        for scale in [0.5, 1.0, 1.5, 3.0] {
            let config = FilterConfig {
                scale,
                ..FilterConfig::default()
            };
            let out = preprocess(gradient(17, 9), &config).unwrap();
            assert_eq!(out.dimensions(), scaled_dimensions(17, 9, scale));
        }
    }

    #[test]
    fn zero_sized_output_is_unsupported_surface() {
        let config = FilterConfig {
            scale: 0.01,
            ..FilterConfig::default()
        };
        assert!(matches!(
            preprocess(gradient(10, 10), &config),
            Err(RecognitionError::UnsupportedSurface { .. })
        ));
    }

    #[test]
    fn saturated_scale_is_unsupported_surface() {
        let config = FilterConfig {
            scale: 1e10,
            ..FilterConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(scaled_dimensions(1, 1, 1e10), (u32::MAX, u32::MAX));
        assert!(matches!(
            preprocess(RgbaImage::new(1, 1), &config),
            Err(RecognitionError::UnsupportedSurface {
                width: u32::MAX,
                height: u32::MAX
            })
        ));
    }

    #[test]
    fn surface_over_pixel_budget_is_unsupported() {
        let config = FilterConfig {
            scale: 20_000.0,
            ..FilterConfig::default()
        };
        let (w, h) = scaled_dimensions(1, 1, config.scale);
        assert!(u64::from(w) * u64::from(h) > MAX_SURFACE_PIXELS);
        assert!(matches!(
            preprocess(RgbaImage::new(1, 1), &config),
            Err(RecognitionError::UnsupportedSurface {
                width: 20_000,
                height: 20_000
            })
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_work() {
        let config = FilterConfig {
            contrast: f32::NAN,
            ..FilterConfig::default()
        };
        assert!(matches!(
            preprocess(gradient(10, 10), &config),
            Err(RecognitionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn grayscale_equalizes_channels() {
        let config = FilterConfig {
            scale: 1.0,
            grayscale: true,
            contrast: 1.3,
            brightness: 0.9,
            sharpen: false,
            threshold: None,
        };
        let out = preprocess(gradient(16, 16), &config).unwrap();
        for p in out.pixels() {
            assert_eq!(p.0[0], p.0[1]);
            assert_eq!(p.0[1], p.0[2]);
        }
    }

    #[test]
    fn binarization_yields_pure_black_or_white() {
        for threshold in [0, 1, 90, 140, 254, 255] {
            let config = FilterConfig {
                scale: 1.5,
                grayscale: false,
                contrast: 1.0,
                brightness: 1.0,
                sharpen: false,
                threshold: Some(threshold),
            };
            let out = preprocess(gradient(12, 12), &config).unwrap();
            for p in out.pixels() {
                let rgb = [p.0[0], p.0[1], p.0[2]];
                assert!(rgb == [0, 0, 0] || rgb == [255, 255, 255], "got {rgb:?}");
            }
        }
    }

    #[test]
    fn binarize_compares_channel_mean() {
        let mut img = RgbaImage::from_pixel(1, 1, Rgba([150, 150, 120, 255]));
        // mean = 140, not strictly above 140.
        binarize(&mut img, 140);
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0, 255]);

        let mut img = RgbaImage::from_pixel(1, 1, Rgba([150, 150, 121, 255]));
        binarize(&mut img, 140);
        assert_eq!(img.get_pixel(0, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn sharpen_keeps_binary_rasters_binary() {
        let config = FilterConfig {
            scale: 1.0,
            sharpen: true,
            ..FilterConfig::default()
        };
        let out = preprocess(gradient(20, 20), &config).unwrap();
        for p in out.pixels() {
            assert!(p.0[0] == 0 || p.0[0] == 255);
        }
    }

    #[test]
    fn alpha_is_untouched() {
        let config = FilterConfig {
            scale: 1.0,
            ..FilterConfig::default()
        };
        let out = preprocess(gradient(8, 8), &config).unwrap();
        assert!(out.pixels().all(|p| p.0[3] == 200));
    }

    #[test]
    fn preprocess_is_deterministic() {
        let config = FilterConfig::default();
        let a = preprocess(gradient(13, 11), &config).unwrap();
        let b = preprocess(gradient(13, 11), &config).unwrap();
        assert_eq!(a.as_raw(), b.as_raw());
    }
}
