use image::{imageops, DynamicImage, GrayImage};
use std::io::Cursor;
use thiserror::Error;

/// Longest side kept before recognition; larger photos are scaled down.
const MAX_DIMENSION: u32 = 2800;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Image data is empty")]
    Empty,
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Decoded image has no pixels")]
    ZeroPixels,
}

/// A single-channel image whose pixels are all either 0 or 255.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pixels: GrayImage,
    threshold: u8,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// The Otsu threshold used for binarization.
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn as_gray(&self) -> &GrayImage {
        &self.pixels
    }

    /// Encode as PNG, the hand-off format for OCR engines that read from memory.
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.pixels
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        Ok(buf)
    }
}

/// Decode raw image bytes (JPEG / PNG / WEBP / …) and binarize them for OCR.
///
/// The image is converted to RGB, reduced to luma, and split at the Otsu
/// threshold: pixels at or above it become white, the rest black.
pub fn normalize(data: &[u8]) -> Result<NormalizedImage, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    let img = image::load_from_memory(data)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(DecodeError::ZeroPixels);
    }

    // Tesseract works best around 300 DPI / ~2000 px.
    let img = if img.width() > MAX_DIMENSION || img.height() > MAX_DIMENSION {
        img.resize(MAX_DIMENSION, MAX_DIMENSION, imageops::FilterType::Lanczos3)
    } else {
        img
    };

    let gray = to_grayscale(img);
    let threshold = otsu_threshold(&gray);
    tracing::debug!(
        width = gray.width(),
        height = gray.height(),
        threshold,
        "Binarizing receipt image"
    );

    Ok(NormalizedImage { pixels: binarize(gray, threshold), threshold })
}

fn to_grayscale(img: DynamicImage) -> GrayImage {
    let rgb = img.to_rgb8();
    imageops::grayscale(&rgb)
}

/// Otsu's method over the 256-bin histogram.
///
/// Returns the lowest intensity of the bright class, so `value >= threshold`
/// selects white. An image with a single intensity returns that intensity.
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for p in gray.pixels() {
        histogram[p[0] as usize] += 1;
    }

    let total: u64 = histogram.iter().sum();
    let weighted_sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, &count)| level as f64 * count as f64)
        .sum();

    let mut background_weight = 0u64;
    let mut background_sum = 0f64;
    let mut best: Option<(usize, f64)> = None;

    for (level, &count) in histogram.iter().enumerate() {
        background_weight += count;
        if background_weight == 0 {
            continue;
        }
        let foreground_weight = total - background_weight;
        if foreground_weight == 0 {
            break;
        }
        background_sum += level as f64 * count as f64;

        let background_mean = background_sum / background_weight as f64;
        let foreground_mean = (weighted_sum - background_sum) / foreground_weight as f64;
        let between = background_weight as f64
            * foreground_weight as f64
            * (background_mean - foreground_mean).powi(2);

        if best.map_or(true, |(_, max)| between > max) {
            best = Some((level, between));
        }
    }

    match best {
        // The loop stops before the last populated level, so `level + 1` fits.
        Some((level, _)) => (level + 1) as u8,
        None => histogram
            .iter()
            .position(|&count| count > 0)
            .unwrap_or(0) as u8,
    }
}

fn binarize(mut gray: GrayImage, threshold: u8) -> GrayImage {
    for p in gray.pixels_mut() {
        p[0] = if p[0] >= threshold { 255 } else { 0 };
    }
    gray
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb, RgbImage};

    fn encode(img: DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn solid_gray(width: u32, height: u32, value: u8) -> DynamicImage {
        let img: GrayImage = ImageBuffer::from_fn(width, height, |_, _| Luma([value]));
        DynamicImage::ImageLuma8(img)
    }

    fn gradient_gray(width: u32, height: u32) -> DynamicImage {
        let img: GrayImage =
            ImageBuffer::from_fn(width, height, |x, _| Luma([(x * 255 / width) as u8]));
        DynamicImage::ImageLuma8(img)
    }

    fn assert_binary(img: &NormalizedImage) {
        assert!(img.as_gray().pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn empty_bytes_are_rejected() {
        assert!(matches!(normalize(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        let result = normalize(b"definitely not an image");
        assert!(matches!(result, Err(DecodeError::Image(_))));
    }

    #[test]
    fn truncated_png_is_rejected() {
        let png = encode(gradient_gray(32, 32));
        assert!(normalize(&png[..png.len() / 2]).is_err());
    }

    #[test]
    fn gradient_becomes_binary() {
        let result = normalize(&encode(gradient_gray(256, 4))).unwrap();
        assert_binary(&result);
        let pixels = result.as_gray();
        assert_eq!(pixels.get_pixel(0, 0)[0], 0);
        assert_eq!(pixels.get_pixel(255, 0)[0], 255);
    }

    #[test]
    fn colour_image_becomes_binary() {
        let img: RgbImage = ImageBuffer::from_fn(40, 20, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([250, 245, 230])
            } else {
                Rgb([30, 20, 60])
            }
        });
        let result = normalize(&encode(DynamicImage::ImageRgb8(img))).unwrap();
        assert_binary(&result);
        assert_eq!(result.as_gray().get_pixel(0, 0)[0], 255);
        assert_eq!(result.as_gray().get_pixel(4, 0)[0], 0);
    }

    #[test]
    fn two_tone_image_splits_between_tones() {
        let img: GrayImage =
            ImageBuffer::from_fn(10, 10, |x, _| Luma([if x < 5 { 50 } else { 200 }]));
        let threshold = otsu_threshold(&img);
        assert!(threshold > 50 && threshold <= 200, "threshold {threshold}");

        let result = binarize(img, threshold);
        assert_eq!(result.get_pixel(0, 0)[0], 0);
        assert_eq!(result.get_pixel(9, 0)[0], 255);
    }

    #[test]
    fn uniform_image_turns_white() {
        let result = normalize(&encode(solid_gray(10, 10, 128))).unwrap();
        assert_eq!(result.threshold(), 128);
        assert!(result.as_gray().pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn large_image_is_resized() {
        let result = normalize(&encode(solid_gray(3000, 1500, 200))).unwrap();
        assert!(result.width() <= MAX_DIMENSION && result.height() <= MAX_DIMENSION);
        assert_binary(&result);
    }

    #[test]
    fn normalized_image_encodes_as_png() {
        let result = normalize(&encode(gradient_gray(16, 16))).unwrap();
        let png = result.to_png().unwrap();
        // PNG magic bytes: 0x89 0x50 0x4E 0x47
        assert_eq!(&png[..4], b"\x89PNG");
    }
}
