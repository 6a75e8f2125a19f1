//! Default page cleanup: grayscale, binarize, and remove speckle.

use image::{GrayImage, Luma};

use super::ImageCleaner;
use crate::prelude::*;

const INK: u8 = 0;
const PAPER: u8 = 255;

/// Converts pages to pure black and white using Otsu's threshold, then closes
/// small gaps in the ink with a 2×2 structuring element.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThresholdCleaner;

impl ImageCleaner for ThresholdCleaner {
    #[instrument(level = "trace", skip_all, fields(path = %input.display()))]
    fn clean(&self, input: &Path, output: &Path) -> Result<()> {
        let gray = image::open(input)
            .with_context(|| format!("cannot read image {:?}", input))?
            .to_luma8();
        let cleaned = close_ink(&binarize(&gray, otsu_threshold(&gray)));
        cleaned
            .save(output)
            .with_context(|| format!("cannot write image {:?}", output))?;
        Ok(())
    }
}

/// Otsu's threshold: the gray level that maximizes between-class variance.
/// Pixels strictly above it are paper.
pub fn otsu_threshold(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for Luma([value]) in image.pixels() {
        histogram[usize::from(*value)] += 1;
    }
    let total = f64::from(image.width()) * f64::from(image.height());
    let weighted_total = histogram
        .iter()
        .enumerate()
        .map(|(level, &count)| level as f64 * count as f64)
        .sum::<f64>();

    let mut best_threshold = 0u8;
    let mut best_variance = -1.0f64;
    let mut background_count = 0.0f64;
    let mut background_sum = 0.0f64;
    for (level, &count) in histogram.iter().enumerate() {
        background_count += count as f64;
        if background_count == 0.0 {
            continue;
        }
        let foreground_count = total - background_count;
        if foreground_count == 0.0 {
            break;
        }
        background_sum += level as f64 * count as f64;
        let background_mean = background_sum / background_count;
        let foreground_mean = (weighted_total - background_sum) / foreground_count;
        let variance = background_count
            * foreground_count
            * (background_mean - foreground_mean).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_threshold = level as u8;
        }
    }
    best_threshold
}

fn binarize(image: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y)[0] > threshold {
            Luma([PAPER])
        } else {
            Luma([INK])
        }
    })
}

/// Morphological close of the ink (dilate, then erode) with a 2×2 element.
/// Out-of-bounds neighbours are ignored.
fn close_ink(image: &GrayImage) -> GrayImage {
    let dilated = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let any_ink = window(image, x, y, Reach::Back).any(|value| value == INK);
        Luma([if any_ink { INK } else { PAPER }])
    });
    // Erode with the reflected element, so the close doesn't shift strokes.
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let all_ink = window(&dilated, x, y, Reach::Forward).all(|value| value == INK);
        Luma([if all_ink { INK } else { PAPER }])
    })
}

/// Which way a 2×2 window extends from its anchor pixel.
#[derive(Clone, Copy)]
enum Reach {
    Back,
    Forward,
}

/// Pixel values in the 2×2 window anchored at `(x, y)`.
fn window(image: &GrayImage, x: u32, y: u32, reach: Reach) -> impl Iterator<Item = u8> + '_ {
    [(0, 0), (1, 0), (0, 1), (1, 1)]
        .into_iter()
        .filter_map(move |(dx, dy)| {
            let (nx, ny) = match reach {
                Reach::Back => (x.checked_sub(dx)?, y.checked_sub(dy)?),
                Reach::Forward => (x + dx, y + dy),
            };
            (nx < image.width() && ny < image.height()).then(|| image.get_pixel(nx, ny)[0])
        })
}
