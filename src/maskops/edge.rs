use image::RgbImage;
use rayon::prelude::*;

const SCHARR_OUTER: f32 = 47.0 / 255.0;
const SCHARR_INNER: f32 = 162.0 / 255.0;

/// Rec.601 luminance scaled to [0, 1].
pub(crate) fn luminance(rgb: &RgbImage) -> Vec<f32> {
    rgb.as_raw()
        .par_chunks_exact(3)
        .map(|p| (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32) / 255.0)
        .collect()
}

/// Scharr gradient magnitude. Border pixels are zero.
pub(crate) fn scharr_magnitude(lum: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut grad = vec![0.0f32; width * height];
    if width < 3 || height < 3 {
        return grad;
    }
    grad.par_chunks_mut(width)
        .enumerate()
        .skip(1)
        .take(height - 2)
        .for_each(|(y, row)| {
            for (x, g) in row.iter_mut().enumerate().skip(1).take(width - 2) {
                let i = y * width + x;
                let p = |dy: isize, dx: isize| {
                    lum[(i as isize + dy * width as isize + dx) as usize]
                };
                let gx = SCHARR_OUTER * (p(-1, -1) - p(-1, 1) + p(1, -1) - p(1, 1))
                    + SCHARR_INNER * (p(0, -1) - p(0, 1));
                let gy = SCHARR_OUTER * (p(-1, -1) - p(1, -1) + p(-1, 1) - p(1, 1))
                    + SCHARR_INNER * (p(-1, 0) - p(1, 0));
                *g = (gx * gx + gy * gy).sqrt();
            }
        });
    grad
}

/// Binarize `mask` against a threshold raised by `boost` times the normalised
/// edge strength of `rgb`.
///
/// Leaves the mask untouched when `boost <= 0`, when the image is smaller than
/// 3x3, or when its size differs from the mask.
pub fn refine_edges(
    mask: &mut [f32],
    width: usize,
    height: usize,
    rgb: &RgbImage,
    threshold: f32,
    boost: f32,
) {
    if boost <= 0.0
        || width < 3
        || height < 3
        || (rgb.width() as usize, rgb.height() as usize) != (width, height)
        || mask.len() != width * height
    {
        return;
    }

    let grad = scharr_magnitude(&luminance(rgb), width, height);
    let max = grad.par_iter().copied().reduce(|| 0.0, f32::max);
    let inv_max = if max > 1e-6 { 1.0 / max } else { 0.0 };

    mask.par_iter_mut().zip(grad.par_iter()).for_each(|(m, g)| {
        let t = threshold + boost * g * inv_max;
        *m = if *m > t { 1.0 } else { 0.0 };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn flat_image_has_no_gradient() {
        let img = RgbImage::from_pixel(5, 4, Rgb([90, 90, 90]));
        let g = scharr_magnitude(&luminance(&img), 5, 4);
        assert!(g.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn edge_raises_threshold() {
        // vertical step edge between columns 2 and 3
        let img = RgbImage::from_fn(6, 5, |x, _| if x < 3 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });
        let mut mask = vec![0.7f32; 30];
        refine_edges(&mut mask, 6, 5, &img, 0.5, 0.5);
        // next to the edge the threshold becomes 1.0
        assert_eq!(mask[2 * 6 + 2], 0.0);
        assert_eq!(mask[2 * 6 + 3], 0.0);
        // flat interior and borders stay foreground
        assert_eq!(mask[2 * 6 + 5], 1.0);
        assert_eq!(mask[0], 1.0);
    }

    #[test]
    fn skipped_when_disabled_or_mismatched() {
        let img = RgbImage::new(4, 4);
        let mut mask = vec![0.3f32; 16];
        refine_edges(&mut mask, 4, 4, &img, 0.5, 0.0);
        assert!(mask.iter().all(|&v| v == 0.3));
        refine_edges(&mut mask, 4, 4, &RgbImage::new(5, 4), 0.5, 0.2);
        assert!(mask.iter().all(|&v| v == 0.3));
    }
}
