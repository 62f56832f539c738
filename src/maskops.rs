//! Post-processing applied to decoded probability masks.

mod component;
mod edge;
mod morphology;

pub use component::keep_seed_component;
pub use edge::refine_edges;
pub use morphology::{dilate, erode, open_close};

use image::RgbImage;
use tracing::debug;

use crate::{
    config::MaskSettings,
    errors::{Result, SegError},
    segmentation::Mask,
    traits::{MaskPath, MaskVectorizer},
};

/// Edge refinement (when `rgb` is given), seeded component filtering, then
/// open/close morphology, all at `settings.threshold()`.
pub fn postprocess(
    mask: &mut [f32],
    width: usize,
    height: usize,
    rgb: Option<&RgbImage>,
    settings: &MaskSettings,
    seed: (usize, usize),
) -> Result<()> {
    if mask.len() != width * height {
        return Err(SegError::Validation {
            field: "mask".to_string(),
            reason: format!("{} values for {width}x{height}", mask.len()),
        });
    }
    let t = settings.threshold();

    if let Some(rgb) = rgb {
        refine_edges(mask, width, height, rgb, t, settings.edge_refine());
    }
    keep_seed_component(mask, width, height, t, seed);
    open_close(mask, width, height, t, settings.morph_radius());

    debug!(
        width,
        height,
        threshold = t,
        edge = settings.edge_refine(),
        morph = settings.morph_radius(),
        ?seed,
        "mask post-processed"
    );
    Ok(())
}

/// Hand the mask to a vectorizer, which expects background as 1.0.
pub fn vectorize_mask<V: MaskVectorizer + ?Sized>(vectorizer: &V, mask: &Mask) -> Result<Vec<MaskPath>> {
    let inverted: Vec<f32> = mask.data.iter().map(|m| 1.0 - m).collect();
    vectorizer.vectorize(&inverted, mask.width, mask.height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::cell::RefCell;

    struct Recorder(RefCell<Vec<f32>>);

    impl MaskVectorizer for Recorder {
        fn vectorize(&self, inverted: &[f32], width: usize, height: usize) -> Result<Vec<MaskPath>> {
            *self.0.borrow_mut() = inverted.to_vec();
            Ok(vec![MaskPath {
                points: vec![(0.0, 0.0), (width as f32, height as f32)],
                outer: true,
            }])
        }
    }

    #[test]
    fn vectorizer_receives_inverted_mask() -> Result<()> {
        let rec = Recorder(RefCell::new(Vec::new()));
        let mask = Mask {
            data: vec![1.0, 0.0, 0.25, 0.5],
            width: 2,
            height: 2,
        };
        let paths = vectorize_mask(&rec, &mask)?;
        assert_eq!(paths.len(), 1);
        assert_eq!(*rec.0.borrow(), vec![0.0, 1.0, 0.75, 0.5]);
        Ok(())
    }

    #[test]
    fn pipeline_keeps_seeded_blob_only() -> Result<()> {
        let (w, h) = (16, 8);
        let mut m = vec![0.0f32; w * h];
        for y in 1..6 {
            for x in 1..6 {
                m[y * w + x] = 0.9;
            }
            for x in 9..14 {
                m[y * w + x] = 0.9;
            }
        }
        let settings = MaskSettings::new(0.5, 1, 1, 0.3);
        let rgb = RgbImage::from_pixel(w as u32, h as u32, Rgb([10, 10, 10]));
        postprocess(&mut m, w, h, Some(&rgb), &settings, (11, 3))?;
        assert_eq!(m[3 * w + 3], 0.0);
        assert_eq!(m[3 * w + 11], 1.0);
        Ok(())
    }

    #[test]
    fn size_mismatch_rejected() {
        let mut m = vec![0.0; 5];
        let r = postprocess(&mut m, 2, 2, None, &MaskSettings::default(), (0, 0));
        assert!(matches!(r, Err(SegError::Validation { .. })));
    }
}
