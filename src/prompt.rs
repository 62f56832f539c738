//! Prompt construction helpers: boxes, brush strokes and post-processing seeds.

use crate::segmentation::{PointLabel, SegPoint};

const MIN_STROKE_POINTS: usize = 3;
const MAX_STROKE_POINTS: usize = 32;

/// Two corner points describing a box. Corners are normalised so the first is
/// the top-left one.
pub fn box_prompt(x0: f32, y0: f32, x1: f32, y1: f32) -> [SegPoint; 2] {
    [
        SegPoint::new(x0.min(x1), y0.min(y1), PointLabel::BoxTopLeft),
        SegPoint::new(x0.max(x1), y0.max(y1), PointLabel::BoxBottomRight),
    ]
}

/// Pixel used to pick the component kept by post-processing.
///
/// The most recent foreground point wins, then the centre of the most recent
/// box, then the mask centre. Always inside `width x height`.
pub fn seed_from_points(points: &[SegPoint], width: usize, height: usize) -> (usize, usize) {
    let clamp = |x: f32, y: f32| {
        let cx = (x.max(0.0) as usize).min(width.saturating_sub(1));
        let cy = (y.max(0.0) as usize).min(height.saturating_sub(1));
        (cx, cy)
    };

    if let Some(p) = points.iter().rev().find(|p| p.label == PointLabel::Foreground) {
        return clamp(p.x, p.y);
    }

    let bottom_right = points
        .iter()
        .rposition(|p| p.label == PointLabel::BoxBottomRight);
    if let Some(br) = bottom_right {
        if let Some(tl) = points[..br]
            .iter()
            .rev()
            .find(|p| p.label == PointLabel::BoxTopLeft)
        {
            let b = points[br];
            return clamp((tl.x + b.x) * 0.5, (tl.y + b.y) * 0.5);
        }
    }

    (width / 2, height / 2)
}

/// Turn a freehand stroke into evenly spaced foreground points.
///
/// Spacing follows the stroke's arc length; roughly one point per brush
/// diameter, between 3 and 32 points. The first and last stroke points are
/// always kept.
pub fn resample_brush_stroke(stroke: &[(f32, f32)], brush_diameter: f32) -> Vec<SegPoint> {
    let Some(&(fx, fy)) = stroke.first() else {
        return Vec::new();
    };
    let first = SegPoint::foreground(fx, fy);

    let seg_len = |a: (f32, f32), b: (f32, f32)| ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt();
    let total: f32 = stroke.windows(2).map(|w| seg_len(w[0], w[1])).sum();
    if total < 1.0 {
        return vec![first];
    }

    let target = ((total / brush_diameter.max(1.0)) as usize).clamp(MIN_STROKE_POINTS, MAX_STROKE_POINTS);
    let step = total / (target - 1) as f32;

    let mut out = Vec::with_capacity(target);
    out.push(first);

    let mut next = step;
    let mut walked = 0.0f32;
    'segments: for w in stroke.windows(2) {
        let (a, b) = (w[0], w[1]);
        let len = seg_len(a, b);
        while len > 0.0 && walked + len >= next {
            if out.len() >= target - 1 {
                break 'segments;
            }
            let t = (next - walked) / len;
            out.push(SegPoint::foreground(a.0 + (b.0 - a.0) * t, a.1 + (b.1 - a.1) * t));
            next += step;
        }
        walked += len;
    }

    if let Some(&(lx, ly)) = stroke.last() {
        out.push(SegPoint::foreground(lx, ly));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_corners_normalised() {
        let [tl, br] = box_prompt(50.0, 40.0, 10.0, 80.0);
        assert_eq!((tl.x, tl.y, tl.label), (10.0, 40.0, PointLabel::BoxTopLeft));
        assert_eq!((br.x, br.y, br.label), (50.0, 80.0, PointLabel::BoxBottomRight));
    }

    #[test]
    fn seed_prefers_latest_foreground() {
        let pts = [
            SegPoint::foreground(1.0, 1.0),
            SegPoint::background(5.0, 5.0),
            SegPoint::foreground(7.0, 3.0),
        ];
        assert_eq!(seed_from_points(&pts, 10, 10), (7, 3));
    }

    #[test]
    fn seed_uses_box_centre_then_mask_centre() {
        let b = box_prompt(2.0, 2.0, 6.0, 8.0);
        assert_eq!(seed_from_points(&b, 10, 10), (4, 5));

        let bg = [SegPoint::background(1.0, 1.0)];
        assert_eq!(seed_from_points(&bg, 10, 6), (5, 3));
    }

    #[test]
    fn seed_is_clamped() {
        let pts = [SegPoint::foreground(-4.0, 99.0)];
        assert_eq!(seed_from_points(&pts, 10, 10), (0, 9));
    }

    #[test]
    fn short_stroke_yields_first_point() {
        let pts = resample_brush_stroke(&[(3.0, 3.0), (3.5, 3.0)], 10.0);
        assert_eq!(pts.len(), 1);
        assert_eq!((pts[0].x, pts[0].y), (3.0, 3.0));
        assert!(resample_brush_stroke(&[], 10.0).is_empty());
    }

    #[test]
    fn stroke_spacing_follows_arc_length() {
        // 100 px straight stroke, 20 px brush: 5 points every 25 px
        let pts = resample_brush_stroke(&[(0.0, 0.0), (40.0, 0.0), (100.0, 0.0)], 20.0);
        let xs: Vec<f32> = pts.iter().map(|p| p.x).collect();
        assert_eq!(xs.len(), 5);
        for (x, expected) in xs.iter().zip([0.0, 25.0, 50.0, 75.0, 100.0]) {
            assert!((x - expected).abs() < 1e-3, "{xs:?}");
        }
        assert!(pts.iter().all(|p| p.label == PointLabel::Foreground));
    }

    #[test]
    fn stroke_point_count_is_bounded() {
        let long: Vec<(f32, f32)> = (0..=1000).map(|i| (i as f32, 0.0)).collect();
        assert_eq!(resample_brush_stroke(&long, 1.0).len(), MAX_STROKE_POINTS);
        let short = resample_brush_stroke(&[(0.0, 0.0), (5.0, 0.0)], 50.0);
        assert_eq!(short.len(), MIN_STROKE_POINTS);
    }
}
