use rayon::prelude::*;

#[derive(Clone, Copy)]
enum Op {
    Erode,
    Dilate,
}

impl Op {
    fn combine(self, a: u8, b: u8) -> u8 {
        match self {
            Self::Erode => a & b,
            Self::Dilate => a | b,
        }
    }
}

/// Square-kernel erode/dilate as two separable passes. Windows are clipped at
/// the image border.
fn apply(src: &[u8], width: usize, height: usize, radius: usize, op: Op) -> Vec<u8> {
    let mut horiz = vec![0u8; src.len()];
    horiz
        .par_chunks_mut(width)
        .zip(src.par_chunks(width))
        .for_each(|(out, row)| {
            for (x, o) in out.iter_mut().enumerate() {
                let lo = x.saturating_sub(radius);
                let hi = (x + radius).min(width - 1);
                *o = row[lo..=hi].iter().copied().reduce(|a, b| op.combine(a, b)).unwrap_or(0);
            }
        });

    let mut out = vec![0u8; src.len()];
    out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let lo = y.saturating_sub(radius);
        let hi = (y + radius).min(height - 1);
        for (x, o) in row.iter_mut().enumerate() {
            *o = (lo..=hi)
                .map(|yy| horiz[yy * width + x])
                .reduce(|a, b| op.combine(a, b))
                .unwrap_or(0);
        }
    });
    out
}

pub fn erode(src: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
    apply(src, width, height, radius, Op::Erode)
}

pub fn dilate(src: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
    apply(src, width, height, radius, Op::Dilate)
}

/// Morphological open then close on the binarized mask, merged back into the
/// float mask. Pixels whose binary state did not change keep their value.
pub fn open_close(mask: &mut [f32], width: usize, height: usize, threshold: f32, radius: usize) {
    if radius == 0 || width == 0 || height == 0 || mask.len() != width * height {
        return;
    }
    let bin: Vec<u8> = mask.par_iter().map(|&m| u8::from(m > threshold)).collect();

    let opened = dilate(&erode(&bin, width, height, radius), width, height, radius);
    let closed = erode(&dilate(&opened, width, height, radius), width, height, radius);

    mask.par_iter_mut().zip(closed.par_iter()).for_each(|(m, &b)| {
        if b == 1 && *m <= threshold {
            *m = 1.0;
        } else if b == 0 && *m > threshold {
            *m = 0.0;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 24;
    const H: usize = 24;

    fn at(m: &[f32], x: usize, y: usize) -> f32 {
        m[y * W + x]
    }

    #[test]
    fn open_removes_thin_protrusion_keeps_island() {
        let r = 2;
        let mut m = vec![0.0f32; W * H];
        // 12x12 island
        for y in 6..18 {
            for x in 6..18 {
                m[y * W + x] = 0.8;
            }
        }
        // 2 px wide spur sticking out to the right (thinner than 2r+1)
        for y in 11..13 {
            for x in 18..23 {
                m[y * W + x] = 0.8;
            }
        }
        open_close(&mut m, W, H, 0.5, r);

        for x in 19..23 {
            assert_eq!(at(&m, x, 11), 0.0, "spur pixel at x={x}");
        }
        for y in 9..15 {
            for x in 9..15 {
                assert_eq!(at(&m, x, y), 0.8);
            }
        }
    }

    #[test]
    fn close_fills_small_hole() {
        let mut m = vec![0.9f32; W * H];
        m[10 * W + 10] = 0.1;
        open_close(&mut m, W, H, 0.5, 1);
        assert_eq!(at(&m, 10, 10), 1.0);
        assert_eq!(at(&m, 3, 3), 0.9);
    }

    #[test]
    fn erode_dilate_clip_at_border() {
        let src = vec![1u8; 9];
        assert_eq!(erode(&src, 3, 3, 1), src);
        let mut one = vec![0u8; 9];
        one[4] = 1;
        assert_eq!(dilate(&one, 3, 3, 1), vec![1u8; 9]);
    }

    #[test]
    fn zero_radius_is_noop() {
        let mut m = vec![0.6, 0.1, 0.7, 0.2];
        open_close(&mut m, 2, 2, 0.5, 0);
        assert_eq!(m, vec![0.6, 0.1, 0.7, 0.2]);
    }
}
