/// Zero every foreground component except the one containing `seed`.
///
/// Foreground is `> threshold`. Components are 4-connected and labelled with an
/// explicit stack. When the seed is background, the largest component is kept.
/// Labelling stops once `i16::MAX` components exist; unlabelled pixels count as
/// discarded.
pub fn keep_seed_component(
    mask: &mut [f32],
    width: usize,
    height: usize,
    threshold: f32,
    seed: (usize, usize),
) {
    let n = width * height;
    if n == 0 || mask.len() != n {
        return;
    }
    let seed_idx = seed.1.min(height - 1) * width + seed.0.min(width - 1);

    let mut labels = vec![0i16; n];
    let mut stack = Vec::new();
    let mut n_labels: i16 = 0;
    let mut seed_label: i16 = 0;
    let (mut best_label, mut best_area) = (0i16, 0usize);

    for start in 0..n {
        if mask[start] <= threshold || labels[start] != 0 {
            continue;
        }
        if n_labels >= i16::MAX {
            break;
        }
        n_labels += 1;
        let label = n_labels;
        let mut area = 0usize;

        labels[start] = label;
        stack.push(start);
        while let Some(i) = stack.pop() {
            area += 1;
            if i == seed_idx {
                seed_label = label;
            }
            let (x, y) = (i % width, i / width);
            let neighbours = [
                (x > 0).then(|| i - 1),
                (x + 1 < width).then(|| i + 1),
                (y > 0).then(|| i - width),
                (y + 1 < height).then(|| i + width),
            ];
            for j in neighbours.into_iter().flatten() {
                if mask[j] > threshold && labels[j] == 0 {
                    labels[j] = label;
                    stack.push(j);
                }
            }
        }

        if area > best_area {
            best_area = area;
            best_label = label;
        }
    }

    let keep = if seed_label > 0 { seed_label } else { best_label };
    if keep == 0 {
        return;
    }
    for (m, &l) in mask.iter_mut().zip(&labels) {
        if *m > threshold && l != keep {
            *m = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<f32> {
        // 8x4: a 2x2 blob at the left, a 3x3 blob at the right
        let mut m = vec![0.0f32; 32];
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            m[y * 8 + x] = 0.9;
        }
        for y in 0..3 {
            for x in 5..8 {
                m[y * 8 + x] = 0.8;
            }
        }
        m
    }

    #[test]
    fn keeps_only_seeded_blob() {
        let mut m = two_blobs();
        keep_seed_component(&mut m, 8, 4, 0.5, (1, 1));
        let fg: Vec<usize> = (0..32).filter(|&i| m[i] > 0.5).collect();
        assert_eq!(fg, vec![0, 1, 8, 9]);
        // kept pixels keep their value
        assert_eq!(m[0], 0.9);
    }

    #[test]
    fn background_seed_keeps_largest() {
        let mut m = two_blobs();
        keep_seed_component(&mut m, 8, 4, 0.5, (3, 3));
        assert_eq!((0..32).filter(|&i| m[i] > 0.5).count(), 9);
        assert_eq!(m[0], 0.0);
    }

    #[test]
    fn diagonal_pixels_are_separate() {
        let mut m = vec![1.0, 0.0, 0.0, 1.0];
        keep_seed_component(&mut m, 2, 2, 0.5, (1, 1));
        assert_eq!(m, vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn empty_mask_untouched() {
        let mut m = vec![0.2f32; 9];
        keep_seed_component(&mut m, 3, 3, 0.5, (1, 1));
        assert!(m.iter().all(|&v| v == 0.2));
    }
}
