use std::collections::VecDeque;

use anyhow::{bail, Result};
use ndarray::{Array2, Array3};

use crate::domain::stats::{is_valid, sigma_clipped_stats};

/// Half-open bounding box of the region kept by a trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRect {
    pub y0: usize,
    pub y1: usize,
    pub x0: usize,
    pub x1: usize,
}

impl TrimRect {
    pub fn full(rows: usize, cols: usize) -> Self {
        TrimRect {
            y0: 0,
            y1: rows,
            x0: 0,
            x1: cols,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.y1 - self.y0, self.x1 - self.x0)
    }

    pub fn with_margin(&self, margin: usize, rows: usize, cols: usize) -> TrimRect {
        TrimRect {
            y0: self.y0.saturating_sub(margin),
            y1: (self.y1 + margin).min(rows),
            x0: self.x0.saturating_sub(margin),
            x1: (self.x1 + margin).min(cols),
        }
    }
}

/// Fraction of channels with valid data at each pixel.
pub fn finite_support(cube: &Array3<f32>) -> Array2<f32> {
    let (depth, rows, cols) = cube.dim();
    let mut support = Array2::<f32>::zeros((rows, cols));
    for z in 0..depth {
        for y in 0..rows {
            for x in 0..cols {
                if is_valid(cube[[z, y, x]]) {
                    support[[y, x]] += 1.0;
                }
            }
        }
    }
    support.mapv_into(|c| c / depth as f32)
}

/// Pixels considered part of the map. Without a threshold this is simply
/// "has any valid data"; with one, pixels must also sit above
/// median + k*sigma of the sigma-clipped background.
pub fn signal_mask(image: &Array2<f32>, threshold_sigma: Option<f64>) -> Array2<bool> {
    match threshold_sigma {
        None => image.mapv(|v| is_valid(v) && v > 0.0),
        Some(kappa) => {
            let mut vals: Vec<f32> = image.iter().copied().filter(|&v| is_valid(v)).collect();
            let (median, sigma) = sigma_clipped_stats(&mut vals, 3.0, 3);
            let cut = (median + kappa * sigma) as f32;
            image.mapv(|v| is_valid(v) && v > cut)
        }
    }
}

/// Bounding box of the largest 8-connected true component.
pub fn largest_component_bbox(mask: &Array2<bool>) -> Option<TrimRect> {
    let (rows, cols) = mask.dim();
    let mut visited = Array2::<bool>::default((rows, cols));
    let mut best: Option<(usize, TrimRect)> = None;

    for r in 0..rows {
        for c in 0..cols {
            if !mask[[r, c]] || visited[[r, c]] {
                continue;
            }

            let mut queue = VecDeque::new();
            queue.push_back((r, c));
            visited[[r, c]] = true;

            let mut count = 0usize;
            let mut rect = TrimRect {
                y0: r,
                y1: r + 1,
                x0: c,
                x1: c + 1,
            };

            while let Some((cr, cc)) = queue.pop_front() {
                count += 1;
                rect.y0 = rect.y0.min(cr);
                rect.y1 = rect.y1.max(cr + 1);
                rect.x0 = rect.x0.min(cc);
                rect.x1 = rect.x1.max(cc + 1);

                for (dr, dc) in &[
                    (-1i32, 0i32),
                    (1, 0),
                    (0, -1),
                    (0, 1),
                    (-1, -1),
                    (-1, 1),
                    (1, -1),
                    (1, 1),
                ] {
                    let nr = cr as i32 + dr;
                    let nc = cc as i32 + dc;
                    if nr < 0 || nc < 0 || nr >= rows as i32 || nc >= cols as i32 {
                        continue;
                    }
                    let nr = nr as usize;
                    let nc = nc as usize;
                    if mask[[nr, nc]] && !visited[[nr, nc]] {
                        visited[[nr, nc]] = true;
                        queue.push_back((nr, nc));
                    }
                }
            }

            let better = match &best {
                Some((best_count, _)) => count > *best_count,
                None => true,
            };
            if better {
                best = Some((count, rect));
            }
        }
    }

    best.map(|(_, rect)| rect)
}

/// Where a cube actually has data: largest connected patch of supported
/// pixels, padded by `margin` and clamped to the map.
pub fn data_extent(
    cube: &Array3<f32>,
    threshold_sigma: Option<f64>,
    margin: usize,
) -> Result<TrimRect> {
    let (_, rows, cols) = cube.dim();
    let support = finite_support(cube);
    let mask = signal_mask(&support, threshold_sigma);

    match largest_component_bbox(&mask) {
        Some(rect) => Ok(rect.with_margin(margin, rows, cols)),
        None => bail!("Cube contains no valid pixels to trim around"),
    }
}
