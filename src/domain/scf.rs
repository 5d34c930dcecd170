use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3};
use rayon::prelude::*;
use serde::Serialize;

use crate::domain::powerspec::fit_power_law;

/// Spectral correlation function over an odd grid of spatial lags:
/// S(l) = 1 - <sqrt(sum_v (s(r) - s(r+l))^2 / (sum_v s(r)^2 + sum_v s(r+l)^2))>_r
/// Identical spectra give S = 1; decorrelated spectra pull S toward 0.
#[derive(Debug, Clone, Serialize)]
pub struct ScfResult {
    pub max_lag: usize,
    /// Lag offsets along both axes, -max_lag..=max_lag.
    pub lags: Vec<i64>,
    /// S at [dy + max_lag, dx + max_lag].
    pub surface: Array2<f64>,
    pub radii: Vec<f64>,
    pub profile: Vec<f64>,
    pub slope: f64,
    pub slope_err: f64,
}

pub fn scf(cube: &Array3<f32>, max_lag: usize) -> Result<ScfResult> {
    let (depth, rows, cols) = cube.dim();
    if max_lag < 3 {
        bail!("SCF needs max_lag >= 3 to fit a slope, got {}", max_lag);
    }
    if 2 * max_lag >= rows.min(cols) {
        bail!(
            "SCF lag {} too large for a {}x{} map",
            max_lag,
            rows,
            cols
        );
    }

    let l = max_lag as i64;
    let lag_list: Vec<(i64, i64)> = (-l..=l)
        .flat_map(|dy| (-l..=l).map(move |dx| (dy, dx)))
        .collect();

    let values: Vec<f64> = lag_list
        .par_iter()
        .map(|&(dy, dx)| scf_at_lag(cube, depth, rows, cols, dy, dx))
        .collect();

    let size = 2 * max_lag + 1;
    let mut surface = Array2::<f64>::zeros((size, size));
    for (i, &(dy, dx)) in lag_list.iter().enumerate() {
        surface[[(dy + l) as usize, (dx + l) as usize]] = values[i];
    }

    let (radii, profile) = azimuthal_profile(&surface, max_lag);
    let counts = vec![1u64; radii.len()];
    let fit = fit_power_law(&radii, &profile, &counts, 0.5, max_lag as f64 + 0.5)
        .context("SCF slope fit failed")?;

    Ok(ScfResult {
        max_lag,
        lags: (-l..=l).collect(),
        surface,
        radii,
        profile,
        slope: fit.slope,
        slope_err: fit.slope_err,
    })
}

fn scf_at_lag(
    cube: &Array3<f32>,
    depth: usize,
    rows: usize,
    cols: usize,
    dy: i64,
    dx: i64,
) -> f64 {
    let y_start = (-dy).max(0) as usize;
    let y_end = (rows as i64 - dy.max(0)) as usize;
    let x_start = (-dx).max(0) as usize;
    let x_end = (cols as i64 - dx.max(0)) as usize;

    let mut total = 0.0f64;
    let mut used = 0u64;

    for y in y_start..y_end {
        let sy = (y as i64 + dy) as usize;
        for x in x_start..x_end {
            let sx = (x as i64 + dx) as usize;

            let mut num = 0.0f64;
            let mut den = 0.0f64;
            let mut channels = 0usize;
            for z in 0..depth {
                let a = cube[[z, y, x]];
                let b = cube[[z, sy, sx]];
                if a.is_finite() && b.is_finite() {
                    let d = (a - b) as f64;
                    num += d * d;
                    den += (a as f64) * (a as f64) + (b as f64) * (b as f64);
                    channels += 1;
                }
            }

            if channels > 0 && den > 0.0 {
                total += (num / den).sqrt();
                used += 1;
            }
        }
    }

    if used == 0 {
        return f64::NAN;
    }
    1.0 - total / used as f64
}

/// Mean S over rings of integer lag radius 1..=max_lag.
fn azimuthal_profile(surface: &Array2<f64>, max_lag: usize) -> (Vec<f64>, Vec<f64>) {
    let l = max_lag as i64;
    let mut sums = vec![0.0f64; max_lag];
    let mut counts = vec![0u64; max_lag];

    for dy in -l..=l {
        for dx in -l..=l {
            let r = ((dy * dy + dx * dx) as f64).sqrt();
            let bin = r.round() as usize;
            if bin == 0 || bin > max_lag {
                continue;
            }
            let s = surface[[(dy + l) as usize, (dx + l) as usize]];
            if s.is_finite() {
                sums[bin - 1] += s;
                counts[bin - 1] += 1;
            }
        }
    }

    let mut radii = Vec::new();
    let mut profile = Vec::new();
    for i in 0..max_lag {
        if counts[i] > 0 {
            radii.push((i + 1) as f64);
            profile.push(sums[i] / counts[i] as f64);
        }
    }
    (radii, profile)
}
