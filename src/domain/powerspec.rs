use anyhow::{bail, Result};
use ndarray::Array2;
use num_complex::Complex;
use serde::Serialize;

use crate::domain::fft::{fft2_forward, fft_shift};
use crate::domain::stats::is_valid;

/// Azimuthally averaged spatial power spectrum with a power-law fit over a
/// fractional-frequency range (cycles per pixel).
#[derive(Debug, Clone, Serialize)]
pub struct PowerSpectrum {
    pub freqs: Vec<f64>,
    pub power: Vec<f64>,
    pub counts: Vec<u64>,
    pub slope: f64,
    pub slope_err: f64,
    pub intercept: f64,
    pub fit_low: f64,
    pub fit_high: f64,
}

/// |FFT|^2 of the mean-subtracted field, DC at the center. Blank pixels are
/// filled with the field mean so they contribute no power.
pub fn power_spectrum_2d(image: &Array2<f32>) -> Array2<f32> {
    let (rows, cols) = image.dim();

    let mut sum = 0.0f64;
    let mut count = 0u64;
    for &v in image.iter() {
        if is_valid(v) {
            sum += v as f64;
            count += 1;
        }
    }
    let mean = if count > 0 { (sum / count as f64) as f32 } else { 0.0 };

    let mut buf: Vec<Complex<f32>> = image
        .iter()
        .map(|&v| {
            if is_valid(v) {
                Complex::new(v - mean, 0.0)
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect();

    fft2_forward(&mut buf, rows, cols);
    fft_shift(&mut buf, rows, cols);

    let power: Vec<f32> = buf.iter().map(|c| c.norm_sqr()).collect();
    Array2::from_shape_vec((rows, cols), power).expect("power buffer matches image shape")
}

/// Collapse a centered 2D power spectrum into radial bins of the fractional
/// spatial frequency |k| (cycles per pixel, up to the Nyquist 0.5).
pub fn azimuthal_average(ps2d: &Array2<f32>) -> (Vec<f64>, Vec<f64>, Vec<u64>) {
    let (rows, cols) = ps2d.dim();
    let cy = rows / 2;
    let cx = cols / 2;

    let nbins = (rows.min(cols) / 2).max(1);
    let width = 0.5 / nbins as f64;

    let mut power = vec![0.0f64; nbins];
    let mut counts = vec![0u64; nbins];

    for y in 0..rows {
        for x in 0..cols {
            let ky = (y as f64 - cy as f64) / rows as f64;
            let kx = (x as f64 - cx as f64) / cols as f64;
            let kr = (ky * ky + kx * kx).sqrt();
            if kr == 0.0 {
                continue;
            }
            let bin = (kr / width) as usize;
            if bin < nbins {
                power[bin] += ps2d[[y, x]] as f64;
                counts[bin] += 1;
            }
        }
    }

    let freqs: Vec<f64> = (0..nbins).map(|i| (i as f64 + 0.5) * width).collect();
    let mean_power: Vec<f64> = power
        .iter()
        .zip(counts.iter())
        .map(|(&p, &c)| if c > 0 { p / c as f64 } else { 0.0 })
        .collect();

    (freqs, mean_power, counts)
}

#[derive(Debug, Clone, Copy)]
pub struct PowerLawFit {
    pub slope: f64,
    pub slope_err: f64,
    pub intercept: f64,
}

/// Weighted least squares of log10(power) against log10(freq) over
/// [lo, hi], weighting each radial bin by its pixel count.
pub fn fit_power_law(
    freqs: &[f64],
    power: &[f64],
    counts: &[u64],
    lo: f64,
    hi: f64,
) -> Result<PowerLawFit> {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut ws = Vec::new();
    for i in 0..freqs.len() {
        if freqs[i] < lo || freqs[i] > hi || power[i] <= 0.0 || counts[i] == 0 {
            continue;
        }
        xs.push(freqs[i].log10());
        ys.push(power[i].log10());
        ws.push(counts[i] as f64);
    }

    let n = xs.len();
    if n < 3 {
        bail!(
            "Power-law fit needs at least 3 bins in [{:.3}, {:.3}], found {}",
            lo,
            hi,
            n
        );
    }

    let wsum: f64 = ws.iter().sum();
    let xbar = xs.iter().zip(&ws).map(|(x, w)| x * w).sum::<f64>() / wsum;
    let ybar = ys.iter().zip(&ws).map(|(y, w)| y * w).sum::<f64>() / wsum;

    let sxx: f64 = xs.iter().zip(&ws).map(|(x, w)| w * (x - xbar).powi(2)).sum();
    if sxx <= 0.0 {
        bail!("Degenerate frequency range for power-law fit");
    }
    let sxy: f64 = xs
        .iter()
        .zip(ys.iter())
        .zip(&ws)
        .map(|((x, y), w)| w * (x - xbar) * (y - ybar))
        .sum();

    let slope = sxy / sxx;
    let intercept = ybar - slope * xbar;

    let chi2: f64 = xs
        .iter()
        .zip(ys.iter())
        .zip(&ws)
        .map(|((x, y), w)| {
            let r = y - (intercept + slope * x);
            w * r * r
        })
        .sum();
    let residual_var = chi2 / (n as f64 - 2.0);
    let slope_err = (residual_var / sxx).sqrt();

    Ok(PowerLawFit {
        slope,
        slope_err,
        intercept,
    })
}

pub fn spectrum_from_2d(ps2d: &Array2<f32>, fit_low: f64, fit_high: f64) -> Result<PowerSpectrum> {
    let (freqs, power, counts) = azimuthal_average(ps2d);
    let fit = fit_power_law(&freqs, &power, &counts, fit_low, fit_high)?;

    Ok(PowerSpectrum {
        freqs,
        power,
        counts,
        slope: fit.slope,
        slope_err: fit.slope_err,
        intercept: fit.intercept,
        fit_low,
        fit_high,
    })
}

pub fn compute_power_spectrum(
    image: &Array2<f32>,
    fit_low: f64,
    fit_high: f64,
) -> Result<PowerSpectrum> {
    let ps2d = power_spectrum_2d(image);
    spectrum_from_2d(&ps2d, fit_low, fit_high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_azimuthal_bins_cover_nyquist() {
        let ps = Array2::from_elem((64, 64), 1.0f32);
        let (freqs, power, counts) = azimuthal_average(&ps);
        assert_eq!(freqs.len(), 32);
        assert!(freqs[0] > 0.0);
        assert!(*freqs.last().unwrap() <= 0.5);
        assert!(counts.iter().all(|&c| c > 0));
        for &p in &power {
            assert!((p - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fit_recovers_exact_power_law() {
        let freqs: Vec<f64> = (1..40).map(|i| i as f64 * 0.0125).collect();
        let power: Vec<f64> = freqs.iter().map(|f| 10.0 * f.powf(-2.5)).collect();
        let counts = vec![10u64; freqs.len()];
        let fit = fit_power_law(&freqs, &power, &counts, 0.02, 0.45).unwrap();
        assert!((fit.slope - (-2.5)).abs() < 1e-9);
        assert!(fit.slope_err < 1e-6);
    }

    #[test]
    fn test_fit_rejects_sparse_range() {
        let freqs = vec![0.1, 0.2];
        let power = vec![1.0, 0.5];
        let counts = vec![5u64, 5];
        assert!(fit_power_law(&freqs, &power, &counts, 0.05, 0.45).is_err());
    }

    #[test]
    fn test_white_noise_is_flat() {
        let mut rng = StdRng::seed_from_u64(7);
        let image = Array2::from_shape_fn((128, 128), |_| rng.gen::<f32>() - 0.5);
        let ps = compute_power_spectrum(&image, 0.02, 0.45).unwrap();
        assert!(ps.slope.abs() < 0.2, "white noise slope {}", ps.slope);
    }

    #[test]
    fn test_mean_offset_does_not_add_power() {
        let mut rng = StdRng::seed_from_u64(11);
        let base = Array2::from_shape_fn((64, 64), |_| rng.gen::<f32>());
        let shifted = base.mapv(|v| v + 100.0);

        let a = power_spectrum_2d(&base);
        let b = power_spectrum_2d(&shifted);
        let (_, pa, _) = azimuthal_average(&a);
        let (_, pb, _) = azimuthal_average(&b);
        for (x, y) in pa.iter().zip(pb.iter()) {
            assert!((x - y).abs() < 1e-2 * x.abs().max(1.0));
        }
    }
}
