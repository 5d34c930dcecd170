use ndarray::Array2;
use rayon::prelude::*;
use serde::Serialize;

use crate::utils::constants::MAD_TO_SIGMA;

/// Blank pixels are NaN. Zeros and negative intensities are real data in
/// radio maps, so finiteness is the only validity test.
#[inline(always)]
pub fn is_valid(v: f32) -> bool {
    v.is_finite()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FieldStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub mad: f64,
    pub sigma: f64,
    pub valid_count: u64,
}

pub fn collect_valid(data: &Array2<f32>) -> Vec<f32> {
    data.iter().copied().filter(|&v| is_valid(v)).collect()
}

pub fn field_stats(data: &Array2<f32>) -> FieldStats {
    let mut valid = collect_valid(data);
    let n = valid.len() as u64;
    if n == 0 {
        return FieldStats::default();
    }

    let median = exact_median_mut(&mut valid);

    let deviations: Vec<f64> = valid
        .par_iter()
        .map(|&v| (v as f64 - median).abs())
        .collect();
    let mad = exact_median_f64(&deviations);
    let sigma = (mad * MAD_TO_SIGMA).max(1e-30);

    struct Accum {
        min: f64,
        max: f64,
        sum: f64,
    }

    let acc = valid
        .par_iter()
        .fold(
            || Accum {
                min: f64::MAX,
                max: f64::MIN,
                sum: 0.0,
            },
            |mut a, &v| {
                let vf = v as f64;
                if vf < a.min {
                    a.min = vf;
                }
                if vf > a.max {
                    a.max = vf;
                }
                a.sum += vf;
                a
            },
        )
        .reduce(
            || Accum {
                min: f64::MAX,
                max: f64::MIN,
                sum: 0.0,
            },
            |a, b| Accum {
                min: a.min.min(b.min),
                max: a.max.max(b.max),
                sum: a.sum + b.sum,
            },
        );

    FieldStats {
        min: acc.min,
        max: acc.max,
        mean: acc.sum / n as f64,
        median,
        mad,
        sigma,
        valid_count: n,
    }
}

/// Iterative kappa-sigma clipping around the median; returns (median, sigma).
pub fn sigma_clipped_stats(values: &mut Vec<f32>, kappa: f32, iterations: usize) -> (f64, f64) {
    for _ in 0..iterations {
        if values.len() < 3 {
            break;
        }

        let median = exact_median_mut(values);
        let sig = mad_sigma(values, median);

        let lo = (median - kappa as f64 * sig) as f32;
        let hi = (median + kappa as f64 * sig) as f32;
        values.retain(|&v| v >= lo && v <= hi);
    }

    if values.is_empty() {
        return (0.0, 1.0);
    }

    let median = exact_median_mut(values);
    (median, mad_sigma(values, median))
}

fn mad_sigma(values: &[f32], median: f64) -> f64 {
    let mut devs: Vec<f32> = values.iter().map(|&v| (v as f64 - median).abs() as f32).collect();
    let mid = devs.len() / 2;
    devs.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    (devs[mid] as f64 * MAD_TO_SIGMA).max(1e-30)
}

pub fn exact_median_mut(data: &mut [f32]) -> f64 {
    let n = data.len();
    if n == 0 {
        return 0.0;
    }
    let mid = n / 2;
    data.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    if n % 2 == 0 {
        let right = data[mid] as f64;
        let left = data[..mid].iter().copied().fold(f32::MIN, f32::max) as f64;
        (left + right) / 2.0
    } else {
        data[mid] as f64
    }
}

pub fn exact_median_f64(data: &[f64]) -> f64 {
    let n = data.len();
    if n == 0 {
        return 0.0;
    }
    let mut buf: Vec<f64> = data.to_vec();
    let mid = n / 2;
    buf.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    if n % 2 == 0 {
        let right = buf[mid];
        let left = buf[..mid].iter().copied().fold(f64::MIN, f64::max);
        (left + right) / 2.0
    } else {
        buf[mid]
    }
}

/// Histogram with explicit edges so two datasets can share binning.
#[derive(Debug, Clone, Serialize)]
pub struct Histogram {
    pub edges: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
}

pub fn linear_edges(min: f64, max: f64, bins: usize) -> Vec<f64> {
    let bins = bins.max(1);
    let width = (max - min) / bins as f64;
    (0..=bins).map(|i| min + i as f64 * width).collect()
}

pub fn log_edges(min: f64, max: f64, bins: usize) -> Vec<f64> {
    let bins = bins.max(1);
    let lmin = min.max(1e-300).log10();
    let lmax = max.max(min * 1.0001).log10();
    let width = (lmax - lmin) / bins as f64;
    (0..=bins)
        .map(|i| 10f64.powf(lmin + i as f64 * width))
        .collect()
}

pub fn histogram(values: &[f64], edges: &[f64]) -> Histogram {
    let bins = edges.len().saturating_sub(1);
    let mut counts = vec![0u64; bins];
    let mut total = 0u64;
    if bins == 0 {
        return Histogram {
            edges: edges.to_vec(),
            counts,
            total,
        };
    }

    for &v in values {
        if !v.is_finite() || v < edges[0] || v > edges[bins] {
            continue;
        }
        let idx = match edges[..bins].partition_point(|&e| e <= v) {
            0 => 0,
            i => i - 1,
        };
        counts[idx] += 1;
        total += 1;
    }

    Histogram {
        edges: edges.to_vec(),
        counts,
        total,
    }
}

impl Histogram {
    /// Probability density: counts normalized so the integral over all bins
    /// is one.
    pub fn density(&self) -> Vec<f64> {
        let bins = self.counts.len();
        let mut out = vec![0.0; bins];
        if self.total == 0 {
            return out;
        }
        for i in 0..bins {
            let width = (self.edges[i + 1] - self.edges[i]).max(1e-300);
            out[i] = self.counts[i] as f64 / (self.total as f64 * width);
        }
        out
    }

    /// Probability mass per bin.
    pub fn mass(&self) -> Vec<f64> {
        if self.total == 0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts
            .iter()
            .map(|&c| c as f64 / self.total as f64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_is_invalid_zero_is_valid() {
        assert!(!is_valid(f32::NAN));
        assert!(!is_valid(f32::INFINITY));
        assert!(is_valid(0.0));
        assert!(is_valid(-1.5));
    }

    #[test]
    fn test_field_stats_known_values() {
        let data =
            Array2::from_shape_vec((1, 7), vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]).unwrap();
        let stats = field_stats(&data);
        assert_eq!(stats.valid_count, 7);
        assert!((stats.median - 4.0).abs() < 1e-6);
        assert!((stats.mad - 2.0).abs() < 1e-6);
        assert!((stats.mean - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_field_stats_skips_nan() {
        let mut data = Array2::from_elem((10, 10), 1.0f32);
        data[[0, 0]] = f32::NAN;
        data[[5, 5]] = f32::NAN;
        let stats = field_stats(&data);
        assert_eq!(stats.valid_count, 98);
    }

    #[test]
    fn test_exact_median_even() {
        let mut vals = vec![1.0f32, 2.0, 3.0, 4.0];
        assert!((exact_median_mut(&mut vals) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_sigma_clipped_with_outliers() {
        let mut vals: Vec<f32> = (1..=100).map(|i| i as f32).collect();
        vals.push(100_000.0);
        let (med, sig) = sigma_clipped_stats(&mut vals, 3.0, 3);
        assert!(med > 40.0 && med < 60.0);
        assert!(sig < 500.0);
    }

    #[test]
    fn test_histogram_totals_and_edges() {
        let edges = linear_edges(0.0, 10.0, 10);
        let values: Vec<f64> = vec![0.5, 1.5, 1.6, 9.9, 10.5, -1.0];
        let hist = histogram(&values, &edges);
        assert_eq!(hist.total, 4);
        assert_eq!(hist.counts[0], 1);
        assert_eq!(hist.counts[1], 2);
        assert_eq!(hist.counts[9], 1);
    }

    #[test]
    fn test_density_integrates_to_one() {
        let edges = log_edges(0.1, 10.0, 16);
        let values: Vec<f64> = (1..=100).map(|i| i as f64 / 20.0).collect();
        let hist = histogram(&values, &edges);
        let integral: f64 = hist
            .density()
            .iter()
            .enumerate()
            .map(|(i, d)| d * (hist.edges[i + 1] - hist.edges[i]))
            .sum();
        assert!((integral - 1.0).abs() < 1e-9);
    }
}
