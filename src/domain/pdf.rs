use anyhow::{bail, Result};
use ndarray::Array2;
use serde::Serialize;

use crate::domain::stats::{histogram, is_valid, log_edges};

/// Normalized-intensity probability distribution of a map, with a
/// log-normal moment fit. Built on explicit bin edges so two datasets can
/// be compared bin by bin.
#[derive(Debug, Clone, Serialize)]
pub struct IntensityPdf {
    pub edges: Vec<f64>,
    pub counts: Vec<u64>,
    pub density: Vec<f64>,
    /// Mean of ln(I/<I>).
    pub lognormal_mean: f64,
    /// Standard deviation of ln(I/<I>).
    pub lognormal_sigma: f64,
    pub sample_count: usize,
    #[serde(skip)]
    pub samples_sorted: Vec<f32>,
}

/// Positive valid intensities divided by their mean.
pub fn normalized_samples(image: &Array2<f32>) -> Vec<f32> {
    let positive: Vec<f32> = image
        .iter()
        .copied()
        .filter(|&v| is_valid(v) && v > 0.0)
        .collect();
    if positive.is_empty() {
        return positive;
    }
    let mean = positive.iter().map(|&v| v as f64).sum::<f64>() / positive.len() as f64;
    positive.iter().map(|&v| (v as f64 / mean) as f32).collect()
}

/// Log-spaced edges spanning every sample set, so all PDFs built from them
/// share binning.
pub fn shared_log_edges(sample_sets: &[&[f32]], bins: usize) -> Result<Vec<f64>> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for set in sample_sets {
        for &v in set.iter() {
            let v = v as f64;
            if v > 0.0 {
                min = min.min(v);
                max = max.max(v);
            }
        }
    }
    if !min.is_finite() || !max.is_finite() || min >= max {
        bail!("No positive samples to build shared PDF bins from");
    }
    Ok(log_edges(min, max, bins))
}

pub fn intensity_pdf(image: &Array2<f32>, edges: &[f64]) -> Result<IntensityPdf> {
    let mut samples = normalized_samples(image);
    if samples.len() < 16 {
        bail!(
            "PDF needs more positive pixels: found {} in a {:?} map",
            samples.len(),
            image.dim()
        );
    }
    if edges.len() < 3 {
        bail!("PDF needs at least 2 bins, got {}", edges.len().saturating_sub(1));
    }

    let values: Vec<f64> = samples.iter().map(|&v| v as f64).collect();
    let hist = histogram(&values, edges);
    if hist.total == 0 {
        bail!("All samples fall outside the shared PDF bins");
    }

    let logs: Vec<f64> = values.iter().map(|v| v.ln()).collect();
    let n = logs.len() as f64;
    let mean = logs.iter().sum::<f64>() / n;
    let var = logs.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;

    samples.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Ok(IntensityPdf {
        edges: hist.edges.clone(),
        density: hist.density(),
        counts: hist.counts,
        lognormal_mean: mean,
        lognormal_sigma: var.sqrt(),
        sample_count: samples.len(),
        samples_sorted: samples,
    })
}

impl IntensityPdf {
    /// Probability mass per bin.
    pub fn mass(&self) -> Vec<f64> {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts
            .iter()
            .map(|&c| c as f64 / total as f64)
            .collect()
    }
}

/// Two-sample Kolmogorov-Smirnov statistic over sorted sample vectors.
pub fn ks_statistic(a_sorted: &[f32], b_sorted: &[f32]) -> f64 {
    if a_sorted.is_empty() || b_sorted.is_empty() {
        return 1.0;
    }

    let na = a_sorted.len() as f64;
    let nb = b_sorted.len() as f64;
    let mut ia = 0usize;
    let mut ib = 0usize;
    let mut sup = 0.0f64;

    while ia < a_sorted.len() && ib < b_sorted.len() {
        if a_sorted[ia] < b_sorted[ib] {
            ia += 1;
        } else if b_sorted[ib] < a_sorted[ia] {
            ib += 1;
        } else {
            // ties advance both walks past the shared value
            let v = a_sorted[ia];
            while ia < a_sorted.len() && a_sorted[ia] == v {
                ia += 1;
            }
            while ib < b_sorted.len() && b_sorted[ib] == v {
                ib += 1;
            }
        }
        let fa = ia as f64 / na;
        let fb = ib as f64 / nb;
        sup = sup.max((fa - fb).abs());
    }

    sup
}
