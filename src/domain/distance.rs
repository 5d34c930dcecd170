use serde::Serialize;
use thiserror::Error;

use crate::domain::pdf::{ks_statistic, IntensityPdf};
use crate::domain::powerspec::PowerSpectrum;
use crate::domain::scf::ScfResult;

/// Comparisons demand identical binning; these errors say which side to
/// rebuild instead of producing a silently wrong number.
#[derive(Debug, Error)]
pub enum CompareError {
    #[error("PDF bin edges differ ({left} vs {right} bins); rebuild both PDFs on shared edges")]
    PdfBinMismatch { left: usize, right: usize },
    #[error("SCF lag grids differ (max lag {left} vs {right})")]
    ScfLagMismatch { left: usize, right: usize },
}

/// t-statistic between two fitted power-spectrum slopes.
pub fn power_spectrum_distance(a: &PowerSpectrum, b: &PowerSpectrum) -> f64 {
    let denom = (a.slope_err.powi(2) + b.slope_err.powi(2)).sqrt().max(1e-12);
    (a.slope - b.slope).abs() / denom
}

/// Mean absolute difference of the SCF surfaces, weighted by 1/|lag| so the
/// tightly-correlated small separations dominate.
pub fn scf_distance(a: &ScfResult, b: &ScfResult) -> Result<f64, CompareError> {
    if a.max_lag != b.max_lag {
        return Err(CompareError::ScfLagMismatch {
            left: a.max_lag,
            right: b.max_lag,
        });
    }

    let l = a.max_lag as i64;
    let mut weighted = 0.0f64;
    let mut weight_sum = 0.0f64;

    for dy in -l..=l {
        for dx in -l..=l {
            if dy == 0 && dx == 0 {
                continue;
            }
            let sa = a.surface[[(dy + l) as usize, (dx + l) as usize]];
            let sb = b.surface[[(dy + l) as usize, (dx + l) as usize]];
            if !sa.is_finite() || !sb.is_finite() {
                continue;
            }
            let w = 1.0 / ((dy * dy + dx * dx) as f64).sqrt();
            weighted += w * (sa - sb).abs();
            weight_sum += w;
        }
    }

    if weight_sum > 0.0 {
        Ok(weighted / weight_sum)
    } else {
        Ok(f64::NAN)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PdfDistance {
    pub hellinger: f64,
    pub ks: f64,
}

/// Hellinger distance on the shared bins plus the two-sample KS statistic.
pub fn pdf_distance(a: &IntensityPdf, b: &IntensityPdf) -> Result<PdfDistance, CompareError> {
    if a.edges.len() != b.edges.len()
        || a.edges
            .iter()
            .zip(b.edges.iter())
            .any(|(x, y)| (x - y).abs() > 1e-9 * x.abs().max(1.0))
    {
        return Err(CompareError::PdfBinMismatch {
            left: a.edges.len().saturating_sub(1),
            right: b.edges.len().saturating_sub(1),
        });
    }

    let pa = a.mass();
    let pb = b.mass();
    let bc: f64 = pa
        .iter()
        .zip(pb.iter())
        .map(|(p, q)| (p * q).sqrt())
        .sum();
    let hellinger = (1.0 - bc.min(1.0)).max(0.0).sqrt();

    let ks = ks_statistic(&a.samples_sorted, &b.samples_sorted);

    Ok(PdfDistance { hellinger, ks })
}

/// One row of the pairwise comparison matrix.
#[derive(Debug, Clone, Serialize)]
pub struct PairDistances {
    pub a: String,
    pub b: String,
    pub power_spectrum: f64,
    pub scf: f64,
    pub pdf_hellinger: f64,
    pub pdf_ks: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pdf::{intensity_pdf, normalized_samples, shared_log_edges};
    use crate::domain::powerspec::compute_power_spectrum;
    use crate::domain::scf::scf;
    use crate::domain::synth::{powerlaw_field, synthetic_cube};

    #[test]
    fn test_power_spectrum_distance_symmetric_and_zero_on_self() {
        let a = compute_power_spectrum(&powerlaw_field(64, 64, -3.0, 2), 0.03, 0.4).unwrap();
        let b = compute_power_spectrum(&powerlaw_field(64, 64, -2.0, 3), 0.03, 0.4).unwrap();
        assert!(power_spectrum_distance(&a, &a) < 1e-12);
        let d1 = power_spectrum_distance(&a, &b);
        let d2 = power_spectrum_distance(&b, &a);
        assert!((d1 - d2).abs() < 1e-12);
        assert!(d1 > 0.0);
    }

    #[test]
    fn test_scf_distance_zero_on_self() {
        let cube = synthetic_cube(6, 24, 24, -3.0, 0.7, 0.5, 5);
        let s = scf(&cube, 4).unwrap();
        assert!(scf_distance(&s, &s).unwrap() < 1e-12);
    }

    #[test]
    fn test_scf_distance_detects_different_cubes() {
        let a = scf(&synthetic_cube(6, 24, 24, -3.5, 0.9, 0.5, 5), 4).unwrap();
        let b = scf(&synthetic_cube(6, 24, 24, -2.0, 0.2, 0.5, 6), 4).unwrap();
        let d = scf_distance(&a, &b).unwrap();
        assert!(d > 0.0);
    }

    #[test]
    fn test_scf_distance_rejects_mismatched_lags() {
        let cube = synthetic_cube(6, 24, 24, -3.0, 0.7, 0.5, 5);
        let a = scf(&cube, 3).unwrap();
        let b = scf(&cube, 4).unwrap();
        match scf_distance(&a, &b) {
            Err(CompareError::ScfLagMismatch { left: 3, right: 4 }) => {}
            other => panic!("expected lag mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_pdf_distance_zero_on_self_and_bounded() {
        let map_a = powerlaw_field(64, 64, -3.0, 7).mapv(|g| (0.5 * g).exp());
        let map_b = powerlaw_field(64, 64, -3.0, 8).mapv(|g| (1.2 * g).exp());

        let sa = normalized_samples(&map_a);
        let sb = normalized_samples(&map_b);
        let edges = shared_log_edges(&[&sa, &sb], 48).unwrap();

        let pa = intensity_pdf(&map_a, &edges).unwrap();
        let pb = intensity_pdf(&map_b, &edges).unwrap();

        let self_d = pdf_distance(&pa, &pa).unwrap();
        assert!(self_d.hellinger < 1e-12);
        assert!(self_d.ks < 1e-12);

        let cross = pdf_distance(&pa, &pb).unwrap();
        assert!(cross.hellinger > 0.0 && cross.hellinger <= 1.0);
        assert!(cross.ks > 0.0 && cross.ks <= 1.0);
    }

    #[test]
    fn test_pdf_distance_rejects_different_edges() {
        let map = powerlaw_field(64, 64, -3.0, 9).mapv(|g| (0.5 * g).exp());
        let samples = normalized_samples(&map);
        let edges_a = shared_log_edges(&[&samples], 32).unwrap();
        let edges_b = shared_log_edges(&[&samples], 48).unwrap();

        let pa = intensity_pdf(&map, &edges_a).unwrap();
        let pb = intensity_pdf(&map, &edges_b).unwrap();
        assert!(matches!(
            pdf_distance(&pa, &pb),
            Err(CompareError::PdfBinMismatch { .. })
        ));
    }
}
