use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::HduHeader;

/// Elliptical Gaussian beam, FWHM axes in arcseconds, position angle in
/// degrees east of north. FITS stores BMAJ/BMIN/BPA in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    pub major_arcsec: f64,
    pub minor_arcsec: f64,
    #[serde(default)]
    pub pa_deg: f64,
}

#[derive(Debug, Error)]
pub enum BeamError {
    #[error("no beam information: header carries no BMAJ and no override was configured")]
    Missing,
    #[error(
        "cannot smooth to {target_arcsec:.2}\": finer than the native beam {native_arcsec:.2}\""
    )]
    NotResolvable {
        native_arcsec: f64,
        target_arcsec: f64,
    },
}

impl Beam {
    pub fn circular(fwhm_arcsec: f64) -> Self {
        Beam {
            major_arcsec: fwhm_arcsec,
            minor_arcsec: fwhm_arcsec,
            pa_deg: 0.0,
        }
    }

    /// Read BMAJ/BMIN/BPA. A header with BMAJ but no BMIN describes a
    /// circular beam.
    pub fn from_header(header: &HduHeader) -> Option<Self> {
        let major = header.get_f64("BMAJ")? * 3600.0;
        let minor = header.get_f64("BMIN").map(|v| v * 3600.0).unwrap_or(major);
        let pa = header.get_f64("BPA").unwrap_or(0.0);
        Some(Beam {
            major_arcsec: major,
            minor_arcsec: minor,
            pa_deg: pa,
        })
    }

    pub fn to_cards(&self) -> Vec<(String, String)> {
        vec![
            ("BMAJ".into(), format!("{:.10}", self.major_arcsec / 3600.0)),
            ("BMIN".into(), format!("{:.10}", self.minor_arcsec / 3600.0)),
            ("BPA".into(), format!("{:.4}", self.pa_deg)),
        ]
    }

    pub fn geometric_fwhm_arcsec(&self) -> f64 {
        (self.major_arcsec * self.minor_arcsec).sqrt()
    }

    /// The Gaussian that convolves a map at `self` up to `target`:
    /// axis-wise quadrature difference of the FWHMs.
    pub fn kernel_to(&self, target: &Beam) -> Result<Beam, BeamError> {
        const TOL: f64 = 1e-6;
        let maj2 = target.major_arcsec.powi(2) - self.major_arcsec.powi(2);
        let min2 = target.minor_arcsec.powi(2) - self.minor_arcsec.powi(2);
        if maj2 < -TOL || min2 < -TOL {
            return Err(BeamError::NotResolvable {
                native_arcsec: self.geometric_fwhm_arcsec(),
                target_arcsec: target.geometric_fwhm_arcsec(),
            });
        }
        Ok(Beam {
            major_arcsec: maj2.max(0.0).sqrt(),
            minor_arcsec: min2.max(0.0).sqrt(),
            pa_deg: target.pa_deg,
        })
    }

    /// True when the kernel is too small to change the map.
    pub fn is_negligible(&self) -> bool {
        self.major_arcsec < 1e-3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_header_degrees_to_arcsec() {
        let mut h = HduHeader::default();
        h.set("BMAJ", format!("{}", 46.0 / 3600.0));
        h.set("BMIN", format!("{}", 40.0 / 3600.0));
        h.set("BPA", "30.0");
        let beam = Beam::from_header(&h).unwrap();
        assert!((beam.major_arcsec - 46.0).abs() < 1e-6);
        assert!((beam.minor_arcsec - 40.0).abs() < 1e-6);
        assert!((beam.pa_deg - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_bmin_means_circular() {
        let mut h = HduHeader::default();
        h.set("BMAJ", format!("{}", 32.0 / 3600.0));
        let beam = Beam::from_header(&h).unwrap();
        assert!((beam.major_arcsec - beam.minor_arcsec).abs() < 1e-9);
    }

    #[test]
    fn test_cards_roundtrip() {
        let beam = Beam::circular(46.0);
        let mut h = HduHeader::default();
        for (k, v) in beam.to_cards() {
            h.set(&k, v);
        }
        let back = Beam::from_header(&h).unwrap();
        assert!((back.major_arcsec - 46.0).abs() < 1e-4);
    }

    #[test]
    fn test_kernel_quadrature() {
        let native = Beam::circular(30.0);
        let target = Beam::circular(50.0);
        let kernel = native.kernel_to(&target).unwrap();
        assert!((kernel.major_arcsec - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_kernel_refuses_sharpening() {
        let native = Beam::circular(50.0);
        let target = Beam::circular(30.0);
        match native.kernel_to(&target) {
            Err(BeamError::NotResolvable { .. }) => {}
            other => panic!("expected NotResolvable, got {:?}", other),
        }
    }

    #[test]
    fn test_identity_kernel_is_negligible() {
        let native = Beam::circular(46.0);
        let kernel = native.kernel_to(&native).unwrap();
        assert!(kernel.is_negligible());
    }
}
