use crate::model::HduHeader;

/// Linear spectral axis along NAXIS3, stored in m/s.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityAxis {
    pub crval: f64,
    pub cdelt: f64,
    pub crpix: f64,
    pub len: usize,
}

impl VelocityAxis {
    /// Build from CRVAL3/CDELT3/CRPIX3. CUNIT3 of km/s is converted to m/s.
    pub fn from_header(header: &HduHeader) -> Option<Self> {
        let len = header.axis_len(3)?;
        let mut crval = header.get_f64("CRVAL3")?;
        let mut cdelt = header.get_f64("CDELT3")?;
        let crpix = header.get_f64("CRPIX3").unwrap_or(1.0);

        let unit = header.get("CUNIT3").unwrap_or("m/s").trim().to_lowercase();
        if unit.starts_with("km") {
            crval *= 1e3;
            cdelt *= 1e3;
        }

        if cdelt == 0.0 || len == 0 {
            return None;
        }
        Some(VelocityAxis {
            crval,
            cdelt,
            crpix,
            len,
        })
    }

    /// Velocity in m/s at a 0-based channel index.
    pub fn velocity_at(&self, channel: usize) -> f64 {
        self.crval + (channel as f64 + 1.0 - self.crpix) * self.cdelt
    }

    pub fn values(&self) -> Vec<f64> {
        (0..self.len).map(|c| self.velocity_at(c)).collect()
    }

    pub fn channel_width(&self) -> f64 {
        self.cdelt.abs()
    }

    /// Half-open channel range whose centers fall inside [vmin, vmax] (m/s).
    /// Handles axes that run in either direction.
    pub fn channel_range(&self, vmin: f64, vmax: f64) -> Option<(usize, usize)> {
        let (lo, hi) = if vmin <= vmax {
            (vmin, vmax)
        } else {
            (vmax, vmin)
        };
        let mut first = None;
        let mut last = 0usize;
        for c in 0..self.len {
            let v = self.velocity_at(c);
            if v >= lo && v <= hi {
                if first.is_none() {
                    first = Some(c);
                }
                last = c;
            }
        }
        first.map(|f| (f, last + 1))
    }

    /// Axis for channels [start, end) of this one.
    pub fn slab(&self, start: usize, end: usize) -> VelocityAxis {
        VelocityAxis {
            crval: self.crval,
            cdelt: self.cdelt,
            crpix: self.crpix - start as f64,
            len: end.min(self.len).saturating_sub(start),
        }
    }

    /// Axis after binning channels in groups of `factor`. Each new channel is
    /// centered on the mean velocity of its group; a trailing partial group
    /// is dropped.
    pub fn binned(&self, factor: usize) -> VelocityAxis {
        let factor = factor.max(1);
        VelocityAxis {
            crval: self.crval,
            cdelt: self.cdelt * factor as f64,
            crpix: (self.crpix + (factor as f64 - 1.0) / 2.0) / factor as f64,
            len: self.len / factor,
        }
    }

    pub fn to_cards(&self) -> Vec<(String, String)> {
        vec![
            ("CTYPE3".into(), "VRAD".into()),
            ("CUNIT3".into(), "m/s".into()),
            ("CRVAL3".into(), format!("{:.6}", self.crval)),
            ("CDELT3".into(), format!("{:.6}", self.cdelt)),
            ("CRPIX3".into(), format!("{:.6}", self.crpix)),
        ]
    }
}
