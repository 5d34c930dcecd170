use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use serde::Serialize;

use crate::domain::downsample::bin_channels;
use crate::domain::powerspec::{azimuthal_average, fit_power_law, power_spectrum_2d};

/// Power-spectrum slope of the channel maps at one channel thickness.
#[derive(Debug, Clone, Serialize)]
pub struct VcaPoint {
    pub thickness: usize,
    pub channels_used: usize,
    pub slope: f64,
    pub slope_err: f64,
}

/// Velocity channel analysis: how the spatial power-spectrum slope of the
/// channel maps steepens as channels are averaged together. The thick-slice
/// limit approaches the column-density slope.
pub fn vca(
    cube: &Array3<f32>,
    thicknesses: &[usize],
    fit_low: f64,
    fit_high: f64,
) -> Result<Vec<VcaPoint>> {
    let depth = cube.dim().0;
    let mut points = Vec::with_capacity(thicknesses.len());

    for &thickness in thicknesses {
        if thickness == 0 {
            bail!("VCA channel thickness must be at least 1");
        }
        if thickness > depth {
            bail!(
                "VCA channel thickness {} exceeds cube depth {}",
                thickness,
                depth
            );
        }

        let slices = if thickness == 1 {
            cube.clone()
        } else {
            bin_channels(cube, thickness)
        };
        let used = slices.dim().0;

        let mean_ps = averaged_channel_power(&slices);
        let (freqs, power, counts) = azimuthal_average(&mean_ps);
        let fit = fit_power_law(&freqs, &power, &counts, fit_low, fit_high)
            .with_context(|| format!("VCA fit failed at thickness {}", thickness))?;

        points.push(VcaPoint {
            thickness,
            channels_used: used,
            slope: fit.slope,
            slope_err: fit.slope_err,
        });
    }

    Ok(points)
}

/// Mean 2D power spectrum over all channel maps of a cube.
fn averaged_channel_power(cube: &Array3<f32>) -> Array2<f32> {
    let (depth, rows, cols) = cube.dim();

    let summed = cube
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|plane| power_spectrum_2d(&plane.to_owned()))
        .reduce(
            || Array2::<f32>::zeros((rows, cols)),
            |mut acc, ps| {
                acc += &ps;
                acc
            },
        );

    summed.mapv_into(|v| v / depth as f32)
}
