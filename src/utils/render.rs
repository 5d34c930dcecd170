use std::path::Path;

use anyhow::{Context, Result};
use image::{GrayImage, Luma};
use ndarray::Array2;

fn finite_minmax(data: &Array2<f32>) -> (f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in data.iter() {
        if v.is_finite() {
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
    }
    if min > max {
        (0.0, 1.0)
    } else {
        (min, max)
    }
}

/// Linear grayscale quicklook; blank pixels render black.
pub fn render_grayscale(data: &Array2<f32>, path: &Path) -> Result<()> {
    let (rows, cols) = data.dim();

    let (min, max) = finite_minmax(data);
    let range = (max - min).max(1e-10);
    let inv_range = 255.0 / range;

    let mut img = GrayImage::new(cols as u32, rows as u32);
    for y in 0..rows {
        for x in 0..cols {
            let v = data[[y, x]];
            let byte = if v.is_finite() {
                ((v - min) * inv_range).clamp(0.0, 255.0) as u8
            } else {
                0
            };
            img.put_pixel(x as u32, y as u32, Luma([byte]));
        }
    }

    img.save(path)
        .with_context(|| format!("Failed to save grayscale image to {:?}", path))?;
    Ok(())
}

/// Quicklook for a 2D power spectrum: log-stretched so the inertial range is
/// visible next to the DC peak.
pub fn render_log_power(power: &Array2<f32>, path: &Path) -> Result<()> {
    let stretched = power.mapv(|v| if v.is_finite() { (1.0 + v.max(0.0)).ln() } else { 0.0 });
    render_grayscale(&stretched, path)
}
