use ndarray::{s, Array2, Array3};
use rayon::prelude::*;

use crate::domain::stats::is_valid;
use crate::model::{HduHeader, VelocityAxis};

/// Integrated intensity, sum(I dv) in K km/s. Pixels with no valid channel
/// come out NaN.
pub fn moment0(cube: &Array3<f32>, axis: &VelocityAxis) -> Array2<f32> {
    let dv = axis.channel_width() / 1e3;
    per_pixel(cube, move |spectrum| {
        let mut sum = 0.0f64;
        let mut any = false;
        for &v in spectrum {
            if is_valid(v) {
                sum += v as f64;
                any = true;
            }
        }
        if any {
            (sum * dv) as f32
        } else {
            f32::NAN
        }
    })
}

/// Intensity-weighted mean velocity in km/s. Undefined (NaN) where the
/// summed intensity is not positive.
pub fn moment1(cube: &Array3<f32>, axis: &VelocityAxis) -> Array2<f32> {
    let velocities: Vec<f64> = axis.values().iter().map(|v| v / 1e3).collect();
    per_pixel(cube, move |spectrum| {
        let mut weight = 0.0f64;
        let mut sum = 0.0f64;
        for (z, &v) in spectrum.iter().enumerate() {
            if is_valid(v) {
                weight += v as f64;
                sum += v as f64 * velocities[z];
            }
        }
        if weight > 0.0 {
            (sum / weight) as f32
        } else {
            f32::NAN
        }
    })
}

/// Intensity-weighted velocity dispersion in km/s.
pub fn moment2(cube: &Array3<f32>, axis: &VelocityAxis) -> Array2<f32> {
    let velocities: Vec<f64> = axis.values().iter().map(|v| v / 1e3).collect();
    per_pixel(cube, move |spectrum| {
        let mut weight = 0.0f64;
        let mut sum = 0.0f64;
        for (z, &v) in spectrum.iter().enumerate() {
            if is_valid(v) {
                weight += v as f64;
                sum += v as f64 * velocities[z];
            }
        }
        if weight <= 0.0 {
            return f32::NAN;
        }
        let centroid = sum / weight;

        let mut var = 0.0f64;
        for (z, &v) in spectrum.iter().enumerate() {
            if is_valid(v) {
                let d = velocities[z] - centroid;
                var += v as f64 * d * d;
            }
        }
        let var = var / weight;
        if var >= 0.0 {
            (var.sqrt()) as f32
        } else {
            f32::NAN
        }
    })
}

fn per_pixel<F>(cube: &Array3<f32>, f: F) -> Array2<f32>
where
    F: Fn(&[f32]) -> f32 + Sync,
{
    let (depth, rows, cols) = cube.dim();
    let npix = rows * cols;

    let result: Vec<f32> = (0..npix)
        .into_par_iter()
        .map(|i| {
            let y = i / cols;
            let x = i % cols;
            let spectrum: Vec<f32> = (0..depth).map(|z| cube[[z, y, x]]).collect();
            f(&spectrum)
        })
        .collect();

    Array2::from_shape_vec((rows, cols), result).expect("pixel count matches map shape")
}

pub fn spectral_slab(cube: &Array3<f32>, start: usize, end: usize) -> Array3<f32> {
    let end = end.min(cube.dim().0);
    cube.slice(s![start..end, .., ..]).to_owned()
}

pub fn crop_cube(cube: &Array3<f32>, y0: usize, y1: usize, x0: usize, x1: usize) -> Array3<f32> {
    cube.slice(s![.., y0..y1, x0..x1]).to_owned()
}

pub fn crop_image(image: &Array2<f32>, y0: usize, y1: usize, x0: usize, x1: usize) -> Array2<f32> {
    image.slice(s![y0..y1, x0..x1]).to_owned()
}

/// Shift the spatial reference pixel after a crop at (x0, y0).
pub fn update_crpix_for_crop(header: &mut HduHeader, y0: usize, x0: usize) {
    if let Some(crpix1) = header.get_f64("CRPIX1") {
        header.set("CRPIX1", format!("{:.6}", crpix1 - x0 as f64));
    }
    if let Some(crpix2) = header.get_f64("CRPIX2") {
        header.set("CRPIX2", format!("{:.6}", crpix2 - y0 as f64));
    }
}

pub fn extract_spectrum(cube: &Array3<f32>, y: usize, x: usize) -> Vec<f32> {
    let depth = cube.dim().0;
    (0..depth).map(|z| cube[[z, y, x]]).collect()
}
