use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;

use crate::domain::stats::is_valid;
use crate::model::HduHeader;

/// Block-average an image by an integer factor. A block must be at least
/// half valid to produce a value, otherwise the output pixel is blank.
pub fn block_mean(image: &Array2<f32>, factor: usize) -> Array2<f32> {
    let factor = factor.max(1);
    if factor == 1 {
        return image.clone();
    }
    let (rows, cols) = image.dim();
    let out_rows = rows / factor;
    let out_cols = cols / factor;

    Array2::from_shape_fn((out_rows, out_cols), |(oy, ox)| {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for dy in 0..factor {
            for dx in 0..factor {
                let v = image[[oy * factor + dy, ox * factor + dx]];
                if is_valid(v) {
                    sum += v as f64;
                    count += 1;
                }
            }
        }
        if count * 2 >= factor * factor {
            (sum / count as f64) as f32
        } else {
            f32::NAN
        }
    })
}

/// Spatially downsample every channel of a cube.
pub fn downsample_cube(cube: &Array3<f32>, factor: usize) -> Array3<f32> {
    let factor = factor.max(1);
    if factor == 1 {
        return cube.clone();
    }
    let (depth, rows, cols) = cube.dim();
    let out_rows = rows / factor;
    let out_cols = cols / factor;

    let planes: Vec<Array2<f32>> = cube
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|plane| block_mean(&plane.to_owned(), factor))
        .collect();

    let mut flat = Vec::with_capacity(depth * out_rows * out_cols);
    for plane in planes {
        flat.extend(plane.into_iter());
    }
    Array3::from_shape_vec((depth, out_rows, out_cols), flat)
        .expect("downsampled planes keep their shape")
}

/// Average channels in groups of `factor`; a trailing partial group is
/// dropped so every output channel has uniform thickness.
pub fn bin_channels(cube: &Array3<f32>, factor: usize) -> Array3<f32> {
    let factor = factor.max(1);
    if factor == 1 {
        return cube.clone();
    }
    let (depth, rows, cols) = cube.dim();
    let out_depth = depth / factor;

    let planes: Vec<Array2<f32>> = (0..out_depth)
        .into_par_iter()
        .map(|oz| {
            Array2::from_shape_fn((rows, cols), |(y, x)| {
                let mut sum = 0.0f64;
                let mut count = 0usize;
                for dz in 0..factor {
                    let v = cube[[oz * factor + dz, y, x]];
                    if is_valid(v) {
                        sum += v as f64;
                        count += 1;
                    }
                }
                if count > 0 {
                    (sum / count as f64) as f32
                } else {
                    f32::NAN
                }
            })
        })
        .collect();

    let mut flat = Vec::with_capacity(out_depth * rows * cols);
    for plane in planes {
        flat.extend(plane.into_iter());
    }
    Array3::from_shape_vec((out_depth, rows, cols), flat).expect("binned planes keep their shape")
}

/// Scale the spatial WCS after block-averaging: pixel sizes grow by the
/// factor and the reference pixel moves to the binned grid.
pub fn update_header_for_downsample(header: &mut HduHeader, factor: usize) {
    if factor <= 1 {
        return;
    }
    let f = factor as f64;
    for key in ["CDELT1", "CDELT2", "CD1_1", "CD1_2", "CD2_1", "CD2_2"] {
        if let Some(v) = header.get_f64(key) {
            header.set(key, format!("{:.10}", v * f));
        }
    }
    for key in ["CRPIX1", "CRPIX2"] {
        if let Some(p) = header.get_f64(key) {
            header.set(key, format!("{:.6}", (p + (f - 1.0) / 2.0) / f));
        }
    }
}
