use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, Axis};
use num_complex::Complex;
use rayon::prelude::*;

use crate::domain::fft::{fft2_forward, fft2_inverse};
use crate::domain::stats::is_valid;
use crate::model::{Beam, HduHeader};
use crate::utils::constants::FWHM_TO_SIGMA;

/// Spatial pixel scale in arcsec from CDELT2 or the CD matrix.
pub fn pixel_scale_arcsec(header: &HduHeader) -> Result<f64> {
    if let Some(cdelt2) = header.get_f64("CDELT2") {
        return Ok(cdelt2.abs() * 3600.0);
    }
    if let Some(cd22) = header.get_f64("CD2_2") {
        return Ok(cd22.abs() * 3600.0);
    }
    bail!("Header has neither CDELT2 nor CD2_2; pixel scale unknown")
}

/// Elliptical Gaussian kernel for a beam, sampled on the pixel grid and
/// normalized to unit sum. The position angle is measured from north (+y)
/// toward east.
pub fn gaussian_kernel(kernel_beam: &Beam, pixscale_arcsec: f64) -> Result<Array2<f32>> {
    if pixscale_arcsec <= 0.0 {
        bail!("Pixel scale must be positive, got {}", pixscale_arcsec);
    }
    let sigma_maj = kernel_beam.major_arcsec * FWHM_TO_SIGMA / pixscale_arcsec;
    let sigma_min = kernel_beam.minor_arcsec * FWHM_TO_SIGMA / pixscale_arcsec;
    if sigma_maj <= 0.0 {
        bail!("Kernel beam has zero size; nothing to convolve with");
    }
    let sigma_min = sigma_min.max(sigma_maj * 1e-3);

    let half = (4.0 * sigma_maj).ceil() as usize;
    let half = half.max(1);
    let size = 2 * half + 1;

    let theta = kernel_beam.pa_deg.to_radians();
    let (sin_t, cos_t) = theta.sin_cos();

    let mut kernel = Array2::<f32>::zeros((size, size));
    let mut sum = 0.0f64;
    for y in 0..size {
        for x in 0..size {
            let dy = y as f64 - half as f64;
            let dx = x as f64 - half as f64;
            let u = dx * sin_t + dy * cos_t;
            let v = dx * cos_t - dy * sin_t;
            let val = (-0.5 * (u * u / (sigma_maj * sigma_maj) + v * v / (sigma_min * sigma_min)))
                .exp();
            kernel[[y, x]] = val as f32;
            sum += val;
        }
    }

    let inv = (1.0 / sum) as f32;
    Ok(kernel.mapv_into(|v| v * inv))
}

/// FFT-based convolution that treats NaN as missing data: the blank pixels
/// contribute nothing, the local kernel weight is renormalized over the
/// valid footprint, and blank pixels stay blank in the output.
pub fn convolve2d_nan(image: &Array2<f32>, kernel: &Array2<f32>) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let (krows, kcols) = kernel.dim();
    let full_r = rows + krows - 1;
    let full_c = cols + kcols - 1;

    let mut data = vec![Complex::new(0.0f32, 0.0); full_r * full_c];
    let mut mask = vec![Complex::new(0.0f32, 0.0); full_r * full_c];
    for y in 0..rows {
        for x in 0..cols {
            let v = image[[y, x]];
            if is_valid(v) {
                data[y * full_c + x] = Complex::new(v, 0.0);
                mask[y * full_c + x] = Complex::new(1.0, 0.0);
            }
        }
    }

    let mut kbuf = vec![Complex::new(0.0f32, 0.0); full_r * full_c];
    for y in 0..krows {
        for x in 0..kcols {
            kbuf[y * full_c + x] = Complex::new(kernel[[y, x]], 0.0);
        }
    }

    fft2_forward(&mut data, full_r, full_c);
    fft2_forward(&mut mask, full_r, full_c);
    fft2_forward(&mut kbuf, full_r, full_c);

    for i in 0..data.len() {
        data[i] = data[i] * kbuf[i];
        mask[i] = mask[i] * kbuf[i];
    }

    fft2_inverse(&mut data, full_r, full_c);
    fft2_inverse(&mut mask, full_r, full_c);

    let off_r = krows / 2;
    let off_c = kcols / 2;
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        if !is_valid(image[[y, x]]) {
            return f32::NAN;
        }
        let idx = (y + off_r) * full_c + (x + off_c);
        let weight = mask[idx].re;
        if weight > 1e-6 {
            data[idx].re / weight
        } else {
            f32::NAN
        }
    })
}

/// Smooth every channel of a cube with the same kernel.
pub fn convolve_cube(cube: &Array3<f32>, kernel: &Array2<f32>) -> Array3<f32> {
    let (depth, rows, cols) = cube.dim();

    let planes: Vec<Array2<f32>> = cube
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|plane| convolve2d_nan(&plane.to_owned(), kernel))
        .collect();

    let mut flat = Vec::with_capacity(depth * rows * cols);
    for plane in planes {
        flat.extend(plane.into_iter());
    }
    Array3::from_shape_vec((depth, rows, cols), flat).expect("channel planes keep their shape")
}

/// Kernel that carries a map from `native` resolution to `target`.
pub fn kernel_to_common_beam(
    native: &Beam,
    target: &Beam,
    header: &HduHeader,
) -> Result<Option<Array2<f32>>> {
    let kernel_beam = native
        .kernel_to(target)
        .context("Beam deconvolution failed")?;
    if kernel_beam.is_negligible() {
        return Ok(None);
    }
    let pixscale = pixel_scale_arcsec(header)?;
    Ok(Some(gaussian_kernel(&kernel_beam, pixscale)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_normalized() {
        let kernel = gaussian_kernel(&Beam::circular(30.0), 10.0).unwrap();
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        let (r, c) = kernel.dim();
        assert_eq!(r % 2, 1);
        assert_eq!(c % 2, 1);
    }

    #[test]
    fn test_kernel_peak_at_center() {
        let kernel = gaussian_kernel(&Beam::circular(20.0), 5.0).unwrap();
        let (r, c) = kernel.dim();
        let center = kernel[[r / 2, c / 2]];
        for &v in kernel.iter() {
            assert!(v <= center + 1e-9);
        }
    }

    #[test]
    fn test_constant_field_unchanged() {
        let image = Array2::from_elem((32, 32), 3.0f32);
        let kernel = gaussian_kernel(&Beam::circular(30.0), 15.0).unwrap();
        let out = convolve2d_nan(&image, &kernel);
        for &v in out.iter() {
            assert!((v - 3.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_flux_conserved_for_interior_source() {
        let mut image = Array2::zeros((64, 64));
        image[[32, 32]] = 100.0;
        let kernel = gaussian_kernel(&Beam::circular(20.0), 10.0).unwrap();
        let out = convolve2d_nan(&image, &kernel);

        let total: f64 = out.iter().map(|&v| v as f64).sum();
        assert!((total - 100.0).abs() < 0.5);

        let peak = out[[32, 32]];
        assert!(peak > 0.0 && peak < 100.0);
    }

    #[test]
    fn test_nan_stays_nan_and_neighbors_renormalize() {
        let mut image = Array2::from_elem((32, 32), 2.0f32);
        image[[10, 10]] = f32::NAN;
        let kernel = gaussian_kernel(&Beam::circular(30.0), 15.0).unwrap();
        let out = convolve2d_nan(&image, &kernel);

        assert!(out[[10, 10]].is_nan());
        // A constant field with a hole must stay constant after
        // renormalization.
        assert!((out[[10, 11]] - 2.0).abs() < 1e-3);
        assert!((out[[0, 0]] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_cube_channels_convolved_independently() {
        let mut cube = Array3::zeros((2, 32, 32));
        cube[[0, 16, 16]] = 50.0;
        cube[[1, 8, 8]] = 10.0;
        let kernel = gaussian_kernel(&Beam::circular(20.0), 10.0).unwrap();
        let out = convolve_cube(&cube, &kernel);

        let sum0: f64 = out.index_axis(Axis(0), 0).iter().map(|&v| v as f64).sum();
        let sum1: f64 = out.index_axis(Axis(0), 1).iter().map(|&v| v as f64).sum();
        assert!((sum0 - 50.0).abs() < 0.5);
        assert!((sum1 - 10.0).abs() < 0.2);
    }

    #[test]
    fn test_kernel_to_common_beam_identity_is_none() {
        let mut h = HduHeader::default();
        h.set("CDELT2", format!("{}", 10.0 / 3600.0));
        let beam = Beam::circular(46.0);
        let kernel = kernel_to_common_beam(&beam, &beam, &h).unwrap();
        assert!(kernel.is_none());
    }
}
