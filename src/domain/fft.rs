use ndarray::{ArrayViewMut2, Axis};
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::FftPlanner;

/// In-place 2D forward FFT of a row-major `rows x cols` buffer.
pub fn fft2_forward(buf: &mut [Complex<f32>], rows: usize, cols: usize) {
    fft_rows(buf, cols, false);
    fft_cols(buf, rows, cols, false);
}

/// In-place 2D inverse FFT, normalized by 1/(rows*cols).
pub fn fft2_inverse(buf: &mut [Complex<f32>], rows: usize, cols: usize) {
    fft_rows(buf, cols, true);
    fft_cols(buf, rows, cols, true);

    let norm = 1.0 / (rows * cols) as f32;
    buf.par_iter_mut().for_each(|v| *v = *v * norm);
}

fn fft_rows(buf: &mut [Complex<f32>], cols: usize, inverse: bool) {
    let mut planner = FftPlanner::<f32>::new();
    let fft = if inverse {
        planner.plan_fft_inverse(cols)
    } else {
        planner.plan_fft_forward(cols)
    };

    buf.par_chunks_mut(cols).for_each(|row| {
        fft.process(row);
    });
}

fn fft_cols(buf: &mut [Complex<f32>], rows: usize, cols: usize, inverse: bool) {
    let mut view =
        ArrayViewMut2::from_shape((rows, cols), buf).expect("buffer matches fft dimensions");

    let mut planner = FftPlanner::<f32>::new();
    let fft = if inverse {
        planner.plan_fft_inverse(rows)
    } else {
        planner.plan_fft_forward(rows)
    };

    view.axis_iter_mut(Axis(1))
        .into_par_iter()
        .for_each(|mut col| {
            let mut col_buf = col.to_vec();
            fft.process(&mut col_buf);
            for (idx, val) in col.iter_mut().enumerate() {
                *val = col_buf[idx];
            }
        });
}

/// Move the DC component to the array center.
pub fn fft_shift(buf: &mut [Complex<f32>], rows: usize, cols: usize) {
    let half_r = rows / 2;
    let half_c = cols / 2;

    let mut shifted = vec![Complex::new(0.0f32, 0.0); rows * cols];

    shifted
        .par_chunks_mut(cols)
        .enumerate()
        .for_each(|(dst_r, dst_row)| {
            let src_r = (dst_r + half_r) % rows;
            for dst_c in 0..cols {
                let src_c = (dst_c + half_c) % cols;
                dst_row[dst_c] = buf[src_r * cols + src_c];
            }
        });

    buf.copy_from_slice(&shifted);
}
