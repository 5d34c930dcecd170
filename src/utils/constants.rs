/// FITS files are organized in fixed-size blocks of 2880 bytes.
pub const BLOCK_SIZE: usize = 2880;

/// One FITS header card is 80 bytes of ASCII.
pub const CARD_SIZE: usize = 80;

/// Conversion between a Gaussian FWHM and its standard deviation.
pub const FWHM_TO_SIGMA: f64 = 0.42466090014400953;

/// Conversion from median absolute deviation to a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 1.4826;
