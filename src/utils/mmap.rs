use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::ops::{Deref, Range};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use memmap2::{Mmap, MmapOptions};
use ndarray::{Array2, Array3};

use crate::model::HduHeader;
use crate::utils::constants::{BLOCK_SIZE, CARD_SIZE};

pub fn create_mmap(file: &File) -> Result<Mmap> {
    let mmap = unsafe { MmapOptions::new().map(file).context("mmap failed")? };
    #[cfg(unix)]
    {
        let _ = mmap.advise(memmap2::Advice::Sequential);
    }
    Ok(mmap)
}

/// Raw FITS bytes: memory-mapped for plain files, decompressed into memory
/// for `.fits.gz` inputs.
pub enum FitsBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for FitsBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FitsBytes::Mapped(m) => m,
            FitsBytes::Owned(v) => v,
        }
    }
}

pub fn open_bytes(path: &Path) -> Result<FitsBytes> {
    let file =
        File::open(path).with_context(|| format!("Failed to open FITS file {:?}", path))?;

    let is_gz = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);

    if is_gz {
        let mut decoder = GzDecoder::new(file);
        let mut bytes = Vec::new();
        decoder
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to decompress {:?}", path))?;
        Ok(FitsBytes::Owned(bytes))
    } else {
        Ok(FitsBytes::Mapped(create_mmap(&file)?))
    }
}

pub fn decode_pixels(data: &[u8], bitpix: i64, bscale: f64, bzero: f64, blank: Option<i64>) -> Vec<f32> {
    match bitpix {
        8 => data
            .iter()
            .map(|&b| {
                if blank == Some(b as i64) {
                    f32::NAN
                } else {
                    (b as f64 * bscale + bzero) as f32
                }
            })
            .collect(),
        16 => data
            .chunks_exact(2)
            .map(|c| {
                let v = i16::from_be_bytes([c[0], c[1]]);
                if blank == Some(v as i64) {
                    f32::NAN
                } else {
                    (v as f64 * bscale + bzero) as f32
                }
            })
            .collect(),
        32 => data
            .chunks_exact(4)
            .map(|c| {
                let v = i32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                if blank == Some(v as i64) {
                    f32::NAN
                } else {
                    (v as f64 * bscale + bzero) as f32
                }
            })
            .collect(),
        -32 => data
            .chunks_exact(4)
            .map(|c| {
                let v = f32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                (v as f64 * bscale + bzero) as f32
            })
            .collect(),
        -64 => data
            .chunks_exact(8)
            .map(|c| {
                let v = f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
                (v * bscale + bzero) as f32
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn extract_header_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('\'') {
        if let Some(end) = trimmed[1..].find('\'') {
            return trimmed[1..1 + end].trim_end().to_string();
        }
    }
    match trimmed.find('/') {
        Some(pos) => trimmed[..pos].trim().to_string(),
        None => trimmed.to_string(),
    }
}

pub struct ParsedHdu {
    pub header: HduHeader,
    pub header_start: usize,
    pub data_start: usize,
    pub next_hdu_offset: usize,
}

pub fn parse_header_at(bytes: &[u8], offset: usize) -> Result<ParsedHdu> {
    let mut cards = Vec::new();
    let mut index = HashMap::new();
    let mut pos = offset;
    let mut end_found = false;

    while !end_found {
        if pos + BLOCK_SIZE > bytes.len() {
            bail!(
                "Unexpected end of file while reading header at offset {}",
                offset
            );
        }

        let block = &bytes[pos..pos + BLOCK_SIZE];
        pos += BLOCK_SIZE;

        for card_bytes in block.chunks_exact(CARD_SIZE) {
            let keyword_bytes = &card_bytes[0..8];
            let keyword = String::from_utf8_lossy(keyword_bytes).trim().to_string();

            if keyword == "END" {
                end_found = true;
                break;
            }

            if card_bytes.len() < 10 || &card_bytes[8..10] != b"= " {
                continue;
            }

            let value_str = String::from_utf8_lossy(&card_bytes[10..]);
            let value = extract_header_value(&value_str);

            cards.push((keyword.clone(), value.clone()));
            index.insert(keyword, value);
        }
    }

    let header = HduHeader { cards, index };
    let data_start = pos;
    let next_hdu = data_start + header.padded_data_bytes();

    Ok(ParsedHdu {
        header,
        header_start: offset,
        data_start,
        next_hdu_offset: next_hdu,
    })
}

/// Byte layout of a spectral cube HDU, enough to decode arbitrary channel
/// ranges without touching the rest of the file.
#[derive(Debug, Clone)]
pub struct CubeGeometry {
    pub naxis1: usize,
    pub naxis2: usize,
    pub naxis3: usize,
    pub bitpix: i64,
    pub bytes_per_pixel: usize,
    pub bzero: f64,
    pub bscale: f64,
    pub blank: Option<i64>,
    pub data_offset: usize,
    pub frame_bytes: usize,
}

fn scaling(header: &HduHeader) -> (f64, f64) {
    let bzero = header.get_f64("BZERO").unwrap_or(0.0);
    let bscale = header.get_f64("BSCALE").unwrap_or(1.0);
    (bzero, bscale)
}

fn blank_value(header: &HduHeader) -> Option<i64> {
    let bitpix = header.get_i64("BITPIX").unwrap_or(0);
    if bitpix > 0 {
        header.get_i64("BLANK")
    } else {
        None
    }
}

/// Accepts a 3-axis cube, or a 4-axis one whose trailing (Stokes) axis is
/// degenerate. Anything else is rejected with an explanation.
fn cube_hdu_check(header: &HduHeader) -> Result<bool> {
    let naxis = header.naxis();
    let naxis3 = header.axis_len(3).unwrap_or(0);
    if naxis < 3 || naxis3 <= 1 {
        return Ok(false);
    }
    match naxis {
        3 => Ok(true),
        4 if header.axis_len(4) == Some(1) => Ok(true),
        n => bail!(
            "Cube HDU has {} axes with NAXIS4={}; expected 3 axes or a degenerate 4th axis",
            n,
            header.axis_len(4).unwrap_or(0)
        ),
    }
}

fn cube_geometry(parsed: &ParsedHdu) -> Result<CubeGeometry> {
    let header = &parsed.header;
    let naxis1 = header.axis_len(1).context("Missing NAXIS1 in cube HDU")?;
    let naxis2 = header.axis_len(2).context("Missing NAXIS2 in cube HDU")?;
    let naxis3 = header.axis_len(3).context("Missing NAXIS3 in cube HDU")?;
    let bitpix = header.get_i64("BITPIX").context("Missing BITPIX in cube HDU")?;
    let bytes_per_pixel = (bitpix.unsigned_abs() / 8) as usize;
    if bytes_per_pixel == 0 {
        bail!("Unsupported BITPIX {}", bitpix);
    }
    let (bzero, bscale) = scaling(header);

    Ok(CubeGeometry {
        naxis1,
        naxis2,
        naxis3,
        bitpix,
        bytes_per_pixel,
        bzero,
        bscale,
        blank: blank_value(header),
        data_offset: parsed.data_start,
        frame_bytes: naxis1 * naxis2 * bytes_per_pixel,
    })
}

/// Header and geometry of the first cube HDU, without decoding any pixels.
pub fn cube_info(path: &Path) -> Result<(HduHeader, CubeGeometry)> {
    let bytes = open_bytes(path)?;
    let mut offset: usize = 0;

    while offset < bytes.len() {
        let parsed = parse_header_at(&bytes, offset)?;
        if cube_hdu_check(&parsed.header)? {
            let geometry = cube_geometry(&parsed)?;
            return Ok((parsed.header, geometry));
        }
        offset = parsed.next_hdu_offset;
    }

    bail!("No spectral-cube HDU found in {:?}", path)
}

pub struct LoadedImage {
    pub header: HduHeader,
    pub data: Array2<f32>,
}

pub struct LoadedCube {
    pub header: HduHeader,
    pub data: Array3<f32>,
}

pub fn read_image(path: &Path) -> Result<LoadedImage> {
    let bytes = open_bytes(path)?;
    let mut offset: usize = 0;

    while offset < bytes.len() {
        let parsed = parse_header_at(&bytes, offset)?;
        let header = &parsed.header;

        let naxis = header.naxis();
        let naxis1 = header.axis_len(1).unwrap_or(0);
        let naxis2 = header.axis_len(2).unwrap_or(0);
        let flat = naxis == 2 || (naxis == 3 && header.axis_len(3) == Some(1));

        if flat && naxis1 > 1 && naxis2 > 1 {
            let bitpix = header.get_i64("BITPIX").context("Missing BITPIX in image HDU")?;
            let bytes_per_pixel = (bitpix.unsigned_abs() / 8) as usize;
            let slice_bytes = naxis1 * naxis2 * bytes_per_pixel;

            let data_end = parsed.data_start + slice_bytes;
            if data_end > bytes.len() {
                bail!("Image data exceeds file size");
            }

            let raw = &bytes[parsed.data_start..data_end];
            let (bzero, bscale) = scaling(header);
            let pixels = decode_pixels(raw, bitpix, bscale, bzero, blank_value(header));
            let data = Array2::from_shape_vec((naxis2, naxis1), pixels)
                .context("Failed to reshape image pixels")?;

            return Ok(LoadedImage {
                header: parsed.header,
                data,
            });
        }

        offset = parsed.next_hdu_offset;
    }

    bail!("No 2D image HDU found in {:?}", path)
}

pub fn read_cube(path: &Path) -> Result<LoadedCube> {
    let (_, geometry) = cube_info(path)?;
    read_cube_slab(path, 0..geometry.naxis3)
}

/// Decode only the channels in `range`. CRPIX3/NAXIS3 in the returned header
/// describe the slab, so downstream code sees a consistent cube.
pub fn read_cube_slab(path: &Path, range: Range<usize>) -> Result<LoadedCube> {
    let bytes = open_bytes(path)?;
    let mut offset: usize = 0;

    while offset < bytes.len() {
        let parsed = parse_header_at(&bytes, offset)?;
        if !cube_hdu_check(&parsed.header)? {
            offset = parsed.next_hdu_offset;
            continue;
        }

        let g = cube_geometry(&parsed)?;
        let start = range.start;
        let end = range.end.min(g.naxis3);
        if start >= end {
            bail!(
                "Channel range {}..{} is empty for a cube of depth {}",
                range.start,
                range.end,
                g.naxis3
            );
        }

        let byte_start = g.data_offset + start * g.frame_bytes;
        let byte_end = g.data_offset + end * g.frame_bytes;
        if byte_end > bytes.len() {
            bail!("Cube data exceeds file size");
        }

        let raw = &bytes[byte_start..byte_end];
        let pixels = decode_pixels(raw, g.bitpix, g.bscale, g.bzero, g.blank);
        let data = Array3::from_shape_vec((end - start, g.naxis2, g.naxis1), pixels)
            .context("Failed to reshape cube pixels")?;

        let mut header = parsed.header;
        header.set("NAXIS", "3");
        header.set("NAXIS3", format!("{}", end - start));
        header.remove("NAXIS4");
        if let Some(crpix3) = header.get_f64("CRPIX3") {
            header.set("CRPIX3", format!("{:.6}", crpix3 - start as f64));
        }

        return Ok(LoadedCube { header, data });
    }

    bail!("No spectral-cube HDU found in {:?}", path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pixels_i16() {
        let data: &[u8] = &[0x01, 0x00, 0xFF, 0xFF];
        let pixels = decode_pixels(data, 16, 1.0, 0.0, None);
        assert_eq!(pixels.len(), 2);
        assert!((pixels[0] - 256.0).abs() < 1e-6);
        assert!((pixels[1] - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_decode_pixels_f32() {
        let data: &[u8] = &[0x3F, 0x80, 0x00, 0x00];
        let pixels = decode_pixels(data, -32, 1.0, 0.0, None);
        assert_eq!(pixels.len(), 1);
        assert!((pixels[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_pixels_with_scaling() {
        let data: &[u8] = &[100];
        let pixels = decode_pixels(data, 8, 2.0, 10.0, None);
        assert!((pixels[0] - 210.0).abs() < 1e-6);
    }

    #[test]
    fn test_blank_becomes_nan() {
        let data = (-1i16).to_be_bytes();
        let pixels = decode_pixels(&data, 16, 1.0, 0.0, Some(-1));
        assert!(pixels[0].is_nan());
    }

    #[test]
    fn test_blank_ignored_for_float_data() {
        let data = 1.0f32.to_be_bytes();
        let pixels = decode_pixels(&data, -32, 1.0, 0.0, None);
        assert!((pixels[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_extract_header_value_string_and_comment() {
        assert_eq!(extract_header_value("'VRAD    '           / type"), "VRAD");
        assert_eq!(extract_header_value("  46.0 / beam"), "46.0");
        assert_eq!(extract_header_value("  T"), "T");
    }

    #[test]
    fn test_cube_hdu_check_degenerate_stokes() {
        let mut h = HduHeader::default();
        h.set("NAXIS", "4");
        h.set("NAXIS1", "8");
        h.set("NAXIS2", "8");
        h.set("NAXIS3", "4");
        h.set("NAXIS4", "1");
        assert!(cube_hdu_check(&h).unwrap());

        h.set("NAXIS4", "2");
        assert!(cube_hdu_check(&h).is_err());
    }
}
