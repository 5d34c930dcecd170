use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array2, Array3};

use crate::model::HduHeader;
use crate::utils::constants::BLOCK_SIZE;

#[derive(Debug, Clone, Default)]
pub struct FitsWriteConfig {
    /// Cards appended last; they override anything copied before them.
    pub extra_cards: Vec<(String, String)>,
    pub copy_wcs: bool,
    pub copy_obs_metadata: bool,
    pub history: Option<String>,
}

/// Write a 2D image as BITPIX -32.
pub fn write_image(
    image: &Array2<f32>,
    path: &Path,
    source_header: Option<&HduHeader>,
    config: &FitsWriteConfig,
) -> Result<()> {
    let (rows, cols) = image.dim();
    let cards = assemble_cards(&[cols, rows], source_header, config);

    let file = std::fs::File::create(path).with_context(|| format!("Cannot create {:?}", path))?;
    let mut writer = BufWriter::new(file);

    write_header_block(&mut writer, &cards)?;
    write_f32_plane(&mut writer, image)?;
    pad_to_block(&mut writer, rows * cols * 4)?;

    writer.flush()?;
    Ok(())
}

/// Write a spectral cube as BITPIX -32, axis order (channel, y, x) on the
/// way in, FITS axis order (x, y, channel) in the header.
pub fn write_cube(
    cube: &Array3<f32>,
    path: &Path,
    source_header: Option<&HduHeader>,
    config: &FitsWriteConfig,
) -> Result<()> {
    let (depth, rows, cols) = cube.dim();
    let cards = assemble_cards(&[cols, rows, depth], source_header, config);

    let file = std::fs::File::create(path).with_context(|| format!("Cannot create {:?}", path))?;
    let mut writer = BufWriter::new(file);

    write_header_block(&mut writer, &cards)?;
    for z in 0..depth {
        let plane = cube.index_axis(ndarray::Axis(0), z);
        let mut buf = Vec::with_capacity(cols * 4);
        for y in 0..rows {
            buf.clear();
            for x in 0..cols {
                buf.extend_from_slice(&plane[[y, x]].to_be_bytes());
            }
            writer.write_all(&buf)?;
        }
    }
    pad_to_block(&mut writer, depth * rows * cols * 4)?;

    writer.flush()?;
    Ok(())
}

fn assemble_cards(
    axes: &[usize],
    source_header: Option<&HduHeader>,
    config: &FitsWriteConfig,
) -> Vec<(String, String)> {
    let mut cards = Vec::new();

    cards.push(("SIMPLE".into(), "T".into()));
    cards.push(("BITPIX".into(), "-32".into()));
    cards.push(("NAXIS".into(), format!("{}", axes.len())));
    for (i, len) in axes.iter().enumerate() {
        cards.push((format!("NAXIS{}", i + 1), format!("{}", len)));
    }
    cards.push(("BSCALE".into(), "1.0".into()));
    cards.push(("BZERO".into(), "0.0".into()));

    if let Some(src) = source_header {
        if config.copy_wcs {
            for key in WCS_KEYS {
                if let Some(val) = src.get(key) {
                    cards.push((key.to_string(), val.to_string()));
                }
            }
        }
        if config.copy_obs_metadata {
            for key in OBS_KEYS {
                if let Some(val) = src.get(key) {
                    cards.push((key.to_string(), val.to_string()));
                }
            }
        }
    }

    for (k, v) in &config.extra_cards {
        cards.retain(|(ck, _)| ck != k);
        cards.push((k.clone(), v.clone()));
    }

    if let Some(note) = &config.history {
        cards.push(("HISTORY".into(), note.clone()));
    }

    cards
}

const WCS_KEYS: &[&str] = &[
    "CTYPE1", "CTYPE2", "CRPIX1", "CRPIX2", "CRVAL1", "CRVAL2",
    "CD1_1", "CD1_2", "CD2_1", "CD2_2",
    "CDELT1", "CDELT2", "CROTA2",
    "RADESYS", "EQUINOX", "LONPOLE", "LATPOLE",
];

const OBS_KEYS: &[&str] = &[
    "TELESCOP", "INSTRUME", "OBJECT", "DATE-OBS", "OBSERVER", "ORIGIN",
    "BUNIT", "RESTFRQ", "RESTFREQ", "LINE", "VELREF", "SPECSYS",
];

fn write_header_block(writer: &mut impl Write, cards: &[(String, String)]) -> Result<()> {
    let mut block_bytes = Vec::new();

    for (key, value) in cards {
        let card = format_card(key, value);
        block_bytes.extend_from_slice(card.as_bytes());
    }

    let end_card = format!("{:<80}", "END");
    block_bytes.extend_from_slice(end_card.as_bytes());

    let remainder = block_bytes.len() % BLOCK_SIZE;
    if remainder != 0 {
        let padding = BLOCK_SIZE - remainder;
        block_bytes.extend_from_slice(&vec![b' '; padding]);
    }

    writer.write_all(&block_bytes)?;
    Ok(())
}

fn format_card(key: &str, value: &str) -> String {
    if key == "HISTORY" || key == "COMMENT" {
        return format!("{:<8}{:<72}", key, value);
    }

    let keyword = format!("{:<8}", &key[..key.len().min(8)]);

    let trimmed = value.trim();
    let is_bool = trimmed == "T" || trimmed == "F";
    let is_numeric = trimmed.parse::<f64>().is_ok() || trimmed.parse::<i64>().is_ok();

    let formatted_value = if is_bool || is_numeric {
        format!("{:>20}", trimmed)
    } else {
        let s = if trimmed.len() < 8 {
            format!("{:<8}", trimmed)
        } else {
            trimmed.to_string()
        };
        format!("'{}'", s)
    };

    let card = format!("{}= {}", keyword, formatted_value);
    format!("{:<80}", &card[..card.len().min(80)])
}

fn write_f32_plane(writer: &mut impl Write, image: &Array2<f32>) -> Result<()> {
    let (rows, cols) = image.dim();

    let mut buf = Vec::with_capacity(cols * 4);
    for y in 0..rows {
        buf.clear();
        for x in 0..cols {
            buf.extend_from_slice(&image[[y, x]].to_be_bytes());
        }
        writer.write_all(&buf)?;
    }

    Ok(())
}

fn pad_to_block(writer: &mut impl Write, data_bytes: usize) -> Result<()> {
    let remainder = data_bytes % BLOCK_SIZE;
    if remainder != 0 {
        writer.write_all(&vec![0u8; BLOCK_SIZE - remainder])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mmap::{read_cube, read_cube_slab, read_image};

    #[test]
    fn test_format_card_numeric() {
        let card = format_card("BITPIX", "-32");
        assert_eq!(card.len(), 80);
        assert!(card.starts_with("BITPIX  = "));
        assert!(card.contains("-32"));
    }

    #[test]
    fn test_format_card_string() {
        let card = format_card("OBJECT", "Perseus");
        assert_eq!(card.len(), 80);
        assert!(card.contains("'Perseus"));
    }

    #[test]
    fn test_image_roundtrip() {
        let image = Array2::from_shape_fn((48, 64), |(r, c)| (r * 64 + c) as f32);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.fits");

        let config = FitsWriteConfig {
            history: Some("written by test".into()),
            ..Default::default()
        };
        write_image(&image, &path, None, &config).unwrap();

        let loaded = read_image(&path).unwrap();
        assert_eq!(loaded.data.dim(), (48, 64));
        assert!((loaded.data[[0, 1]] - 1.0).abs() < 1e-4);
        assert!((loaded.data[[47, 63]] - image[[47, 63]]).abs() < 1e-2);
    }

    #[test]
    fn test_cube_roundtrip_with_nan() {
        let mut cube = Array3::from_shape_fn((5, 16, 16), |(z, y, x)| (z * 256 + y * 16 + x) as f32);
        cube[[2, 3, 4]] = f32::NAN;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.fits");

        write_cube(&cube, &path, None, &FitsWriteConfig::default()).unwrap();

        let loaded = read_cube(&path).unwrap();
        assert_eq!(loaded.data.dim(), (5, 16, 16));
        assert!(loaded.data[[2, 3, 4]].is_nan());
        assert!((loaded.data[[4, 15, 15]] - cube[[4, 15, 15]]).abs() < 1e-2);
    }

    #[test]
    fn test_slab_read_matches_full_read() {
        let cube = Array3::from_shape_fn((8, 8, 8), |(z, y, x)| (z * 64 + y * 8 + x) as f32);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.fits");

        let mut config = FitsWriteConfig::default();
        config.extra_cards.push(("CRPIX3".into(), "1.0".into()));
        write_cube(&cube, &path, None, &config).unwrap();

        let slab = read_cube_slab(&path, 2..5).unwrap();
        assert_eq!(slab.data.dim(), (3, 8, 8));
        assert!((slab.data[[0, 0, 0]] - cube[[2, 0, 0]]).abs() < 1e-4);
        assert_eq!(slab.header.axis_len(3), Some(3));
        assert!((slab.header.get_f64("CRPIX3").unwrap() - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_gzipped_input_reads_transparently() {
        use std::io::Write as _;

        let image = Array2::from_shape_fn((16, 16), |(r, c)| (r * 16 + c) as f32);
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("map.fits");
        write_image(&image, &plain, None, &FitsWriteConfig::default()).unwrap();

        let bytes = std::fs::read(&plain).unwrap();
        let gz_path = dir.path().join("map.fits.gz");
        let file = std::fs::File::create(&gz_path).unwrap();
        let mut encoder =
            flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(&bytes).unwrap();
        encoder.finish().unwrap();

        let loaded = read_image(&gz_path).unwrap();
        assert_eq!(loaded.data.dim(), (16, 16));
        assert!((loaded.data[[3, 5]] - image[[3, 5]]).abs() < 1e-4);
    }

    #[test]
    fn test_extra_cards_override_copied_wcs() {
        let image = Array2::from_elem((8, 8), 1.0f32);
        let mut src = HduHeader::default();
        src.set("CRPIX1", "100.0");
        src.set("CDELT2", "0.01");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.fits");
        let config = FitsWriteConfig {
            copy_wcs: true,
            extra_cards: vec![("CRPIX1".into(), "50.0".into())],
            ..Default::default()
        };
        write_image(&image, &path, Some(&src), &config).unwrap();

        let loaded = read_image(&path).unwrap();
        assert_eq!(loaded.header.get_f64("CRPIX1"), Some(50.0));
        assert_eq!(loaded.header.get_f64("CDELT2"), Some(0.01));
    }
}
