use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::{Array2, Array3};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{DatasetConfig, RunConfig};
use crate::domain::convolve::{convolve_cube, kernel_to_common_beam};
use crate::domain::cube::{
    crop_cube, crop_image, moment0, moment1, moment2, update_crpix_for_crop,
};
use crate::domain::distance::{
    pdf_distance, power_spectrum_distance, scf_distance, PairDistances,
};
use crate::domain::downsample::{bin_channels, downsample_cube, update_header_for_downsample};
use crate::domain::fits_writer::{write_cube, write_image, FitsWriteConfig};
use crate::domain::pdf::{intensity_pdf, normalized_samples, shared_log_edges, IntensityPdf};
use crate::domain::powerspec::{power_spectrum_2d, spectrum_from_2d, PowerSpectrum};
use crate::domain::scf::{scf, ScfResult};
use crate::domain::stats::{field_stats, FieldStats};
use crate::domain::trim::data_extent;
use crate::domain::vca::{vca, VcaPoint};
use crate::model::{Beam, BeamError, VelocityAxis};
use crate::utils::discover::resolve_dataset_file;
use crate::utils::mmap::{cube_info, read_cube, read_cube_slab, read_image};
use crate::utils::render::{render_grayscale, render_log_power};

// ---------------------------------------------------------------------------
// Stage 1: homogenize
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HomogenizedProducts {
    pub name: String,
    pub tracer: Option<String>,
    pub cube_path: PathBuf,
    pub moment0_path: PathBuf,
    pub moment1_path: PathBuf,
    pub moment2_path: PathBuf,
    /// (channels, rows, cols) of the written cube.
    pub dims: [usize; 3],
    pub native_beam: Beam,
    pub common_beam: Beam,
}

#[derive(Debug, Clone, Serialize)]
pub enum HomogenizeResult {
    Ok {
        products: HomogenizedProducts,
        elapsed_ms: u64,
    },
    Err {
        name: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct HomogenizeSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub common_beam: Beam,
    pub results: Vec<HomogenizeResult>,
}

/// Stage 1: bring every configured dataset to a common angular resolution
/// and grid, writing homogenized cubes, moment maps and quicklooks. One
/// dataset failing does not abort the batch.
pub fn run_homogenize(cfg: &RunConfig) -> Result<HomogenizeSummary> {
    let start = Instant::now();

    fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("Failed to create output dir {:?}", cfg.output_dir))?;

    let target = common_target_beam(cfg)?;
    log::info!(
        "Homogenizing {} datasets to a {:.1}\" beam",
        cfg.datasets.len(),
        target.geometric_fwhm_arcsec()
    );

    let results: Vec<HomogenizeResult> = cfg
        .datasets
        .par_iter()
        .map(|ds| {
            let file_start = Instant::now();
            match homogenize_dataset(cfg, ds, &target) {
                Ok(products) => HomogenizeResult::Ok {
                    products,
                    elapsed_ms: file_start.elapsed().as_millis() as u64,
                },
                Err(e) => HomogenizeResult::Err {
                    name: ds.name.clone(),
                    error: format!("{:#}", e),
                },
            }
        })
        .collect();

    let succeeded = results
        .iter()
        .filter(|r| matches!(r, HomogenizeResult::Ok { .. }))
        .count();
    let failed = results.len() - succeeded;

    Ok(HomogenizeSummary {
        total: results.len(),
        succeeded,
        failed,
        elapsed_ms: start.elapsed().as_millis() as u64,
        common_beam: target,
        results,
    })
}

/// The configured target beam, or the coarsest native beam found among the
/// datasets.
fn common_target_beam(cfg: &RunConfig) -> Result<Beam> {
    if let Some(beam) = cfg.target_beam {
        return Ok(beam);
    }

    let mut coarsest: Option<Beam> = None;
    for ds in &cfg.datasets {
        let native = match native_beam(ds) {
            Ok(beam) => beam,
            Err(e) => {
                log::warn!("No native beam for {}: {:#}", ds.name, e);
                continue;
            }
        };
        let better = match coarsest {
            Some(current) => native.geometric_fwhm_arcsec() > current.geometric_fwhm_arcsec(),
            None => true,
        };
        if better {
            coarsest = Some(native);
        }
    }

    coarsest.context("No dataset provides beam information; set target_beam in the configuration")
}

fn native_beam(ds: &DatasetConfig) -> Result<Beam> {
    if let Some(beam) = ds.beam {
        return Ok(beam);
    }
    let file = resolve_dataset_file(&ds.path, ds.pattern.as_deref())?;
    let (header, _) = cube_info(&file)?;
    Ok(Beam::from_header(&header).ok_or(BeamError::Missing)?)
}

fn homogenize_dataset(
    cfg: &RunConfig,
    ds: &DatasetConfig,
    target: &Beam,
) -> Result<HomogenizedProducts> {
    let file = resolve_dataset_file(&ds.path, ds.pattern.as_deref())?;
    let (raw_header, geometry) = cube_info(&file)?;
    let full_axis = VelocityAxis::from_header(&raw_header)
        .with_context(|| format!("{:?} has no usable spectral axis", file))?;

    // decode only the velocity window from the mmap
    let (start_chan, end_chan) = match &cfg.velocity_range {
        Some(w) => full_axis
            .channel_range(w.min_kms * 1e3, w.max_kms * 1e3)
            .with_context(|| {
                format!(
                    "No channels of {} fall inside [{}, {}] km/s",
                    ds.name, w.min_kms, w.max_kms
                )
            })?,
        None => (0, geometry.naxis3),
    };

    let loaded = read_cube_slab(&file, start_chan..end_chan)?;
    let mut header = loaded.header;
    let mut cube = loaded.data;
    let mut axis = full_axis.slab(start_chan, end_chan);

    let native = ds
        .beam
        .or_else(|| Beam::from_header(&header))
        .ok_or(BeamError::Missing)?;

    if cfg.trim.enabled {
        let (_, rows, cols) = cube.dim();
        let rect = data_extent(&cube, cfg.trim.threshold_sigma, cfg.trim.margin)?;
        if rect.shape() != (rows, cols) {
            log::info!(
                "{}: trimming {}x{} -> {}x{}",
                ds.name,
                rows,
                cols,
                rect.shape().0,
                rect.shape().1
            );
            cube = crop_cube(&cube, rect.y0, rect.y1, rect.x0, rect.x1);
            update_crpix_for_crop(&mut header, rect.y0, rect.x0);
        }
    }

    if let Some(kernel) = kernel_to_common_beam(&native, target, &header)? {
        log::info!(
            "{}: smoothing {:.1}\" -> {:.1}\"",
            ds.name,
            native.geometric_fwhm_arcsec(),
            target.geometric_fwhm_arcsec()
        );
        cube = convolve_cube(&cube, &kernel);
    }

    if cfg.spatial_downsample > 1 {
        cube = downsample_cube(&cube, cfg.spatial_downsample);
        update_header_for_downsample(&mut header, cfg.spatial_downsample);
    }
    if cfg.spectral_bin > 1 {
        cube = bin_channels(&cube, cfg.spectral_bin);
        axis = axis.binned(cfg.spectral_bin);
    }

    let out_dir = cfg.dataset_dir(&ds.name);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create dataset dir {:?}", out_dir))?;

    let mut cube_cards = axis.to_cards();
    cube_cards.extend(target.to_cards());
    let cube_path = out_dir.join("cube.fits");
    write_cube(
        &cube,
        &cube_path,
        Some(&header),
        &FitsWriteConfig {
            extra_cards: cube_cards,
            copy_wcs: true,
            copy_obs_metadata: true,
            history: Some("homogenized: trim, common beam, downsample".into()),
        },
    )?;

    let m0 = moment0(&cube, &axis);
    let m1 = moment1(&cube, &axis);
    let m2 = moment2(&cube, &axis);

    let moment0_path = out_dir.join("moment0.fits");
    let moment1_path = out_dir.join("moment1.fits");
    let moment2_path = out_dir.join("moment2.fits");
    for (map, path, unit) in [
        (&m0, &moment0_path, "K km/s"),
        (&m1, &moment1_path, "km/s"),
        (&m2, &moment2_path, "km/s"),
    ] {
        let mut cards = target.to_cards();
        cards.push(("BUNIT".into(), unit.into()));
        write_image(
            map,
            path,
            Some(&header),
            &FitsWriteConfig {
                extra_cards: cards,
                copy_wcs: true,
                copy_obs_metadata: true,
                history: None,
            },
        )?;
    }

    render_grayscale(&m0, &out_dir.join("moment0.png"))?;
    render_grayscale(&m1, &out_dir.join("moment1.png"))?;

    let (depth, rows, cols) = cube.dim();
    Ok(HomogenizedProducts {
        name: ds.name.clone(),
        tracer: ds.tracer.clone(),
        cube_path,
        moment0_path,
        moment1_path,
        moment2_path,
        dims: [depth, rows, cols],
        native_beam: native,
        common_beam: *target,
    })
}

// ---------------------------------------------------------------------------
// Stage 2: analyze
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    /// Dataset name, or "dataset/region".
    pub name: String,
    pub tracer: Option<String>,
    pub dims: [usize; 3],
    pub beam: Option<Beam>,
    pub stats: FieldStats,
    pub power_spectrum: PowerSpectrum,
    pub vca: Vec<VcaPoint>,
    pub pdf: IntensityPdf,
    pub scf: ScfResult,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub datasets: Vec<UnitReport>,
    pub pairs: Vec<PairDistances>,
    pub failures: Vec<UnitFailure>,
    pub elapsed_ms: u64,
}

struct UnitData {
    name: String,
    tracer: Option<String>,
    beam: Option<Beam>,
    cube: Array3<f32>,
    m0: Array2<f32>,
    samples: Vec<f32>,
}

/// Stage 2: per-dataset turbulence statistics over the homogenized
/// products, then the pairwise distance matrix. Writes `report.json` and
/// quicklooks under the output directory.
pub fn run_analysis(cfg: &RunConfig) -> Result<AnalysisReport> {
    let start = Instant::now();

    let loaded: Vec<(Vec<UnitData>, Vec<UnitFailure>)> = cfg
        .datasets
        .par_iter()
        .map(|ds| load_units(cfg, ds))
        .collect();

    let mut units = Vec::new();
    let mut failures = Vec::new();
    for (mut u, mut f) in loaded {
        units.append(&mut u);
        failures.append(&mut f);
    }

    if units.is_empty() {
        anyhow::bail!(
            "No analyzable datasets; run the homogenize stage first ({} failures)",
            failures.len()
        );
    }

    let sample_refs: Vec<&[f32]> = units.iter().map(|u| u.samples.as_slice()).collect();
    let edges = shared_log_edges(&sample_refs, cfg.analysis.pdf_bins)?;

    let analyzed: Vec<(String, Result<UnitReport>)> = units
        .par_iter()
        .map(|unit| (unit.name.clone(), analyze_unit(cfg, unit, &edges)))
        .collect();

    let mut reports = Vec::new();
    for (name, result) in analyzed {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => failures.push(UnitFailure {
                name,
                error: format!("{:#}", e),
            }),
        }
    }

    let mut pairs = Vec::new();
    for i in 0..reports.len() {
        for j in (i + 1)..reports.len() {
            let a = &reports[i];
            let b = &reports[j];
            let pdf_d = pdf_distance(&a.pdf, &b.pdf)?;
            pairs.push(PairDistances {
                a: a.name.clone(),
                b: b.name.clone(),
                power_spectrum: power_spectrum_distance(&a.power_spectrum, &b.power_spectrum),
                scf: scf_distance(&a.scf, &b.scf)?,
                pdf_hellinger: pdf_d.hellinger,
                pdf_ks: pdf_d.ks,
            });
        }
    }

    let report = AnalysisReport {
        datasets: reports,
        pairs,
        failures,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    let report_path = cfg.output_dir.join("report.json");
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    fs::write(&report_path, json)
        .with_context(|| format!("Failed to write report {:?}", report_path))?;
    log::info!(
        "Analyzed {} units, {} pairs -> {:?}",
        report.datasets.len(),
        report.pairs.len(),
        report_path
    );

    Ok(report)
}

/// The full homogenized map plus any configured sub-regions, each as an
/// independent analysis unit.
fn load_units(cfg: &RunConfig, ds: &DatasetConfig) -> (Vec<UnitData>, Vec<UnitFailure>) {
    let mut units = Vec::new();
    let mut failures = Vec::new();

    let cube_path = cfg.dataset_dir(&ds.name).join("cube.fits");
    let loaded = match read_cube(&cube_path) {
        Ok(l) => l,
        Err(e) => {
            failures.push(UnitFailure {
                name: ds.name.clone(),
                error: format!("{:#} (run the homogenize stage first?)", e),
            });
            return (units, failures);
        }
    };

    if VelocityAxis::from_header(&loaded.header).is_none() {
        failures.push(UnitFailure {
            name: ds.name.clone(),
            error: format!("{:?} has no usable spectral axis", cube_path),
        });
        return (units, failures);
    }
    let beam = Beam::from_header(&loaded.header);

    // the integrated-intensity product written alongside the cube
    let moment0_path = cfg.dataset_dir(&ds.name).join("moment0.fits");
    let m0 = match read_image(&moment0_path) {
        Ok(l) => l.data,
        Err(e) => {
            failures.push(UnitFailure {
                name: ds.name.clone(),
                error: format!("{:#}", e),
            });
            return (units, failures);
        }
    };

    units.push(UnitData {
        name: ds.name.clone(),
        tracer: ds.tracer.clone(),
        beam,
        samples: normalized_samples(&m0),
        m0: m0.clone(),
        cube: loaded.data.clone(),
    });

    let (_, rows, cols) = loaded.data.dim();
    for region in &ds.regions {
        let name = format!("{}/{}", ds.name, region.name);
        let y1 = region.y + region.height;
        let x1 = region.x + region.width;
        if y1 > rows || x1 > cols {
            failures.push(UnitFailure {
                name,
                error: format!(
                    "Region [{}..{}, {}..{}] exceeds the {}x{} homogenized map",
                    region.y, y1, region.x, x1, rows, cols
                ),
            });
            continue;
        }
        let sub_m0 = crop_image(&m0, region.y, y1, region.x, x1);
        units.push(UnitData {
            name,
            tracer: ds.tracer.clone(),
            beam,
            samples: normalized_samples(&sub_m0),
            m0: sub_m0,
            cube: crop_cube(&loaded.data, region.y, y1, region.x, x1),
        });
    }

    (units, failures)
}

fn analyze_unit(cfg: &RunConfig, unit: &UnitData, edges: &[f64]) -> Result<UnitReport> {
    let start = Instant::now();
    let a = &cfg.analysis;
    let (depth, rows, cols) = unit.cube.dim();

    let stats = field_stats(&unit.m0);

    let ps2d = power_spectrum_2d(&unit.m0);
    let power_spectrum = spectrum_from_2d(&ps2d, a.fit_low, a.fit_high)
        .with_context(|| format!("Power-spectrum fit failed for {}", unit.name))?;

    let thicknesses: Vec<usize> = a
        .vca_thicknesses
        .iter()
        .copied()
        .filter(|&t| t >= 1 && t <= depth)
        .collect();
    if thicknesses.len() < a.vca_thicknesses.len() {
        log::warn!(
            "{}: dropping VCA thicknesses beyond the {}-channel cube",
            unit.name,
            depth
        );
    }
    anyhow::ensure!(
        !thicknesses.is_empty(),
        "No usable VCA thickness for a {}-channel cube",
        depth
    );
    let vca_points = vca(&unit.cube, &thicknesses, a.fit_low, a.fit_high)
        .with_context(|| format!("VCA failed for {}", unit.name))?;

    let pdf = intensity_pdf(&unit.m0, edges)
        .with_context(|| format!("PDF failed for {}", unit.name))?;

    let scf_result = scf(&unit.cube, a.scf_max_lag)
        .with_context(|| format!("SCF failed for {}", unit.name))?;

    let unit_dir = cfg.output_dir.join(&unit.name);
    fs::create_dir_all(&unit_dir)
        .with_context(|| format!("Failed to create unit dir {:?}", unit_dir))?;
    render_log_power(&ps2d, &unit_dir.join("power_spectrum.png"))?;
    render_grayscale(&unit.m0, &unit_dir.join("moment0.png"))?;

    Ok(UnitReport {
        name: unit.name.clone(),
        tracer: unit.tracer.clone(),
        dims: [depth, rows, cols],
        beam: unit.beam,
        stats,
        power_spectrum,
        vca: vca_points,
        pdf,
        scf: scf_result,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisConfig, RegionConfig, TrimConfig, VelocityWindow};
    use crate::domain::synth::write_synthetic_dataset;

    fn demo_config(root: &std::path::Path) -> RunConfig {
        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();

        write_synthetic_dataset(
            &data_dir.join("perseus.fits"),
            12,
            48,
            48,
            -3.2,
            0.6,
            &Beam::circular(30.0),
            30.0,
            200.0,
            101,
        )
        .unwrap();
        write_synthetic_dataset(
            &data_dir.join("orion.fits"),
            12,
            48,
            48,
            -2.6,
            0.9,
            &Beam::circular(40.0),
            30.0,
            200.0,
            202,
        )
        .unwrap();

        RunConfig {
            output_dir: root.join("products"),
            target_beam: None,
            velocity_range: Some(VelocityWindow {
                min_kms: 0.2,
                max_kms: 1.8,
            }),
            spatial_downsample: 2,
            spectral_bin: 1,
            trim: TrimConfig::default(),
            analysis: AnalysisConfig {
                vca_thicknesses: vec![1, 2],
                scf_max_lag: 3,
                pdf_bins: 24,
                fit_low: 0.05,
                fit_high: 0.45,
            },
            datasets: vec![
                DatasetConfig {
                    name: "perseus".into(),
                    path: data_dir.join("perseus.fits"),
                    pattern: None,
                    tracer: Some("12co".into()),
                    beam: None,
                    regions: vec![RegionConfig {
                        name: "ne".into(),
                        x: 2,
                        y: 2,
                        width: 16,
                        height: 16,
                    }],
                },
                DatasetConfig {
                    name: "orion".into(),
                    path: data_dir.join("orion.fits"),
                    pattern: None,
                    tracer: Some("12co".into()),
                    beam: None,
                    regions: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_two_stage_pipeline_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = demo_config(dir.path());

        let summary = run_homogenize(&cfg).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 2, "failures: {:?}", summary.results);
        // coarsest native beam wins when no target is configured
        assert!((summary.common_beam.major_arcsec - 40.0).abs() < 1e-3);

        for result in &summary.results {
            match result {
                HomogenizeResult::Ok { products, .. } => {
                    // 9 channels inside the window, 48/2 pixels per side
                    assert_eq!(products.dims, [9, 24, 24]);
                    assert!(products.cube_path.exists());
                    assert!(products.moment0_path.exists());
                }
                HomogenizeResult::Err { name, error } => {
                    panic!("{} failed: {}", name, error)
                }
            }
        }

        // the homogenized cube carries the common beam
        let loaded = read_cube(&cfg.dataset_dir("perseus").join("cube.fits")).unwrap();
        let beam = Beam::from_header(&loaded.header).unwrap();
        assert!((beam.major_arcsec - 40.0).abs() < 1e-3);

        let report = run_analysis(&cfg).unwrap();
        assert!(report.failures.is_empty(), "failures: {:?}", report.failures);
        // two full maps plus one region
        assert_eq!(report.datasets.len(), 3);
        assert_eq!(report.pairs.len(), 3);

        for unit in &report.datasets {
            assert!(unit.power_spectrum.slope.is_finite());
            assert!(unit.scf.slope.is_finite());
            assert!(unit.pdf.sample_count > 0);
            assert_eq!(unit.vca.len(), 2);
        }

        for pair in &report.pairs {
            assert!(pair.power_spectrum >= 0.0);
            assert!(pair.scf >= 0.0);
            assert!(pair.pdf_hellinger >= 0.0 && pair.pdf_hellinger <= 1.0);
        }

        assert!(cfg.output_dir.join("report.json").exists());
        assert!(cfg
            .output_dir
            .join("perseus/ne")
            .join("power_spectrum.png")
            .exists());
    }

    #[test]
    fn test_missing_input_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = demo_config(dir.path());
        cfg.datasets[1].path = dir.path().join("data/missing.fits");

        let summary = run_homogenize(&cfg).unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let failed: Vec<_> = summary
            .results
            .iter()
            .filter_map(|r| match r {
                HomogenizeResult::Err { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec!["orion".to_string()]);
    }

    #[test]
    fn test_analysis_without_products_fails_clearly() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = demo_config(dir.path());
        // no homogenize run
        let err = run_analysis(&cfg).unwrap_err();
        assert!(format!("{:#}", err).contains("homogenize"));
    }
}
