use std::path::PathBuf;

use anyhow::{Context, Result};

use turbkit::config::{AnalysisConfig, DatasetConfig, RunConfig, TrimConfig, VelocityWindow};
use turbkit::domain::synth::write_synthetic_dataset;
use turbkit::model::Beam;

struct DemoCloud {
    name: &'static str,
    slope: f64,
    amplitude: f64,
    beam_arcsec: f64,
    seed: u64,
}

// Loose stand-ins for the survey maps of the three clouds: different
// spectral slopes, density contrasts and native resolutions.
const CLOUDS: &[DemoCloud] = &[
    DemoCloud {
        name: "perseus",
        slope: -3.2,
        amplitude: 0.7,
        beam_arcsec: 46.0,
        seed: 12,
    },
    DemoCloud {
        name: "ophiuchus",
        slope: -2.8,
        amplitude: 0.9,
        beam_arcsec: 38.0,
        seed: 34,
    },
    DemoCloud {
        name: "orion",
        slope: -2.5,
        amplitude: 1.1,
        beam_arcsec: 52.0,
        seed: 56,
    },
];

const DEPTH: usize = 32;
const SIZE: usize = 192;
const PIXSCALE_ARCSEC: f64 = 23.0;
const CHANNEL_WIDTH_MS: f64 = 130.0;

fn main() -> Result<()> {
    env_logger::init();

    let out_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"));
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {:?}", out_dir))?;

    let mut datasets = Vec::new();
    for cloud in CLOUDS {
        let file = out_dir.join(format!("{}_12co.fits", cloud.name));
        log::info!("Generating {:?}", file);
        write_synthetic_dataset(
            &file,
            DEPTH,
            SIZE,
            SIZE,
            cloud.slope,
            cloud.amplitude,
            &Beam::circular(cloud.beam_arcsec),
            PIXSCALE_ARCSEC,
            CHANNEL_WIDTH_MS,
            cloud.seed,
        )?;

        datasets.push(DatasetConfig {
            name: cloud.name.to_string(),
            path: file.file_name().unwrap().into(),
            pattern: None,
            tracer: Some("12co".into()),
            beam: None,
            regions: vec![],
        });
    }

    let window = DEPTH as f64 * CHANNEL_WIDTH_MS / 1e3;
    let cfg = RunConfig {
        output_dir: PathBuf::from("products"),
        target_beam: None,
        velocity_range: Some(VelocityWindow {
            min_kms: window * 0.125,
            max_kms: window * 0.875,
        }),
        spatial_downsample: 2,
        spectral_bin: 1,
        trim: TrimConfig::default(),
        analysis: AnalysisConfig::default(),
        datasets,
    };

    let config_path = out_dir.join("turbkit.yaml");
    std::fs::write(&config_path, cfg.to_yaml()?)
        .with_context(|| format!("Failed to write {:?}", config_path))?;

    println!(
        "Wrote {} demo cubes and {:?}; run homogenize and analyze against it",
        CLOUDS.len(),
        config_path
    );
    Ok(())
}
