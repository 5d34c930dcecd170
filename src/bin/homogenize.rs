use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;

use turbkit::config;
use turbkit::domain::pipeline::{run_homogenize, HomogenizeResult};

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(failed) if failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<usize> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    let cfg = config::load(&config_path)?;
    let summary = run_homogenize(&cfg)?;

    for result in &summary.results {
        match result {
            HomogenizeResult::Ok {
                products,
                elapsed_ms,
            } => {
                println!(
                    "{:<12} {:>4} ch {:>4}x{:<4}  {:.1}\" -> {:.1}\"  {} ms",
                    products.name,
                    products.dims[0],
                    products.dims[1],
                    products.dims[2],
                    products.native_beam.geometric_fwhm_arcsec(),
                    products.common_beam.geometric_fwhm_arcsec(),
                    elapsed_ms
                );
            }
            HomogenizeResult::Err { name, error } => {
                println!("{:<12} FAILED: {}", name, error);
            }
        }
    }
    println!(
        "{}/{} datasets homogenized in {} ms -> {:?}",
        summary.succeeded, summary.total, summary.elapsed_ms, cfg.output_dir
    );

    Ok(summary.failed)
}
