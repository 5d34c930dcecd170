use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;

use turbkit::config;
use turbkit::domain::pipeline::run_analysis;

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    let cfg = config::load(&config_path)?;
    let report = run_analysis(&cfg)?;

    println!("\nPer-dataset statistics");
    println!(
        "{:<16} {:>10} {:>10} {:>10} {:>10}",
        "dataset", "ps slope", "scf slope", "ln sigma", "pixels"
    );
    for unit in &report.datasets {
        println!(
            "{:<16} {:>10.3} {:>10.3} {:>10.3} {:>10}",
            unit.name,
            unit.power_spectrum.slope,
            unit.scf.slope,
            unit.pdf.lognormal_sigma,
            unit.stats.valid_count
        );
    }

    println!("\nPairwise distances");
    println!(
        "{:<16} {:<16} {:>8} {:>8} {:>10} {:>8}",
        "a", "b", "ps", "scf", "hellinger", "ks"
    );
    for pair in &report.pairs {
        println!(
            "{:<16} {:<16} {:>8.3} {:>8.4} {:>10.4} {:>8.4}",
            pair.a, pair.b, pair.power_spectrum, pair.scf, pair.pdf_hellinger, pair.pdf_ks
        );
    }

    if !report.failures.is_empty() {
        println!("\nFailures");
        for failure in &report.failures {
            println!("{:<16} {}", failure.name, failure.error);
        }
    }

    Ok(())
}
