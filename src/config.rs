use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::Beam;

const CONFIG_FILENAME: &str = "turbkit.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    /// A FITS file, or a directory searched with `pattern`.
    pub path: PathBuf,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub tracer: Option<String>,
    /// Overrides the header beam when the survey file lacks BMAJ/BMIN.
    #[serde(default)]
    pub beam: Option<Beam>,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VelocityWindow {
    pub min_kms: f64,
    pub max_kms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    pub enabled: bool,
    pub margin: usize,
    pub threshold_sigma: Option<f64>,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            margin: 2,
            threshold_sigma: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub vca_thicknesses: Vec<usize>,
    pub scf_max_lag: usize,
    pub pdf_bins: usize,
    /// Power-law fit window in fractional spatial frequency (cycles/pixel).
    pub fit_low: f64,
    pub fit_high: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            vca_thicknesses: vec![1, 2, 4, 8],
            scf_max_lag: 10,
            pdf_bins: 60,
            fit_low: 0.02,
            fit_high: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Common resolution for homogenization. Omitted: the coarsest native
    /// beam among the datasets is used.
    #[serde(default)]
    pub target_beam: Option<Beam>,
    #[serde(default)]
    pub velocity_range: Option<VelocityWindow>,
    #[serde(default = "default_one")]
    pub spatial_downsample: usize,
    #[serde(default = "default_one")]
    pub spectral_bin: usize,
    #[serde(default)]
    pub trim: TrimConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    pub datasets: Vec<DatasetConfig>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("products")
}

fn default_one() -> usize {
    1
}

/// `turbkit.yaml` beside the current directory, falling back to the user
/// config directory.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILENAME);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("turbkit")
        .join(CONFIG_FILENAME)
}

/// Load a run configuration: YAML file layered with `TURBKIT_`-prefixed
/// environment overrides. Relative paths resolve against the file's
/// directory.
pub fn load(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        bail!("Run configuration {:?} does not exist", path);
    }

    let settings = config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()))
        .add_source(
            config::Environment::with_prefix("TURBKIT")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read run configuration {:?}", path))?;

    let mut run: RunConfig = settings
        .try_deserialize()
        .with_context(|| format!("Run configuration {:?} is malformed", path))?;

    validate(&run)?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    if run.output_dir.is_relative() {
        run.output_dir = base.join(&run.output_dir);
    }
    for dataset in &mut run.datasets {
        if dataset.path.is_relative() {
            dataset.path = base.join(&dataset.path);
        }
    }

    Ok(run)
}

fn validate(run: &RunConfig) -> Result<()> {
    if run.datasets.is_empty() {
        bail!("Run configuration lists no datasets");
    }
    let mut names: Vec<&str> = run.datasets.iter().map(|d| d.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != run.datasets.len() {
        bail!("Dataset names must be unique");
    }
    if run.spatial_downsample == 0 || run.spectral_bin == 0 {
        bail!("Downsampling factors must be at least 1");
    }
    if let Some(w) = &run.velocity_range {
        if w.min_kms >= w.max_kms {
            bail!(
                "Velocity window [{}, {}] km/s is empty",
                w.min_kms,
                w.max_kms
            );
        }
    }
    if run.analysis.fit_low <= 0.0 || run.analysis.fit_high <= run.analysis.fit_low {
        bail!(
            "Power-law fit range [{}, {}] is invalid",
            run.analysis.fit_low,
            run.analysis.fit_high
        );
    }
    Ok(())
}

impl RunConfig {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize run configuration")
    }

    pub fn dataset_dir(&self, dataset_name: &str) -> PathBuf {
        self.output_dir.join(dataset_name)
    }
}
