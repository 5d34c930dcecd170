use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use regex::Regex;

fn is_fits_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".fits") || lower.ends_with(".fit") || lower.ends_with(".fits.gz")
}

/// All FITS files in `dir` whose names match `pattern`, sorted by name.
pub fn find_fits_files(dir: &Path, pattern: &Regex) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read input directory {:?}", dir))?;

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_fits_name(&name) && pattern.is_match(&name) {
            matches.push(entry.path());
        }
    }

    matches.sort();
    Ok(matches)
}

/// Resolve a dataset input to exactly one FITS file. A direct file path is
/// taken as-is; a directory needs a pattern that singles one file out.
pub fn resolve_dataset_file(path: &Path, pattern: Option<&str>) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        bail!("Dataset path {:?} does not exist", path);
    }

    let pattern = pattern.with_context(|| {
        format!("Dataset path {:?} is a directory; a file pattern is required", path)
    })?;
    let re = Regex::new(pattern)
        .with_context(|| format!("Invalid dataset file pattern '{}'", pattern))?;

    let matches = find_fits_files(path, &re)?;
    match matches.len() {
        0 => bail!("No FITS file in {:?} matches '{}'", path, pattern),
        1 => Ok(matches.into_iter().next().unwrap()),
        n => bail!(
            "{} FITS files in {:?} match '{}'; narrow the pattern",
            n,
            path,
            pattern
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_12co.fits", "a_12co.fits", "a_13co.fits", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let re = Regex::new("12co").unwrap();
        let found = find_fits_files(dir.path(), &re).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_12co.fits", "b_12co.fits"]);
    }

    #[test]
    fn test_resolve_requires_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_12co.fits"), b"x").unwrap();
        std::fs::write(dir.path().join("b_12co.fits"), b"x").unwrap();

        assert!(resolve_dataset_file(dir.path(), Some("12co")).is_err());
        assert!(resolve_dataset_file(dir.path(), Some("a_12co")).is_ok());
        assert!(resolve_dataset_file(dir.path(), None).is_err());
    }
}
