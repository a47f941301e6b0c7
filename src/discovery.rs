//! Finding input files and reading metadata from their names.
//!
//! Model output is organized in one of two directory conventions:
//!
//! - ecosystem model outputs: `<base>/<model>/<esm>/<scenario>/<file>.nc`
//! - climate forcing inputs: `<base>/<scenario>/<esm>/<file>.nc`
//!
//! The file names themselves carry the variable name and the first and last year
//! of data, e.g. `boats_gfdl-esm4_nobasd_historical_nat_default_tcb_global_monthly_1950_2014.nc`.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Input directory {} does not exist", .0.display())]
    MissingBaseDir(PathBuf),
    #[error("Could not build a valid glob pattern from {0}")]
    BadPattern(String),
    #[error("Path {} is not valid UTF-8", .0.display())]
    NonUtf8(PathBuf),
}

/// How input files are arranged under the base directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryLayout {
    /// `<model>/<esm>/<scenario>/<file>`
    ModelEsmScenario,
    /// `<scenario>/<esm>/<file>`
    ScenarioEsm,
}

impl DirectoryLayout {
    fn depth(&self) -> usize {
        match self {
            DirectoryLayout::ModelEsmScenario => 3,
            DirectoryLayout::ScenarioEsm => 2,
        }
    }
}

/// An input file with the metadata given by its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// Directory of the file relative to the base directory; outputs go in the same
    /// relative directory under the output root.
    pub rel_dir: PathBuf,
    pub model: Option<String>,
    pub esm: String,
    pub scenario: String,
}

impl DiscoveredFile {
    pub fn file_name(&self) -> &str {
        self.path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
    }

    /// First and last year in the file name, if present.
    pub fn year_range(&self) -> Option<(i32, i32)> {
        year_range(self.file_name())
    }
}

/// Which files to find.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions<'a> {
    pub base_dir: &'a Path,
    pub layout: DirectoryLayout,
    /// Glob pattern matched against file names, e.g. `*_default_tcb_global_*.nc`
    pub file_pattern: &'a str,
    /// Files whose path contains any of these strings (case insensitive) are skipped
    pub exclude: &'a [String],
    /// If given, only these scenarios are kept
    pub scenarios: Option<&'a [String]>,
    /// If given, only these ESMs are kept (case insensitive)
    pub esms: Option<&'a [String]>,
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter().any(|v| v.eq_ignore_ascii_case(value))
}

/// Find all input files matching `opts`, sorted by path. Also returns the number of
/// paths that could not be read while globbing.
pub fn discover(opts: &DiscoveryOptions) -> error_stack::Result<(Vec<DiscoveredFile>, usize), DiscoveryError> {
    if !opts.base_dir.is_dir() {
        return Err(DiscoveryError::MissingBaseDir(opts.base_dir.to_path_buf()).into());
    }

    let mut full_pattern = opts.base_dir.to_path_buf();
    for _ in 0..opts.layout.depth() {
        full_pattern.push("*");
    }
    full_pattern.push(opts.file_pattern);
    let full_pattern = full_pattern.to_str().ok_or_else(|| DiscoveryError::NonUtf8(full_pattern.clone()))?;

    let glob_iter = glob::glob(full_pattern).change_context_lazy(|| DiscoveryError::BadPattern(full_pattern.to_string()))?;

    let mut files = vec![];
    let mut n_glob_err = 0;
    for entry in glob_iter {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                log::debug!("Could not read {} while searching for inputs: {}", e.path().display(), e.error());
                n_glob_err += 1;
                continue;
            }
        };

        let lower_path = path.to_string_lossy().to_lowercase();
        if let Some(ex) = opts.exclude.iter().find(|ex| lower_path.contains(&ex.to_lowercase())) {
            log::debug!("Excluding {} (matches '{ex}')", path.display());
            continue;
        }

        let Some(file) = classify(opts.base_dir, path, opts.layout) else {
            continue;
        };

        if let Some(scenarios) = opts.scenarios {
            if !contains_ignore_case(scenarios, &file.scenario) {
                continue;
            }
        }
        if let Some(esms) = opts.esms {
            if !contains_ignore_case(esms, &file.esm) {
                continue;
            }
        }
        files.push(file);
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    log::info!("Found {} input files under {}", files.len(), opts.base_dir.display());
    Ok((files, n_glob_err))
}

/// Split the path of a file under `base_dir` into its directory components.
fn classify(base_dir: &Path, path: PathBuf, layout: DirectoryLayout) -> Option<DiscoveredFile> {
    let rel_dir = path.parent()?.strip_prefix(base_dir).ok()?.to_path_buf();
    let parts = rel_dir.iter().map(|c| c.to_string_lossy().to_string()).collect_vec();

    let (model, esm, scenario) = match (layout, parts.as_slice()) {
        (DirectoryLayout::ModelEsmScenario, [model, esm, scenario]) => (Some(model.clone()), esm.clone(), scenario.clone()),
        (DirectoryLayout::ScenarioEsm, [scenario, esm]) => (None, esm.clone(), scenario.clone()),
        _ => {
            log::debug!("{} does not follow the expected directory layout, skipping", path.display());
            return None;
        }
    };

    Some(DiscoveredFile { path, rel_dir, model, esm, scenario })
}

/// The first and last year of a file from the `YYYY_YYYY` in its name.
pub fn year_range(file_name: &str) -> Option<(i32, i32)> {
    static YEARS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})_(\d{4})").unwrap());
    let caps = YEARS_RE.captures(file_name)?;
    let start = caps[1].parse().ok()?;
    let end = caps[2].parse().ok()?;
    Some((start, end))
}

/// The part of a file name before `global_`, used as the start of output names. Names
/// without `global_` use their stem followed by an underscore.
pub fn base_name(file_name: &str) -> String {
    match file_name.split_once("global_") {
        Some((base, _)) => base.to_string(),
        None => format!("{}_", file_name.strip_suffix(".nc").unwrap_or(file_name)),
    }
}

/// The variable in an ecosystem model output file name: the text between `default_`
/// and `_global`.
pub fn output_variable_from_file_name(file_name: &str) -> Option<String> {
    let (_, rest) = file_name.rsplit_once("default_")?;
    let (var, _) = rest.split_once("_global")?;
    (!var.is_empty()).then(|| var.to_string())
}

/// The variable in a climate forcing file name: the text after `<scenario>_` and before
/// the resolution (e.g. `_60arcmin`).
pub fn input_variable_from_file_name(file_name: &str, scenario: &str) -> Option<String> {
    static RESOLUTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_\d{2,3}a").unwrap());
    let (_, rest) = file_name.rsplit_once(&format!("{scenario}_"))?;
    let var = match RESOLUTION_RE.find(rest) {
        Some(m) => &rest[..m.start()],
        None => rest,
    };
    (!var.is_empty()).then(|| var.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_range() {
        assert_eq!(year_range("boats_gfdl-esm4_nobasd_historical_nat_default_tcb_global_monthly_1950_2014.nc"), Some((1950, 2014)));
        assert_eq!(year_range("no_years.nc"), None);
    }

    #[test]
    fn test_base_name() {
        assert_eq!(
            base_name("boats_gfdl-esm4_nobasd_historical_nat_default_tcb_global_monthly_1950_2014.nc"),
            "boats_gfdl-esm4_nobasd_historical_nat_default_tcb_"
        );
        assert_eq!(base_name("tcb_1950_2014.nc"), "tcb_1950_2014_");
    }

    #[test]
    fn test_variables_from_names() {
        let f = "boats_gfdl-esm4_nobasd_historical_nat_default_tcb_global_monthly_1950_2014.nc";
        assert_eq!(output_variable_from_file_name(f).as_deref(), Some("tcb"));
        assert_eq!(output_variable_from_file_name("no_marker.nc"), None);

        let f = "gfdl-esm4_r1i1p1f1_historical_thetao_60arcmin_global_monthly_1850_2014.nc";
        assert_eq!(input_variable_from_file_name(f, "historical").as_deref(), Some("thetao"));
        let f = "ipsl-cm6a-lr_r1i1p1f1_ssp585_o2-surf_60arcmin_global_monthly_2015_2100.nc";
        assert_eq!(input_variable_from_file_name(f, "ssp585").as_deref(), Some("o2-surf"));
        assert_eq!(input_variable_from_file_name(f, "historical"), None);
    }

    #[test]
    fn test_discover() {
        let base = std::env::temp_dir().join(format!("picts-discovery-test-{}", std::process::id()));
        let files = [
            "boats/gfdl-esm4/historical/boats_gfdl-esm4_nobasd_historical_nat_default_tcb_global_monthly_1950_2014.nc",
            "boats/gfdl-esm4/picontrol/boats_gfdl-esm4_nobasd_picontrol_nat_default_tcb_global_monthly_1950_2014.nc",
            "dbem/ipsl-cm6a-lr/ssp585/dbem_ipsl-cm6a-lr_nobasd_ssp585_nat_default_tcb_global_monthly_2015_2100.nc",
            "dbem/ipsl-cm6a-lr/ssp585/dbem_ipsl-cm6a-lr_nobasd_ssp585_nat_default_tc_global_monthly_2015_2100.nc",
        ];
        for f in files {
            let p = base.join(f);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(&p, b"").unwrap();
        }

        let exclude = vec!["picontrol".to_string()];
        let opts = DiscoveryOptions {
            base_dir: &base,
            layout: DirectoryLayout::ModelEsmScenario,
            file_pattern: "*_default_tcb_global_*.nc",
            exclude: &exclude,
            scenarios: None,
            esms: None,
        };
        let (found, n_err) = discover(&opts).unwrap();
        assert_eq!(n_err, 0);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].model.as_deref(), Some("boats"));
        assert_eq!(found[0].scenario, "historical");
        assert_eq!(found[0].rel_dir, PathBuf::from("boats/gfdl-esm4/historical"));
        assert_eq!(found[1].esm, "ipsl-cm6a-lr");
        assert_eq!(found[1].year_range(), Some((2015, 2100)));

        let esms = vec!["IPSL-CM6A-LR".to_string()];
        let opts = DiscoveryOptions { esms: Some(&esms), ..opts };
        let (found, _) = discover(&opts).unwrap();
        assert_eq!(found.len(), 1);

        std::fs::remove_dir_all(&base).unwrap();
    }
}
