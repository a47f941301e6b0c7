use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    aggregate::{AggregationSpec, Statistic, DEFAULT_TIME_CHUNK},
    calendar::{Granularity, YearWindow},
    discovery::DirectoryLayout,
    output::OutputFormat,
    path_relative_to_config,
    selection::LevelPolicy,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("The TOML file {path} is not correct: {reason}")]
    BadToml { path: String, reason: String },
    #[error("The configuration has no [{0}] section")]
    MissingSection(&'static str),
    #[error("The [{section}] section refers to grid '{grid}', which is not defined in [grids]")]
    UnknownGrid { section: &'static str, grid: String },
    #[error("More information required in the configuration: {0}")]
    UserInputReq(String),
}

/// Top level configuration file.
///
/// Each processing program reads the `[grids]` table plus its own section. Relative paths
/// are interpreted relative to the directory containing the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    /// Area and region mask rasters, by name
    pub grids: BTreeMap<String, GridConfig>,

    /// Monthly sums of ecosystem model outputs
    pub monthly_sums: Option<PipelineConfig>,

    /// Annual area-weighted means of ecosystem model outputs
    pub yearly_means: Option<PipelineConfig>,

    /// Annual area-weighted means of climate forcing inputs
    pub forcing_means: Option<PipelineConfig>,
}

/// Which section of the configuration a program uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    MonthlySums,
    YearlyMeans,
    ForcingMeans,
}

impl PipelineKind {
    pub fn section_name(&self) -> &'static str {
        match self {
            PipelineKind::MonthlySums => "monthly_sums",
            PipelineKind::YearlyMeans => "yearly_means",
            PipelineKind::ForcingMeans => "forcing_means",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    /// netCDF file containing the area and mask variables
    pub file: PathBuf,

    /// Name of the per-pixel area variable
    #[serde(default = "default_area_variable")]
    pub area_variable: String,

    /// Name of the region label variable
    #[serde(default = "default_mask_variable")]
    pub mask_variable: String,

    /// Factor to multiply areas by, the default converts km² to m²
    #[serde(default = "default_area_scale")]
    pub area_scale: f64,
}

fn default_area_variable() -> String {
    "area".to_string()
}

fn default_mask_variable() -> String {
    "mask".to_string()
}

fn default_area_scale() -> f64 {
    crate::KM2_TO_M2
}

/// Where the name of the variable to aggregate comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableSource {
    /// The `variable` setting or a command line argument
    Fixed,
    /// Ecosystem model output names: the text between `default_` and `_global`
    OutputFileName,
    /// Climate forcing names: the text between the scenario and the resolution
    InputFileName,
}

/// Assigns a grid to files of a particular model, ESM and/or variable. Every field given
/// must match (case insensitively) for the rule to apply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GridRule {
    /// Impact model name, i.e. the first directory level of ecosystem outputs
    pub model: Option<String>,

    /// Text that must appear in the ESM name
    pub esm_contains: Option<String>,

    /// Variables this rule applies to
    pub variables: Option<Vec<String>>,

    /// Name of the grid to use, must be a key of `[grids]`
    pub grid: String,
}

impl GridRule {
    pub fn matches(&self, model: Option<&str>, esm: &str, variable: &str) -> bool {
        let model_ok = match (&self.model, model) {
            (None, _) => true,
            (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
            (Some(_), None) => false,
        };
        let esm_ok = self
            .esm_contains
            .as_ref()
            .map(|s| esm.to_lowercase().contains(&s.to_lowercase()))
            .unwrap_or(true);
        let var_ok = self
            .variables
            .as_ref()
            .map(|vars| vars.iter().any(|v| v.eq_ignore_ascii_case(variable)))
            .unwrap_or(true);
        model_ok && esm_ok && var_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Directory to search for input files
    pub base_dir: PathBuf,

    /// Root directory for outputs; each output goes in the same relative subdirectory
    /// as its input
    pub output_dir: PathBuf,

    pub layout: DirectoryLayout,

    /// Glob pattern for input file names. May be left out for programs that ask for it.
    pub file_pattern: Option<String>,

    /// Paths containing any of these strings are skipped
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Only process these scenarios
    pub scenarios: Option<Vec<String>>,

    /// Only process these ESMs
    pub esms: Option<Vec<String>>,

    pub variable_source: VariableSource,

    /// Variable to aggregate when `variable_source = "fixed"`
    pub variable: Option<String>,

    /// Grid used by files no rule matches
    pub default_grid: String,

    /// Checked in order, the first match wins
    #[serde(default)]
    pub grid_rules: Vec<GridRule>,

    pub granularity: Granularity,

    pub statistic: Statistic,

    /// Multiplied into every output value
    #[serde(default = "default_unit_scale")]
    pub unit_scale: f64,

    /// Units attribute for netCDF outputs
    pub output_units: Option<String>,

    /// Years to keep, by scenario
    #[serde(default)]
    pub time_windows: HashMap<String, YearWindow>,

    #[serde(default)]
    pub level_policy: LevelPolicy,

    /// Output file name pattern, without extension; see
    /// [`crate::utils::pattern_replacement::render_output_name`]
    pub output_pattern: String,

    pub formats: Vec<OutputFormat>,

    /// Number of time steps read at once
    #[serde(default = "default_time_chunk")]
    pub time_chunk: usize,
}

fn default_unit_scale() -> f64 {
    1.0
}

fn default_time_chunk() -> usize {
    DEFAULT_TIME_CHUNK
}

impl PipelineConfig {
    /// The year window for files of `scenario`, if any.
    pub fn window_for(&self, scenario: &str) -> Option<YearWindow> {
        self.time_windows
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(scenario))
            .map(|(_, w)| *w)
    }

    pub fn aggregation_spec(&self, scenario: &str) -> AggregationSpec {
        AggregationSpec::new(self.granularity, self.statistic)
            .with_unit_scale(self.unit_scale)
            .with_window(self.window_for(scenario))
            .with_time_chunk(self.time_chunk)
    }

    /// Names of every grid this pipeline can use.
    pub fn grid_names(&self) -> Vec<&str> {
        let mut names = vec![self.default_grid.as_str()];
        for rule in self.grid_rules.iter() {
            if !names.contains(&rule.grid.as_str()) {
                names.push(rule.grid.as_str());
            }
        }
        names
    }

    fn resolve_paths(&mut self, config_file: &Path) {
        self.base_dir = path_relative_to_config(config_file, std::mem::take(&mut self.base_dir));
        self.output_dir = path_relative_to_config(config_file, std::mem::take(&mut self.output_dir));
    }
}

impl ExtractConfig {
    pub fn read_from_path<P: AsRef<Path>>(p: P) -> Result<Self, ConfigError> {
        let p = p.as_ref();
        let text = std::fs::read_to_string(p)
            .map_err(|e| ConfigError::IoError(format!("could not read configuration file {}: {e}", p.display())))?;
        let mut cfg = Self::from_toml_str(&text).map_err(|e| match e {
            ConfigError::BadToml { path: _, reason } => ConfigError::BadToml { path: p.display().to_string(), reason },
            e => e,
        })?;

        for grid in cfg.grids.values_mut() {
            grid.file = path_relative_to_config(p, std::mem::take(&mut grid.file));
        }
        for section in [&mut cfg.monthly_sums, &mut cfg.yearly_means, &mut cfg.forcing_means] {
            if let Some(section) = section {
                section.resolve_paths(p);
            }
        }
        Ok(cfg)
    }

    /// Parse and validate a configuration. Paths are left as written.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text).map_err(|e| ConfigError::BadToml { path: "(string)".to_string(), reason: e.to_string() })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for kind in [PipelineKind::MonthlySums, PipelineKind::YearlyMeans, PipelineKind::ForcingMeans] {
            let Ok(section) = self.pipeline(kind) else {
                continue;
            };
            for grid in section.grid_names() {
                if !self.grids.contains_key(grid) {
                    return Err(ConfigError::UnknownGrid { section: kind.section_name(), grid: grid.to_string() });
                }
            }
            if section.variable_source == VariableSource::Fixed && section.variable.as_deref().map(|v| v.is_empty()).unwrap_or(false) {
                return Err(ConfigError::UserInputReq(format!("[{}] has an empty variable name", kind.section_name())));
            }
        }
        Ok(())
    }

    pub fn pipeline(&self, kind: PipelineKind) -> Result<&PipelineConfig, ConfigError> {
        let section = match kind {
            PipelineKind::MonthlySums => &self.monthly_sums,
            PipelineKind::YearlyMeans => &self.yearly_means,
            PipelineKind::ForcingMeans => &self.forcing_means,
        };
        section.as_ref().ok_or(ConfigError::MissingSection(kind.section_name()))
    }

    pub fn grid(&self, name: &str) -> Option<&GridConfig> {
        self.grids.get(name)
    }
}

/// Picks the grid for each (model, ESM, variable) from a pipeline's rules, remembering
/// past answers.
#[derive(Debug, Clone)]
pub struct GridResolver {
    rules: Vec<GridRule>,
    default_grid: String,
    cache: HashMap<(Option<String>, String, String), String>,
}

impl GridResolver {
    pub fn new(pipeline: &PipelineConfig) -> Self {
        Self { rules: pipeline.grid_rules.clone(), default_grid: pipeline.default_grid.clone(), cache: HashMap::new() }
    }

    pub fn resolve(&mut self, model: Option<&str>, esm: &str, variable: &str) -> &str {
        let key = (model.map(|m| m.to_lowercase()), esm.to_lowercase(), variable.to_lowercase());
        let rules = &self.rules;
        let default_grid = &self.default_grid;
        self.cache.entry(key).or_insert_with(|| {
            let grid = rules
                .iter()
                .find(|r| r.matches(model, esm, variable))
                .map(|r| r.grid.clone())
                .unwrap_or_else(|| default_grid.clone());
            log::debug!("Using grid '{grid}' for model {model:?}, ESM '{esm}', variable '{variable}'");
            grid
        })
        .as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_files::DEFAULT_CONFIG_TOML;

    #[test]
    fn test_default_config_parses() {
        let cfg = ExtractConfig::from_toml_str(DEFAULT_CONFIG_TOML).unwrap();
        let monthly = cfg.pipeline(PipelineKind::MonthlySums).unwrap();
        assert_eq!(monthly.granularity, Granularity::Month);
        assert_eq!(monthly.statistic, Statistic::Sum);
        assert_eq!(monthly.unit_scale, crate::GRAMS_TO_TONNES);
        assert_eq!(monthly.window_for("historical"), Some(YearWindow { first: 1950, last: 2015 }));
        assert_eq!(monthly.window_for("ssp585"), None);
        assert_eq!(monthly.exclude, vec!["picontrol"]);

        // picontrol is aggregated by year in the annual means
        let yearly = cfg.pipeline(PipelineKind::YearlyMeans).unwrap();
        assert!(yearly.exclude.is_empty());

        let forcing = cfg.pipeline(PipelineKind::ForcingMeans).unwrap();
        assert_eq!(forcing.level_policy, LevelPolicy::Surface);
        assert_eq!(forcing.formats, vec![OutputFormat::Netcdf, OutputFormat::Csv]);

        assert_eq!(cfg.grid("one_degree").unwrap().area_scale, 1e6);
    }

    #[test]
    fn test_grid_rules() {
        let cfg = ExtractConfig::from_toml_str(DEFAULT_CONFIG_TOML).unwrap();
        let monthly = cfg.pipeline(PipelineKind::MonthlySums).unwrap();
        let mut resolver = GridResolver::new(monthly);
        assert_eq!(resolver.resolve(Some("dbpm"), "gfdl-esm4", "tcb"), "one_degree_dbpm");
        assert_eq!(resolver.resolve(Some("zoomss"), "ipsl-cm6a-lr", "tcb"), "one_degree_dbpm");
        assert_eq!(resolver.resolve(Some("zoomss"), "gfdl-esm4", "tcb"), "one_degree");
        assert_eq!(resolver.resolve(Some("DBEM"), "ipsl-cm6a-lr", "tcb"), "half_degree");
        assert_eq!(resolver.resolve(Some("boats"), "ipsl-cm6a-lr", "tcb"), "one_degree");
        // cached answers are the same
        assert_eq!(resolver.resolve(Some("dbpm"), "gfdl-esm4", "tcb"), "one_degree_dbpm");
    }

    #[test]
    fn test_variable_rule() {
        let rule = GridRule { model: None, esm_contains: None, variables: Some(vec!["uo".to_string(), "vo".to_string()]), grid: "velocity".to_string() };
        assert!(rule.matches(None, "gfdl-esm4", "uo"));
        assert!(!rule.matches(None, "gfdl-esm4", "thetao"));
    }

    #[test]
    fn test_unknown_grid() {
        let toml = r#"
            [grids.a]
            file = "a.nc"

            [yearly_means]
            base_dir = "in"
            output_dir = "out"
            layout = "model_esm_scenario"
            variable_source = "output_file_name"
            default_grid = "b"
            granularity = "year"
            statistic = "mean"
            output_pattern = "{BASE}mean"
            formats = ["csv"]
        "#;
        let e = ExtractConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(e, ConfigError::UnknownGrid { .. }));
        let cfg = ExtractConfig::from_toml_str(&toml.replace("\"b\"", "\"a\"")).unwrap();
        assert!(matches!(cfg.pipeline(PipelineKind::MonthlySums), Err(ConfigError::MissingSection(_))));
        assert_eq!(cfg.grid("a").unwrap().mask_variable, "mask");
    }

    #[test]
    fn test_relative_paths() {
        let dir = std::env::temp_dir().join(format!("picts-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cfg_path = dir.join("picts.toml");
        std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML).unwrap();
        let cfg = ExtractConfig::read_from_path(&cfg_path).unwrap();
        assert_eq!(cfg.grid("one_degree").unwrap().file, dir.join("Masks/PICT/masked-grid-area_1deg.nc"));
        assert_eq!(cfg.pipeline(PipelineKind::MonthlySums).unwrap().output_dir, dir.join("Extract_PICTs"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
