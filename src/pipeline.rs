//! Running one of the extraction pipelines over a batch of files.
//!
//! Problems with a single input file (an undecodable time axis, a missing variable, a
//! grid mismatch) are logged and the file is skipped. Problems that would affect every
//! file (bad configuration, an unloadable grid, an unwritable output directory) stop the
//! batch.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use colored::Colorize;
use error_stack::{Report, ResultExt};
use itertools::Itertools;

use crate::{
    aggregate::{check_coordinates, AggregateError, AggregationSpec, Aggregator, RegionTable},
    calendar::{from_year_range, normalize_time, CalendarError, TimeAxis},
    config::{ExtractConfig, GridResolver, PipelineConfig, PipelineKind, VariableSource},
    discovery::{discover, input_variable_from_file_name, output_variable_from_file_name, DiscoveredFile, DiscoveryOptions},
    field::{should_mask_sentinels, FieldSource, SentinelMasked},
    netcdf_io::{NcDataset, TableAttributes},
    output::write_table,
    regions::RegionGrid,
    selection::{bin_ids, select_variable, BinId, FieldLayout, LevelPolicy, LevelSelection, SelectionError, BIN_AXIS_NAME},
    utils::pattern_replacement::{render_output_name, OutputNameParts},
};

/// Errors scoped to a single input file.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("Could not open or read the file")]
    FileUnreadable,
    #[error("Could not interpret the time coordinate")]
    MalformedTimeUnits,
    #[error("The time steps are neither annual nor monthly")]
    UnsupportedFrequency,
    #[error("No time steps fall in the years to keep")]
    EmptyTimeWindow,
    #[error("Could not find the variable to aggregate")]
    VariableNotFound,
    #[error("The variable's dimensions cannot be aggregated")]
    UnsupportedLayout,
    #[error("The file does not match its region grid")]
    GridMismatch,
    #[error("Could not build an output file name")]
    OutputName,
    #[error("Could not write outputs")]
    Output,
}

impl FileError {
    /// Whether the batch can carry on with the next file after this error. Output
    /// errors are not skippable, since they will most likely happen for every file.
    pub fn is_skippable(&self) -> bool {
        !matches!(self, FileError::OutputName | FileError::Output)
    }
}

impl From<&CalendarError> for FileError {
    fn from(value: &CalendarError) -> Self {
        match value {
            CalendarError::UnsupportedFrequency { .. } | CalendarError::InvertedYearRange { .. } => FileError::UnsupportedFrequency,
            _ => FileError::MalformedTimeUnits,
        }
    }
}

impl From<&SelectionError> for FileError {
    fn from(value: &SelectionError) -> Self {
        match value {
            SelectionError::VariableNotFound { .. } => FileError::VariableNotFound,
            _ => FileError::UnsupportedLayout,
        }
    }
}

impl From<&AggregateError> for FileError {
    fn from(value: &AggregateError) -> Self {
        match value {
            AggregateError::GridMismatch { .. } => FileError::GridMismatch,
            AggregateError::TimeLengthMismatch { .. } => FileError::MalformedTimeUnits,
            AggregateError::ReadFailed => FileError::FileUnreadable,
        }
    }
}

/// Change the context of a report to the [`FileError`] matching its current context.
fn to_file_error<C>(report: Report<C>) -> Report<FileError>
where
    C: error_stack::Context,
    for<'a> &'a C: Into<FileError>,
{
    let ctx: FileError = report.current_context().into();
    report.change_context(ctx)
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Problem with the configuration")]
    Config,
    #[error("Could not load region grid '{0}'")]
    GridLoad(String),
    #[error("Could not search for input files")]
    Discovery,
    #[error("Stopping: could not process {}", .0.display())]
    File(PathBuf),
}

/// What happened to one input file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Written(Vec<PathBuf>),
    Skipped(String),
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(PathBuf, FileOutcome)>,
    /// Number of paths that could not be read while searching for inputs
    pub n_glob_errors: usize,
}

impl BatchReport {
    pub fn n_skipped(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| matches!(o, FileOutcome::Skipped(_))).count()
    }

    pub fn n_written(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| matches!(o, FileOutcome::Written(_))).count()
    }

    pub fn print_summary(&self) {
        println!("\nSummary:");
        for (path, outcome) in self.outcomes.iter() {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_else(|| path.to_string_lossy());
            match outcome {
                FileOutcome::Written(outputs) => {
                    println!("{:^9} {name} ({} outputs)", "OK".on_green().black().bold(), outputs.len())
                }
                FileOutcome::Skipped(reason) => println!("{:^9} {name}: {reason}", "SKIPPED".on_red().black().bold()),
            }
        }

        println!("\n{} files processed, {} skipped.", self.n_written(), self.n_skipped());
        if self.n_glob_errors > 0 {
            println!("{} paths could not be read while searching for input files.", self.n_glob_errors);
        }
    }
}

/// The variable to look for in a file, given where the pipeline takes names from.
pub fn target_variable(source: VariableSource, fixed: Option<&str>, file: &DiscoveredFile) -> Option<String> {
    match source {
        VariableSource::Fixed => fixed.map(|v| v.to_string()),
        VariableSource::OutputFileName => output_variable_from_file_name(file.file_name()),
        VariableSource::InputFileName => input_variable_from_file_name(file.file_name(), &file.scenario),
    }
}

/// Use the decoded time axis when there is one of the right length, otherwise rebuild it
/// from the file's year range.
pub fn resolve_time_axis(
    decoded: error_stack::Result<TimeAxis, FileError>,
    years: Option<(i32, i32)>,
    n_steps: usize,
) -> error_stack::Result<TimeAxis, FileError> {
    let reason = match decoded {
        Ok(axis) if axis.len() == n_steps => return Ok(axis),
        Ok(axis) => Report::new(FileError::MalformedTimeUnits)
            .attach_printable(format!("Time coordinate has {} values but the data have {n_steps} steps", axis.len())),
        Err(e) => e,
    };

    let Some((start, end)) = years else {
        return Err(reason.attach_printable("The file name has no YYYY_YYYY year range to fall back on"));
    };
    log::info!("Time units could not be used, inferring the time axis from the years {start}-{end} in the file name");
    from_year_range(start, end, n_steps)
        .map_err(Report::new)
        .map_err(to_file_error)
        .attach_printable_lazy(|| format!("While inferring the time axis from the years {start}-{end}"))
}

/// Where outputs for `file` go.
pub fn output_dir_for(output_root: &Path, file: &DiscoveredFile) -> PathBuf {
    output_root.join(&file.rel_dir)
}

/// One (level, bin) slab of a file to aggregate separately.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Slab {
    level_index: usize,
    /// Set when levels are aggregated separately, so outputs need a level in their name
    level: Option<LevelSelection>,
    bin_index: usize,
    bin: Option<BinId>,
}

/// Aggregate one field and write its outputs. Separated from the netCDF handling so
/// that any [`FieldSource`] can go through it.
#[allow(clippy::too_many_arguments)]
pub fn aggregate_and_write<F: FieldSource>(
    field: &F,
    axis: &TimeAxis,
    grid: &RegionGrid,
    spec: AggregationSpec,
    cfg: &PipelineConfig,
    file: &DiscoveredFile,
    var_name: &str,
    names: (Option<LevelSelection>, Option<BinId>),
    attrs: &TableAttributes,
) -> error_stack::Result<Vec<PathBuf>, FileError> {
    let table = Aggregator::new(grid, spec).aggregate(field, axis).map_err(to_file_error)?;

    let (start_year, end_year) = table_years(&table).ok_or_else(|| {
        Report::new(FileError::EmptyTimeWindow).attach_printable(match spec.window {
            Some(w) => format!("No time steps between {} and {}", w.first, w.last),
            None => "No time steps".to_string(),
        })
    })?;

    let (level, bin) = names;
    let parts = OutputNameParts { source_file_name: file.file_name(), variable: var_name, bin, level, start_year, end_year };
    let stem = render_output_name(&cfg.output_pattern, &parts).change_context(FileError::OutputName)?;
    write_table(&output_dir_for(&cfg.output_dir, file), &stem, &table, &cfg.formats, var_name, attrs).change_context(FileError::Output)
}

fn table_years(table: &RegionTable) -> Option<(i32, i32)> {
    let first = table.buckets.first()?.year();
    let last = table.buckets.last()?.year();
    Some((first, last))
}

/// One configured pipeline with its grids loaded.
pub struct Pipeline<'c> {
    cfg: &'c PipelineConfig,
    grids: HashMap<String, RegionGrid>,
    resolver: GridResolver,
    variable: Option<String>,
    file_pattern: String,
}

impl<'c> Pipeline<'c> {
    /// Set up a pipeline, loading every grid it may use. `variable` and `file_pattern`
    /// override the configuration's values.
    pub fn new(
        config: &'c ExtractConfig,
        kind: PipelineKind,
        variable: Option<String>,
        file_pattern: Option<String>,
    ) -> error_stack::Result<Self, BatchError> {
        let cfg = config.pipeline(kind).change_context(BatchError::Config)?;
        let variable = variable.or_else(|| cfg.variable.clone());
        if cfg.variable_source == VariableSource::Fixed && variable.is_none() {
            return Err(Report::new(BatchError::Config)
                .attach_printable(format!("[{}] needs a variable to process", kind.section_name())));
        }
        let file_pattern = file_pattern.or_else(|| cfg.file_pattern.clone()).ok_or_else(|| {
            Report::new(BatchError::Config).attach_printable(format!("[{}] needs a file_pattern", kind.section_name()))
        })?;

        let mut grids = HashMap::new();
        for name in cfg.grid_names() {
            let grid_cfg = config
                .grid(name)
                .ok_or_else(|| BatchError::GridLoad(name.to_string()))
                .attach_printable("Grid is not defined in the configuration")?;
            log::info!("Loading grid '{name}' from {}", grid_cfg.file.display());
            let grid = NcDataset::open(&grid_cfg.file)
                .and_then(|ds| ds.load_region_grid(name, &grid_cfg.area_variable, &grid_cfg.mask_variable, grid_cfg.area_scale))
                .change_context_lazy(|| BatchError::GridLoad(name.to_string()))?;
            grids.insert(name.to_string(), grid);
        }

        Ok(Self { cfg, grids, resolver: GridResolver::new(cfg), variable, file_pattern })
    }

    pub fn discover(&self) -> error_stack::Result<(Vec<DiscoveredFile>, usize), BatchError> {
        let opts = DiscoveryOptions {
            base_dir: &self.cfg.base_dir,
            layout: self.cfg.layout,
            file_pattern: &self.file_pattern,
            exclude: &self.cfg.exclude,
            scenarios: self.cfg.scenarios.as_deref(),
            esms: self.cfg.esms.as_deref(),
        };
        discover(&opts).change_context(BatchError::Discovery)
    }

    /// Process every input file, skipping those with file-scoped problems.
    pub fn run(&mut self) -> error_stack::Result<BatchReport, BatchError> {
        let (files, n_glob_errors) = self.discover()?;
        if files.is_empty() {
            log::warn!("No files matching '{}' found under {}", self.file_pattern, self.cfg.base_dir.display());
        }

        let mut report = BatchReport { outcomes: vec![], n_glob_errors };
        for file in files.iter() {
            log::info!("Processing {}", file.path.display());
            match self.process_file(file) {
                Ok(outputs) => report.outcomes.push((file.path.clone(), FileOutcome::Written(outputs))),
                Err(e) if e.current_context().is_skippable() => {
                    log::warn!("Skipping {}: {e:?}", file.path.display());
                    report.outcomes.push((file.path.clone(), FileOutcome::Skipped(e.current_context().to_string())));
                }
                Err(e) => return Err(e.change_context(BatchError::File(file.path.clone()))),
            }
        }
        Ok(report)
    }

    /// Aggregate one input file and write its outputs.
    pub fn process_file(&mut self, file: &DiscoveredFile) -> error_stack::Result<Vec<PathBuf>, FileError> {
        let ds = NcDataset::open(&file.path).change_context(FileError::FileUnreadable)?;

        let target = target_variable(self.cfg.variable_source, self.variable.as_deref(), file).ok_or_else(|| {
            Report::new(FileError::VariableNotFound).attach_printable(format!("Could not tell the variable to process from the name {}", file.file_name()))
        })?;
        let data_vars = ds.data_variables();
        let var_name = select_variable(&data_vars, &target).map_err(|e| to_file_error(Report::new(e)))?.to_string();
        if var_name != target {
            log::debug!("Using variable '{var_name}' for '{target}' in {}", file.file_name());
        }

        let dims = ds.dimensions_of(&var_name).change_context(FileError::FileUnreadable)?;
        let layout = FieldLayout::from_dims(&var_name, &dims).map_err(|e| to_file_error(Report::new(e)))?;

        let grid_name = self.resolver.resolve(file.model.as_deref(), &file.esm, &target).to_string();
        let grid = self
            .grids
            .get(&grid_name)
            .ok_or_else(|| Report::new(FileError::GridMismatch).attach_printable(format!("Grid '{grid_name}' was not loaded")))?;
        let (lat, lon) = ds.horizontal_coordinates(&var_name).change_context(FileError::FileUnreadable)?;
        check_coordinates(grid, &lat, &lon).change_context(FileError::GridMismatch)?;

        let time_dim = &dims[0].0;
        let decoded = ds
            .time_values(time_dim)
            .change_context(FileError::MalformedTimeUnits)
            .and_then(|(values, units, calendar)| {
                normalize_time(&values, &units, calendar.as_deref()).map_err(|e| to_file_error(Report::new(e)))
            });
        let axis = resolve_time_axis(decoded, file.year_range(), layout.n_time)?;

        let slabs = self.slabs(&ds, &layout)?;
        let spec = self.cfg.aggregation_spec(&file.scenario);

        let fields = slabs
            .iter()
            .map(|slab| ds.field(&var_name, &layout, slab.level_index, slab.bin_index))
            .collect::<Result<Vec<_>, _>>()
            .change_context(FileError::FileUnreadable)?;
        let mask_sentinels = should_mask_sentinels(&fields, spec.time_chunk).change_context(FileError::FileUnreadable)?;

        let attrs = TableAttributes {
            long_name: ds.string_attribute(&var_name, "long_name").ok().flatten(),
            units: self.cfg.output_units.clone().or_else(|| ds.string_attribute(&var_name, "units").ok().flatten()),
            source_file: Some(file.file_name().to_string()),
        };

        let mut outputs = vec![];
        for (slab, field) in slabs.into_iter().zip(fields) {
            let field = SentinelMasked::new(field, mask_sentinels);
            let written = aggregate_and_write(&field, &axis, grid, spec, self.cfg, file, &var_name, (slab.level, slab.bin), &attrs)
                .attach_printable_lazy(|| match (slab.level, slab.bin) {
                    (Some(l), _) => format!("For level {l}"),
                    (None, Some(b)) => format!("For bin {b}"),
                    (None, None) => format!("For variable '{var_name}'"),
                })?;
            outputs.extend(written);
        }
        Ok(outputs)
    }

    /// The (level, bin) combinations to aggregate from a file.
    fn slabs(&self, ds: &NcDataset, layout: &FieldLayout) -> error_stack::Result<Vec<Slab>, FileError> {
        let levels: Vec<(usize, Option<LevelSelection>)> = match &layout.level {
            None => vec![(0, None)],
            Some((name, n)) => {
                let depths = ds.coordinate(name).change_context(FileError::FileUnreadable)?;
                let units = ds.string_attribute(name, "units").ok().flatten();
                let selected = self
                    .cfg
                    .level_policy
                    .select_levels(*n, depths.as_deref().map(|d| (d, units.as_deref())))
                    .map_err(|e| to_file_error(Report::new(e)))?;
                let split = matches!(self.cfg.level_policy, LevelPolicy::UpperOcean { .. });
                if split {
                    log::debug!("Aggregating levels {} separately", selected.iter().join(", "));
                }
                selected.into_iter().map(|l| (l.index, split.then_some(l))).collect()
            }
        };

        let bins: Vec<(usize, Option<BinId>)> = match layout.n_bins {
            None => vec![(0, None)],
            Some(n) => {
                let values = ds.coordinate(BIN_AXIS_NAME).change_context(FileError::FileUnreadable)?;
                bin_ids(n, values.as_deref()).into_iter().enumerate().map(|(i, id)| (i, Some(id))).collect()
            }
        };

        Ok(levels
            .into_iter()
            .cartesian_product(bins)
            .map(|((level_index, level), (bin_index, bin))| Slab { level_index, level, bin_index, bin })
            .collect())
    }
}
