//! Annual area-weighted means of climate forcing inputs over each region.
//!
//! Variables with a vertical axis are averaged at the surface by default. With
//! `--upper-ocean`, every level in the top 200 m (or `--max-depth`) is written to its
//! own output instead.
use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use error_stack::ResultExt;
use picts_extract::{
    config::{ExtractConfig, PipelineKind},
    default_files::DEFAULT_CONFIG_FILE_NAME,
    pipeline::Pipeline,
    selection::LevelPolicy,
};

fn main() -> ExitCode {
    let clargs = Cli::parse();

    env_logger::Builder::new()
        .filter_level(clargs.verbose.log_level_filter())
        .init();

    match driver(clargs) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("An error occurred:\n{e:?}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Could not load the configuration")]
    Config,
    #[error("Processing stopped early")]
    Batch,
}

/// Compute annual regional means of climate forcing inputs
#[derive(Debug, Parser)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    /// Path to the configuration file
    #[clap(short, long, default_value = DEFAULT_CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Glob pattern for input file names, overriding the one in the configuration.
    #[clap(long)]
    file_pattern: Option<String>,

    /// Write one output per vertical level in the upper ocean rather than using the
    /// surface level only.
    #[clap(long)]
    upper_ocean: bool,

    /// Deepest level to include with --upper-ocean, in meters.
    #[clap(long, default_value_t = 200.0, requires = "upper_ocean")]
    max_depth: f64,
}

fn driver(clargs: Cli) -> error_stack::Result<(), CliError> {
    let mut config = ExtractConfig::read_from_path(&clargs.config).change_context(CliError::Config)?;
    if clargs.upper_ocean {
        if let Some(section) = config.forcing_means.as_mut() {
            section.level_policy = LevelPolicy::UpperOcean { max_depth: clargs.max_depth };
        }
    }

    let mut pipeline = Pipeline::new(&config, PipelineKind::ForcingMeans, None, clargs.file_pattern)
        .change_context(CliError::Batch)?;
    let report = pipeline.run().change_context(CliError::Batch)?;
    report.print_summary();
    Ok(())
}
