//! Annual area-weighted means of ecosystem model outputs over each region.
//!
//! The variable in each file is taken from its name (the text between `default_` and
//! `_global`), so one run covers every variable matching the configured file pattern.
use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use error_stack::ResultExt;
use picts_extract::{
    config::{ExtractConfig, PipelineKind},
    default_files::DEFAULT_CONFIG_FILE_NAME,
    pipeline::Pipeline,
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

/// Compute annual regional means of ecosystem model outputs
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
}

fn driver(clargs: Cli) -> error_stack::Result<(), CliError> {
    let config = ExtractConfig::read_from_path(&clargs.config).change_context(CliError::Config)?;
    let mut pipeline = Pipeline::new(&config, PipelineKind::YearlyMeans, None, clargs.file_pattern)
        .change_context(CliError::Batch)?;
    let report = pipeline.run().change_context(CliError::Batch)?;
    report.print_summary();
    Ok(())
}
