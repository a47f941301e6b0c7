//! Monthly area-weighted sums of ecosystem model outputs over each region, in tonnes.
//!
//! The variable to process and the glob pattern for input files may be given on the
//! command line or in the `[monthly_sums]` section of the configuration. If neither
//! has them, they are asked for interactively.
use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use error_stack::ResultExt;
use picts_extract::{
    config::{ExtractConfig, PipelineKind},
    default_files::DEFAULT_CONFIG_FILE_NAME,
    pipeline::Pipeline,
    utils::value_or_prompt,
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
    #[error("Missing required input")]
    Input,
    #[error("Processing stopped early")]
    Batch,
}

/// Compute monthly regional sums of ecosystem model outputs
#[derive(Debug, Parser)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    /// Path to the configuration file
    #[clap(short, long, default_value = DEFAULT_CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Variable to sum, e.g. "tcb". Asked for if not given here or in the configuration.
    #[clap(long)]
    variable: Option<String>,

    /// Glob pattern for input file names. Asked for if not given here or in the configuration.
    #[clap(long)]
    file_pattern: Option<String>,
}

fn driver(clargs: Cli) -> error_stack::Result<(), CliError> {
    let config = ExtractConfig::read_from_path(&clargs.config).change_context(CliError::Config)?;
    let section = config.pipeline(PipelineKind::MonthlySums).change_context(CliError::Config)?;

    let variable = value_or_prompt(clargs.variable.or_else(|| section.variable.clone()), "Variable to sum", None)
        .change_context(CliError::Input)?;
    let suggested = format!("*_default_{variable}_g*.nc");
    let file_pattern = value_or_prompt(
        clargs.file_pattern.or_else(|| section.file_pattern.clone()),
        "Input file pattern",
        Some(&suggested),
    )
    .change_context(CliError::Input)?;

    let mut pipeline = Pipeline::new(&config, PipelineKind::MonthlySums, Some(variable), Some(file_pattern))
        .change_context(CliError::Batch)?;
    let report = pipeline.run().change_context(CliError::Batch)?;
    report.print_summary();
    Ok(())
}
