//! This program writes the default configuration for the extraction programs,
//! creating its directory if needed.
//!
//! Running it again is harmless: an identical configuration is left alone, and one
//! with different contents is only overwritten after showing the differences and
//! getting confirmation.
use std::{path::{Path, PathBuf}, process::ExitCode};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use colored::Colorize;
use itertools::Itertools;
use picts_extract::{
    default_files::{DEFAULT_CONFIG_FILE_NAME, DEFAULT_CONFIG_TOML},
    utils::{confirm, PromptError},
};


fn main() -> ExitCode {
    let clargs = Cli::parse();

    env_logger::Builder::new()
    .filter_level(clargs.verbose.log_level_filter())
    .init();

    match write_config(&clargs.config, DEFAULT_CONFIG_TOML, clargs.yes) {
        Ok(outcome) => {
            let status_text = match outcome {
                InitOutcome::Skipped(_) => "SKIPPED".on_red().black().bold(),
                _ => "OK".on_green().black().bold(),
            };
            println!("{status_text:^8} {}", outcome.describe(&clargs.config));
            if let InitOutcome::Skipped(_) = outcome {
                ExitCode::from(2)
            } else {
                println!("Edit the input and output directories before running the extraction programs.");
                ExitCode::SUCCESS
            }
        },
        Err(e) => {
            eprintln!("Error writing the configuration:\n{e}");
            ExitCode::FAILURE
        }
    }
}

/// Write the default configuration for the PICTs extraction programs
#[derive(Debug, clap::Parser)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    /// Where to write the configuration.
    #[clap(default_value = DEFAULT_CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Automatically answer "yes" to any prompts.
    #[clap(short = 'y', long)]
    yes: bool,
}

#[derive(Debug, thiserror::Error)]
enum InitError {
    #[error("Aborted initialization")]
    UserAbort,
    #[error("{0} exists but is not a directory")]
    NotADirectory(PathBuf),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, PartialEq)]
enum InitOutcome {
    Created,
    Overwritten,
    Unchanged,
    Skipped(String),
}

impl InitOutcome {
    fn describe(&self, dest: &Path) -> String {
        match self {
            InitOutcome::Created => format!("Created {}", dest.display()),
            InitOutcome::Overwritten => format!("Overwrote {} with the default configuration", dest.display()),
            InitOutcome::Unchanged => format!("{} already has the default contents", dest.display()),
            InitOutcome::Skipped(reason) => format!("Left {} as is: {reason}", dest.display()),
        }
    }
}

/// Whether the configuration file needs created or overwritten.
#[derive(Debug, PartialEq)]
enum ConfigStatus {
    Missing,
    Same,
    /// The file exists with other contents, which are contained here.
    Differs(String),
}

fn config_status(dest: &Path, wanted: &str) -> std::io::Result<ConfigStatus> {
    if !dest.exists() {
        return Ok(ConfigStatus::Missing);
    }

    let current = std::fs::read_to_string(dest)?;
    if current == wanted {
        Ok(ConfigStatus::Same)
    } else {
        Ok(ConfigStatus::Differs(current))
    }
}

/// Unified diff going from the file on disk to the default contents.
fn render_diff(current: &str, wanted: &str, dest: &Path) -> Vec<String> {
    let current_lines = current.split('\n').collect_vec();
    let wanted_lines = wanted.split('\n').collect_vec();
    difflib::unified_diff(
        &current_lines,
        &wanted_lines,
        &format!("On disk ({})", dest.display()),
        "Default",
        "",
        "",
        3)
}

fn print_diff(diff: &[String]) {
    for line in diff {
        if line.starts_with('+') {
            println!("{}", line.green());
        } else if line.starts_with('-') {
            println!("{}", line.red());
        } else {
            println!("{line}");
        }
    }
}

fn write_config(dest: &Path, contents: &str, always_yes: bool) -> Result<InitOutcome, InitError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        if parent.is_file() {
            return Err(InitError::NotADirectory(parent.to_path_buf()));
        } else if !parent.exists() {
            log::info!("Creating directory {}", parent.display());
            std::fs::create_dir_all(parent)?;
        }
    }

    let outcome = match config_status(dest, contents)? {
        ConfigStatus::Same => return Ok(InitOutcome::Unchanged),
        ConfigStatus::Missing => InitOutcome::Created,
        ConfigStatus::Differs(current) => {
            if !always_yes {
                print_diff(&render_diff(&current, contents, dest));
            }
            match confirm("Okay to overwrite?", always_yes) {
                Ok(true) => InitOutcome::Overwritten,
                Ok(false) => return Ok(InitOutcome::Skipped("declined to overwrite".to_string())),
                Err(PromptError::NotInteractive(_)) => return Ok(InitOutcome::Skipped(
                    "input required but program is not running interactively (use --yes to overwrite)".to_string()
                )),
                Err(PromptError::Cancelled) => return Err(InitError::UserAbort),
                Err(PromptError::IoError(e)) => return Err(InitError::IoError(e)),
                Err(PromptError::Other(e)) => return Err(InitError::Other(e)),
            }
        },
    };

    std::fs::write(dest, contents)?;
    Ok(outcome)
}
