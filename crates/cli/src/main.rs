//! Bidflow CLI for running and validating orchestration scenarios.
//!
//! This tool provides commands for:
//! - Running a scenario against simulated plugins and printing what rendered
//! - Validating a scenario file without running it

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;

use bidflow_common::logging::init_logger;

mod error;
mod runner;
mod scenario;
mod simulated;

use error::CliError;
use scenario::Scenario;

#[derive(Parser)]
#[command(name = "bidflow")]
#[command(about = "Run header bidding orchestration scenarios against simulated plugins")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario and print a report
    Run {
        /// Path to the scenario TOML file
        #[arg(long, short)]
        file: PathBuf,

        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,

        /// Wait in real time instead of on a simulated clock
        #[arg(long)]
        realtime: bool,
    },

    /// Validate a scenario file without running it
    Validate {
        /// Path to the scenario TOML file
        #[arg(long, short)]
        file: PathBuf,
    },
}

#[derive(Clone, ValueEnum, Debug)]
pub enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    init_logger(level).map_err(|e| CliError::Config(format!("{e:?}")))?;

    match cli.command {
        Commands::Run {
            file,
            format,
            realtime,
        } => {
            let mut scenario = Scenario::load(&file)?;
            if cli.verbose {
                scenario.settings.debug = true;
                log::info!("Running scenario: {}", file.display());
            }
            let report = runner::run(&scenario, realtime)?;
            match format {
                OutputFormat::Text => print!("{}", report.to_text()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            Ok(())
        }
        Commands::Validate { file } => {
            let scenario = Scenario::load(&file)?;
            println!("Scenario is valid");
            println!("  File: {}", file.display());
            println!("  Ads: {}", scenario.ads.len());
            println!("  Plugins: {}", scenario.plugins.len());
            println!("  Actions: {}", scenario.steps.len());
            if cli.verbose {
                println!("  Bidder timeout: {}ms", scenario.settings.bidder_timeout_ms);
                println!("  Throttle timeout: {}ms", scenario.settings.throttle_timeout_ms);
                println!("  Run for: {}ms", scenario.run_for.as_millis());
            }
            Ok(())
        }
    }
}
