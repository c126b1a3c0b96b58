//! printflow command line.
//!
//! - `printflow discover` probes serial ports and prints what answered
//! - `printflow print <file>` streams a G-code file to a printer
//! - `printflow run "<request>"` drives a workflow through all four phases,
//!   with mock agents standing in for research, CAD and slicing

mod commands;
mod logging;
mod printer;

use clap::{Parser, Subcommand};
use pf_protocol::workflow_models::{Phase, Priority};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "printflow", version, about = "3D print workflow orchestrator")]
struct Cli {
    /// Directory containing `.printflow/`
    #[arg(long, global = true, default_value = ".")]
    config_root: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Printer selection shared by the subcommands that talk to a device.
#[derive(clap::Args, Debug, Clone)]
struct PrinterArgs {
    /// Serial port to use (repeatable for discovery)
    #[arg(long = "port")]
    ports: Vec<String>,

    /// Talk to a built-in emulated Marlin printer instead of hardware
    #[arg(long)]
    emulated: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe ports and identify printer firmware
    Discover {
        #[command(flatten)]
        printer: PrinterArgs,
    },
    /// Stream a G-code file to a printer
    Print {
        file: PathBuf,

        #[command(flatten)]
        printer: PrinterArgs,
    },
    /// Run a request through research, CAD, slicing and printing
    Run {
        request: String,

        #[arg(long, value_parser = parse_priority, default_value = "normal")]
        priority: Priority,

        /// Stop after this phase (research, cad, slicing, printing)
        #[arg(long)]
        stop_after: Option<Phase>,

        /// Keep every artifact even if the workflow fails
        #[arg(long)]
        retain_artifacts: bool,

        #[command(flatten)]
        printer: PrinterArgs,
    },
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    match s.to_ascii_lowercase().as_str() {
        "low" => Ok(Priority::Low),
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        other => Err(format!("unknown priority '{other}' (low, normal, high)")),
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level)?;

    let config = pf_core::config::load_config(&cli.config_root).await?;

    match cli.command {
        Commands::Discover { printer } => commands::discover(&config, &printer, cli.json).await,
        Commands::Print { file, printer } => {
            commands::print(&config, &printer, &file, cli.json).await
        }
        Commands::Run {
            request,
            priority,
            stop_after,
            retain_artifacts,
            printer,
        } => {
            let options = commands::RunOptions {
                request,
                priority,
                stop_after,
                retain_artifacts,
            };
            commands::run(&config, &printer, options, cli.json).await
        }
    }
}
