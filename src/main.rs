// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use edgecam::config::Config;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "edgecam")]
#[command(about = "Camera capture pipeline with frame processing and render throughput readout")]
#[command(version = edgecam::constants::app_info::version())]
#[command(subcommand_required = false)]
struct Cli {
    /// Configuration file (default: <config dir>/edgecam/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    List,

    /// Capture frames and report the render frame rate (default)
    Run {
        /// Camera id to use (from 'edgecam list')
        #[arg(long)]
        camera: Option<String>,

        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=edgecam=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    match cli.command {
        Some(Commands::List) => cli::list_cameras(&config),
        Some(Commands::Run { camera, duration }) => cli::run_capture(&config, camera, duration),
        Some(Commands::Config) => cli::print_config(&config),
        None => cli::run_capture(&config, None, None),
    }
}
