//! rpmirror - golden-copy RPM repository mirror maintainer
//!
//! Keeps a local package repository mirror containing exactly the packages
//! installed on a reference host: downloads what is missing, removes what
//! is no longer installed, regenerates repository metadata for what
//! changed, and publishes the result to a shared distribution path.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod classify;
mod cli;
mod config;
mod engine;
mod error;
mod index;
mod inventory;
mod metadata;
mod mirror;
mod pkgmgr;
mod publish;
mod report;
mod signature;

use config::Config;

#[derive(Parser)]
#[command(
    name = "rpmirror",
    version,
    about = "Maintain a local RPM repository mirror of a golden-copy host"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: cli::Commands,
}

fn main() -> ExitCode {
    let args = Cli::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            return ExitCode::from(1);
        }
    };

    match cli::execute(args.command, &config) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            ExitCode::from(1)
        }
    }
}
