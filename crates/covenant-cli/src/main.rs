//! covenant - offline attestation tooling
//!
//! Build-time companion to `covenant-core`: captures expected-digest
//! artifacts from shipped binaries and sanity-checks deployment bundles
//! before they go out. Runtime attestation itself lives in the library.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// covenant - runtime integrity attestation tooling
#[derive(Parser, Debug)]
#[command(name = "covenant")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute the code digest of an on-disk executable image
    Digest {
        /// Path to the executable image
        binary: PathBuf,

        /// Architecture slice to digest (`native` only)
        #[arg(long, default_value = "native")]
        arch: String,

        /// Write an expected-digest artifact here instead of printing
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Structurally check a deployment bundle
    CheckBundle {
        /// Bundle directory
        dir: PathBuf,

        /// Validator binary name expected inside the bundle
        #[arg(long, default_value = "covenant-validator")]
        validator_name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Digest {
            binary,
            arch,
            output,
        } => commands::digest::run(&binary, &arch, output.as_deref()),
        Commands::CheckBundle {
            dir,
            validator_name,
        } => commands::check_bundle::run(&dir, &validator_name),
    }
}
