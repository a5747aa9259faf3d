//! docker2aci: convert a saved Docker image into a squashed ACI.
//!
//! Takes the path of a tar archive produced by `docker save` and writes
//! `<app name>.aci` to the current working directory. Intermediate files
//! go to the system temp directory and are removed when the conversion
//! ends.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docker2aci")]
#[command(about = "Convert a saved Docker image archive into an App Container Image")]
#[command(version)]
struct Cli {
    /// Path to a tar archive produced by `docker save`
    archive: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let (aci_path, manifest) = docker2aci::convert(&cli.archive)
        .with_context(|| format!("converting {}", cli.archive.display()))?;

    println!("Generated ACI: {}", aci_path.display());
    println!("Image name: {}", manifest.name);
    Ok(())
}
