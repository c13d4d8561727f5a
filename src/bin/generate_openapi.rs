//! Writes the dashboard API's `openapi.json`.
//!
//! Usage:
//!   cargo run --bin generate_openapi > openapi.json
//!   cargo run --bin generate_openapi -- --output openapi.json

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use moisture_ingest::api::handlers::ApiDoc;
use utoipa::OpenApi;

/// Dump the dashboard OpenAPI document.
#[derive(Parser, Debug)]
#[command(name = "generate_openapi")]
#[command(version, about, long_about = None)]
struct Args {
    /// Write to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let json = ApiDoc::openapi()
        .to_pretty_json()
        .context("failed to serialise OpenAPI document")?;

    match args.output {
        Some(path) => {
            fs::write(&path, &json)
                .with_context(|| format!("error writing to {}", path.display()))?;
            eprintln!("OpenAPI document written to {}", path.display());
        }
        None => {
            io::stdout()
                .write_all(json.as_bytes())
                .context("failed to write to stdout")?;
        }
    }
    Ok(())
}
