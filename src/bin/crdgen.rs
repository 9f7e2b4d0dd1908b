//! # CRD Generator
//!
//! Generates the `CertManagerDeployment` CustomResourceDefinition YAML from
//! the Rust type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Print to stdout
//! crdgen
//!
//! # Write to a file
//! crdgen --output config/crd/certmanagerdeployment.yaml
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use kube::CustomResourceExt;
use pod_refresher_controller::crd::CertManagerDeployment;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "crdgen", about = "Generate the CertManagerDeployment CRD")]
struct Args {
    /// Write the CRD to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

const HEADER: &str = "# This file is auto-generated by crdgen\n# DO NOT EDIT THIS FILE MANUALLY\n---\n";

fn main() -> Result<()> {
    let args = Args::parse();

    let yaml = serde_yaml::to_string(&CertManagerDeployment::crd())
        .context("Failed to serialize CRD to YAML")?;
    let document = format!("{HEADER}{yaml}");

    match args.output {
        Some(path) => std::fs::write(&path, document)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => print!("{document}"),
    }
    Ok(())
}
