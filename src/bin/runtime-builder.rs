use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use runtime_builder::config::load_config;
use runtime_builder::runtime::digest::{is_sha256_hex, sha256_file, verify_sha256};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "RUNTIME_BUILDER_LOG";

fn usage() -> &'static str {
    "Usage:\n  runtime-builder plan <config.toml> [output.json]\n  runtime-builder verify <archive> <sha256>"
}

fn main() -> Result<()> {
    init_logging();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [plan, config] if plan == "plan" => write_plan(Path::new(config), None),
        [plan, config, output] if plan == "plan" => {
            write_plan(Path::new(config), Some(Path::new(output)))
        }
        [verify, archive, sha256] if verify == "verify" => {
            verify_archive(Path::new(archive), sha256)
        }
        _ => bail!(usage()),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn write_plan(config_path: &Path, output: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let plan = config
        .provisioner()
        .plan(&config.base_state(), &config.groups)
        .with_context(|| format!("provisioning from '{}'", config_path.display()))?;
    let json = plan.to_json().context("serializing provisioning plan")?;

    match output {
        Some(path) => {
            fs::write(path, json + "\n")
                .with_context(|| format!("writing plan '{}'", path.display()))?;
            info!(
                "wrote {} graph operations to {}",
                plan.graph.len(),
                path.display()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn verify_archive(archive: &Path, expected: &str) -> Result<()> {
    if !is_sha256_hex(expected) {
        bail!("invalid sha256: '{}'", expected);
    }
    let (actual, size) = sha256_file(archive)
        .with_context(|| format!("hashing archive '{}'", archive.display()))?;
    verify_sha256(&archive.display().to_string(), expected, &actual)?;
    info!("{} ({} bytes) matches sha256 {}", archive.display(), size, actual);
    Ok(())
}
