//! # Terra Flyover
//!
//! Flies a scripted camera over synthetic terrain and drives the residency
//! engine the way a renderer would:
//! - Quadtree mesh selection and an in-memory geometry store
//! - Procedural imagery datasets with latency, failures and degraded tiles
//! - A simulated GPU with a texture memory budget
//!
//! ```text
//! terra-flyover [CONFIG] [--report PATH] [--frames N] [--save-config PATH]
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod config;
mod flight;
mod perf;
mod scene;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{FlyoverConfig, CONFIG_FILE};

/// Command line options.
#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    report: Option<PathBuf>,
    frames: Option<u64>,
    save_config: Option<PathBuf>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--report" => parsed.report = Some(next_value(&mut args, &arg)?.into()),
                "--save-config" => parsed.save_config = Some(next_value(&mut args, &arg)?.into()),
                "--frames" => {
                    let value = next_value(&mut args, &arg)?;
                    parsed.frames =
                        Some(value.parse().with_context(|| format!("invalid frame count {value}"))?);
                },
                flag if flag.starts_with("--") => bail!("unknown option {flag}"),
                path => {
                    if parsed.config.is_some() {
                        bail!("more than one config file given");
                    }
                    parsed.config = Some(path.into());
                },
            }
        }
        Ok(parsed)
    }
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next().with_context(|| format!("{flag} needs a value"))
}

/// Main entry point.
fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("terra=info".parse()?))
        .init();

    info!("Terra flyover {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse(std::env::args().skip(1))?;
    let mut config =
        FlyoverConfig::load_from(args.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE)));
    if let Some(frames) = args.frames {
        config.frames = frames;
    }
    if let Some(report) = args.report {
        config.report_path = Some(report);
    }
    config.validate();

    if let Some(path) = &args.save_config {
        config.save_to(path).context("failed to save config")?;
    }

    let report = flight::run(&config)?;
    if let Some(path) = &config.report_path {
        report.write_to(path).context("failed to write flight report")?;
    }

    info!(
        "{} frames, {} draws, slowest fetch {:.1} ms, {} textures leaked",
        report.summary.frames, report.summary.draws, report.summary.slowest_fetch_ms, report.gpu.leaked
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn test_args_parse() {
        let args = parse(&["fly.toml", "--frames", "30", "--report", "out.json"]).expect("parse");
        assert_eq!(
            args,
            Args {
                config: Some("fly.toml".into()),
                report: Some("out.json".into()),
                frames: Some(30),
                save_config: None,
            }
        );
        assert_eq!(parse(&[]).expect("parse"), Args::default());
    }

    #[test]
    fn test_args_reject_garbage() {
        assert!(parse(&["--frames"]).is_err());
        assert!(parse(&["--frames", "lots"]).is_err());
        assert!(parse(&["--fly"]).is_err());
        assert!(parse(&["a.toml", "b.toml"]).is_err());
    }
}
