//! segmentd: keep a pool of worker processes running.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use segmentd::bootstrap;
use segmentd::{Controller, ControllerOptions, RestartOptions};

const ENTRY_POINT: &str = "segmentd::main";

#[derive(Parser, Debug)]
#[command(name = "segmentd", version)]
#[command(about = "Supervise a pool of worker segments")]
struct Cli {
    /// Executable each segment runs
    file: Option<PathBuf>,

    /// Arguments passed to every segment
    #[arg(last = true)]
    args: Vec<String>,

    /// TOML file with controller options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of segments to keep running (default: two per core)
    #[arg(long)]
    segments: Option<i64>,

    /// Minimum lifetime in milliseconds before a dead segment is restarted
    #[arg(long)]
    min_age: Option<u64>,

    /// Extra environment for segments, KEY=VALUE
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    #[arg(long)]
    no_restart_on_signal: bool,

    #[arg(long)]
    no_restart_on_error: bool,

    #[arg(long)]
    no_restart_on_normal: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

impl Cli {
    fn options(&self) -> ControllerOptions {
        let flag = |disabled: bool| if disabled { Some(false) } else { None };
        ControllerOptions {
            segments: self.segments,
            file: self.file.clone(),
            args: if self.args.is_empty() {
                None
            } else {
                Some(self.args.clone())
            },
            env: if self.env.is_empty() {
                None
            } else {
                Some(self.env.iter().cloned().collect::<BTreeMap<_, _>>())
            },
            uid: None,
            gid: None,
            restart: RestartOptions {
                signal: flag(self.no_restart_on_signal),
                code: flag(self.no_restart_on_error),
                normal: flag(self.no_restart_on_normal),
                min_age: self.min_age,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting segmentd");

    let outcome =
        bootstrap::run_primary(ENTRY_POINT, |base| async move { build(base, &cli) }).await;
    bootstrap::exit_with(ENTRY_POINT, outcome);
}

fn build(base: ControllerOptions, cli: &Cli) -> Result<Controller> {
    let mut options = base;
    if let Some(path) = &cli.config {
        let from_file = ControllerOptions::load_toml(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        options = options.merge(from_file);
    }
    options = options.merge(cli.options());

    let mut controller = Controller::builder(options).build()?;
    controller.on_exit(|code, reason| info!(code, reason, "segmentd exiting"));
    Ok(controller)
}
