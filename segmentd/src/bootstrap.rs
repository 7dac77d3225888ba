//! Entry point for a primary process.
//!
//! Base options travel in `SEGMENTD_CONFIG` as hex-encoded JSON so that a
//! supervisor can configure the primary it launches without touching its
//! command line.

use std::env;
use std::future::Future;

use anyhow::{Context, Result};
use segmentd_protocol::ENV_CONFIG_BLOB;
use tracing::error;

use crate::config::ControllerOptions;
use crate::controller::{Controller, Termination};
use crate::error::SupervisorError;
use crate::host;

pub fn encode_options_blob(options: &ControllerOptions) -> Result<String, SupervisorError> {
    let json = serde_json::to_vec(options)
        .map_err(|err| SupervisorError::InvalidConfig(err.to_string()))?;
    Ok(hex::encode(json))
}

pub fn decode_options_blob(raw: &str) -> Result<ControllerOptions, SupervisorError> {
    let bytes = hex::decode(raw.trim()).map_err(|err| {
        SupervisorError::InvalidConfig(format!("{} is not valid hex: {}", ENV_CONFIG_BLOB, err))
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        SupervisorError::InvalidConfig(format!(
            "{} is not valid options JSON: {}",
            ENV_CONFIG_BLOB, err
        ))
    })
}

/// Options passed down by a supervisor, or defaults when none were.
pub fn options_from_env() -> Result<ControllerOptions, SupervisorError> {
    match env::var(ENV_CONFIG_BLOB) {
        Ok(raw) if !raw.trim().is_empty() => decode_options_blob(&raw),
        _ => Ok(ControllerOptions::default()),
    }
}

/// Decode the base options, build a controller through `factory`, connect
/// signals and the upstream channel, then run until the pool shuts down.
pub async fn run_primary<F, Fut>(entry_point: &str, factory: F) -> Result<Termination>
where
    F: FnOnce(ControllerOptions) -> Fut,
    Fut: Future<Output = Result<Controller>>,
{
    let base = options_from_env()?;
    let mut controller = factory(base)
        .await
        .with_context(|| format!("controller factory `{}` failed", entry_point))?;

    host::connect_upstream(&mut controller).context("failed to open upstream channel")?;
    host::spawn_signal_handlers(controller.handle());

    Ok(controller.run().await?)
}

/// Terminate the process with the outcome of [`run_primary`].
pub fn exit_with(entry_point: &str, outcome: Result<Termination>) -> ! {
    match outcome {
        Ok(termination) => std::process::exit(termination.code),
        Err(err) => {
            error!("{}: {:#}", entry_point, err);
            eprintln!("segmentd: entry point `{}` failed: {:#}", entry_point, err);
            std::process::exit(1);
        }
    }
}
