//! Entry point for a worker process.

use std::future::Future;

use anyhow::{Context, Result};
use tracing::error;

use crate::segment::{Segment, Termination};

/// Connect to the primary, let `entry` wire up the segment, then dispatch
/// until the segment terminates.
pub async fn run<F>(entry: F) -> Result<Termination>
where
    F: FnOnce(&mut Segment) -> Result<()>,
{
    let mut segment = Segment::connect().context("failed to join the segment pool")?;
    let program = segment.exec().unwrap_or("<unknown>").to_string();
    entry(&mut segment).with_context(|| format!("segment entry point in {} failed", program))?;
    Ok(segment.run().await)
}

/// Like [`run`], for entry functions that need to await setup work.
pub async fn run_async<F, Fut>(entry: F) -> Result<Termination>
where
    F: FnOnce(Segment) -> Fut,
    Fut: Future<Output = Result<Segment>>,
{
    let segment = Segment::connect().context("failed to join the segment pool")?;
    let program = segment.exec().unwrap_or("<unknown>").to_string();
    let segment = entry(segment)
        .await
        .with_context(|| format!("segment entry point in {} failed", program))?;
    Ok(segment.run().await)
}

/// Terminate the process with the outcome of [`run`].
pub fn exit_with(outcome: Result<Termination>) -> ! {
    match outcome {
        Ok(termination) => std::process::exit(termination.code),
        Err(err) => {
            error!("{:#}", err);
            eprintln!("segment: {:#}", err);
            std::process::exit(1);
        }
    }
}
