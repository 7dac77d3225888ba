//! Demo segment: echoes every APPLICATION message back to the primary and
//! reports a running count as a statistic.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use segmentd_client::bootstrap;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let outcome = bootstrap::run(|segment| {
        info!(segment_id = segment.id(), "segment-echo ready");
        let handled = Arc::new(AtomicU64::new(0));

        segment.on_message(move |link, message| {
            let count = handled.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(count, "Echoing message");
            if let Err(err) = link.send(message.message.clone()) {
                warn!("Failed to echo message: {}", err);
            }
            if let Err(err) = link.statistic("echo", json!({ "handled": count })) {
                warn!("Failed to report statistic: {}", err);
            }
        });
        segment.on_exit(|code, reason| info!(code, reason, "segment-echo stopping"));
        Ok(())
    })
    .await;

    bootstrap::exit_with(outcome);
}
