//! Wiring between a controller and the process hosting it: OS signals and the
//! optional channel to an upstream supervisor.

use std::env;
use std::io;

use segmentd_protocol::ipc::unix as ipc_unix;
use segmentd_protocol::{spawn_link, ENV_UPSTREAM_FD};
use tokio::signal;
use tracing::{info, warn};

use crate::controller::{Controller, ControllerHandle};

/// SIGINT and SIGTERM request `shutdown(0, "signal")`.
pub fn spawn_signal_handlers(handle: ControllerHandle) {
    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down segment pool");
            request_shutdown(&ctrl_c_handle);
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down segment pool");
                request_shutdown(&handle);
            }
        });
    }
}

fn request_shutdown(handle: &ControllerHandle) {
    if let Err(err) = handle.shutdown(0, "signal") {
        warn!("Could not request shutdown: {}", err);
    }
}

/// Connect the controller to its own supervisor when `SEGMENTD_UPSTREAM_FD`
/// names an inherited channel. Returns whether a channel was attached.
pub fn connect_upstream(controller: &mut Controller) -> io::Result<bool> {
    let Ok(raw) = env::var(ENV_UPSTREAM_FD) else {
        return Ok(false);
    };
    let fd = ipc_unix::parse_fd(&raw)?;
    let stream = ipc_unix::from_inherited_fd(fd)?;

    let handle = controller.handle();
    let sender = spawn_link(stream, move |event| handle.deliver_upstream(event));
    controller.attach_upstream(sender);
    info!(fd, "Connected to upstream supervisor");
    Ok(true)
}
