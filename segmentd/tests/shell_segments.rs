//! Real child processes: `/bin/sh` scripts that speak the line protocol on
//! the inherited descriptor.
#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use segmentd::{
    Controller, ControllerOptions, LaunchOverride, RestartOptions, SegmentEvent, SupervisorError,
};
use segmentd_protocol::EnvelopeSender;
use tokio::time::timeout;

const ONLINE: &str = r#"{"type":"SYSTEM","time":0,"pid":0,"call":"ONLINE"}"#;
const STAT: &str = r#"{"type":"SYSTEM","time":0,"pid":0,"call":"STAT","realm":"shell","message":{"ok":true}}"#;

fn shell_options(script: String, segments: i64, restart: RestartOptions) -> ControllerOptions {
    ControllerOptions {
        segments: Some(segments),
        file: Some("/bin/sh".into()),
        args: Some(vec!["-c".into(), script]),
        restart,
        ..Default::default()
    }
}

/// Announce readiness, then wait for the close order and exit cleanly.
fn well_behaved() -> String {
    format!("printf '%s\\n' '{}' >&3; read -r line <&3; exit 0", ONLINE)
}

#[tokio::test]
async fn shutdown_drains_real_segments() -> Result<()> {
    let mut controller =
        Controller::builder(shell_options(well_behaved(), 2, RestartOptions::default())).build()?;

    let retired = Arc::new(AtomicUsize::new(0));
    let counter = retired.clone();
    controller.on_launch(move |segment| {
        let counter = counter.clone();
        segment.observe(move |_, event| {
            if matches!(event, SegmentEvent::EndOfLife(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
    });
    let exits = Arc::new(Mutex::new(Vec::new()));
    let sink = exits.clone();
    controller.on_exit(move |code, reason| sink.lock().unwrap().push((code, reason.to_string())));

    controller.handle().shutdown(5, "drain test")?;
    let termination = timeout(Duration::from_secs(20), controller.run()).await??;

    assert_eq!(termination.code, 5);
    assert_eq!(termination.reason, "drain test");
    assert_eq!(retired.load(Ordering::SeqCst), 2);
    assert_eq!(*exits.lock().unwrap(), vec![(5, "drain test".to_string())]);
    Ok(())
}

#[tokio::test]
async fn crashing_segment_is_restarted_until_shutdown() -> Result<()> {
    let script = format!("printf '%s\\n' '{}' >&3; exit 7", ONLINE);
    let restart = RestartOptions {
        min_age: Some(0),
        ..Default::default()
    };
    let mut controller = Controller::builder(shell_options(script, 1, restart)).build()?;
    let handle = controller.handle();

    let restarts = Arc::new(AtomicUsize::new(0));
    let counter = restarts.clone();
    controller.on_launch(move |segment| {
        let counter = counter.clone();
        let handle = handle.clone();
        segment.observe(move |_, event| {
            if let SegmentEvent::Restart(exit) = event {
                assert_eq!(exit.code, Some(7));
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    let _ = handle.shutdown(0, "enough restarts");
                }
            }
        });
    });

    let termination = timeout(Duration::from_secs(20), controller.run()).await??;

    assert_eq!(termination.code, 0);
    assert!(restarts.load(Ordering::SeqCst) >= 3);
    Ok(())
}

#[tokio::test]
async fn segment_stats_are_forwarded_upstream() -> Result<()> {
    let script = format!(
        "printf '%s\\n%s\\n' '{}' '{}' >&3; read -r line <&3; exit 0",
        ONLINE, STAT
    );
    let (upstream, mut upstream_rx) = EnvelopeSender::channel();
    let controller = Controller::builder(shell_options(script, 1, RestartOptions::default()))
        .upstream(upstream)
        .build()?;

    controller.handle().shutdown(0, "done")?;
    timeout(Duration::from_secs(20), controller.run()).await??;

    let forwarded = upstream_rx.try_recv()?.envelope;
    assert_eq!(forwarded.realm.as_deref(), Some("shell"));
    assert_eq!(forwarded.message, Some(serde_json::json!({"ok": true})));
    Ok(())
}

#[tokio::test]
async fn missing_executable_fails_launch() -> Result<()> {
    let options = shell_options(String::new(), 1, RestartOptions::default());
    let mut controller = Controller::builder(ControllerOptions {
        file: Some("/nonexistent/segmentd-worker".into()),
        ..options
    })
    .build()?;

    let result = controller.launch(&LaunchOverride::default());
    assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    assert!(controller.is_empty());
    Ok(())
}
