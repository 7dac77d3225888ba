//! segmentd wire protocol
//!
//! Envelopes exchanged between the primary process and its segments, plus the
//! newline-delimited JSON link that carries them over a Unix stream.

pub mod envelope;
pub mod ipc;

pub use envelope::{now_ms, Envelope, MessageType, Payload, ProtocolError, SysCall, SystemCall};
pub use ipc::{spawn_link, EnvelopeSender, LinkEvent, Outgoing};

/// Environment variable carrying the segment id handed to a worker.
pub const ENV_SEGMENT_ID: &str = "SEGMENTD_SEGMENT_ID";
/// Environment variable carrying the executable a segment was launched from.
pub const ENV_SEGMENT_EXEC: &str = "SEGMENTD_SEGMENT_EXEC";
/// Environment variable naming the inherited descriptor of the segment channel.
pub const ENV_IPC_FD: &str = "SEGMENTD_IPC_FD";
/// Environment variable naming the descriptor a supervised primary talks to
/// its own supervisor on.
pub const ENV_UPSTREAM_FD: &str = "SEGMENTD_UPSTREAM_FD";
/// Environment variable holding the hex-encoded JSON options blob read by the
/// primary bootstrap.
pub const ENV_CONFIG_BLOB: &str = "SEGMENTD_CONFIG";
