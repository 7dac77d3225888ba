use std::io;
use std::path::PathBuf;

use segmentd_protocol::ProtocolError;

use crate::process::SegmentId;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no executable configured; set `file` to the program each segment runs")]
    MissingExecutable,
    #[error("`segments` must be a positive count, got {0}")]
    InvalidSegmentCount(i64),
    #[error("a controller cannot be built inside segment {0}")]
    InsideSegment(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn segment from {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no segment with id {0}")]
    UnknownSegment(SegmentId),
    #[error("failed to signal segment: {0}")]
    Signal(#[from] nix::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("controller loop is no longer running")]
    ControllerGone,
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
