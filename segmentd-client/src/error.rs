use std::io;

use segmentd_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("not running as a segment: {0} is not set")]
    NotASegment(&'static str),
    #[error("cannot open the segment channel: {0}")]
    Channel(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
