use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::envelope::{Envelope, ProtocolError};

#[cfg(unix)]
pub mod unix;

/// An envelope queued for the writer task, with an optional flush receipt.
#[derive(Debug)]
pub struct Outgoing {
    pub envelope: Envelope,
    flushed: Option<oneshot::Sender<io::Result<()>>>,
}

impl Outgoing {
    /// Report a successful write to whoever waits on it and hand back the
    /// envelope.
    pub fn acknowledge(mut self) -> Envelope {
        if let Some(tx) = self.flushed.take() {
            let _ = tx.send(Ok(()));
        }
        self.envelope
    }

    fn fail(mut self, err: io::Error) {
        if let Some(tx) = self.flushed.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// Cloneable write end of a link.
#[derive(Clone, Debug)]
pub struct EnvelopeSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl EnvelopeSender {
    /// A sender with its raw queue. Links drain the queue into a stream; tests
    /// read it directly.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an envelope without waiting for it to reach the peer.
    pub fn send(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        self.tx
            .send(Outgoing {
                envelope,
                flushed: None,
            })
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Queue an envelope and wait until the writer has flushed it.
    pub async fn send_flushed(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outgoing {
                envelope,
                flushed: Some(ack_tx),
            })
            .map_err(|_| ProtocolError::ChannelClosed)?;

        match ack_rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProtocolError::ChannelClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Envelope(Envelope),
    /// The read side hit EOF or failed. Emitted once, last.
    Disconnected,
}

/// Split `stream` into a reader task feeding `on_event` and a writer task
/// draining the returned sender. Lines that fail to parse are logged and
/// skipped.
pub fn spawn_link<S, F>(stream: S, on_event: F) -> EnvelopeSender
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: FnMut(LinkEvent) + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (sender, queue) = EnvelopeSender::channel();

    tokio::spawn(write_loop(writer, queue));
    tokio::spawn(read_loop(reader, on_event));

    sender
}

async fn write_loop<W>(mut writer: W, mut queue: mpsc::UnboundedReceiver<Outgoing>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(outgoing) = queue.recv().await {
        let line = match outgoing.envelope.encode_line() {
            Ok(line) => line,
            Err(err) => {
                warn!("Dropping unencodable envelope: {}", err);
                outgoing.fail(io::Error::new(io::ErrorKind::InvalidData, err.to_string()));
                continue;
            }
        };

        let written: io::Result<()> = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                outgoing.acknowledge();
            }
            Err(err) => {
                debug!("Link write failed, closing writer: {}", err);
                outgoing.fail(err);
                break;
            }
        }
    }
}

async fn read_loop<R, F>(reader: R, mut on_event: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(LinkEvent),
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = line.trim();
                if raw.is_empty() {
                    continue;
                }
                match Envelope::decode_line(raw) {
                    Ok(envelope) => on_event(LinkEvent::Envelope(envelope)),
                    Err(err) => warn!("Ignoring malformed envelope: {}", err),
                }
            }
            Err(err) => {
                debug!("Link read failed: {}", err);
                break;
            }
        }
    }

    on_event(LinkEvent::Disconnected);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn envelopes_cross_a_socket_pair() {
        let (left, right) = UnixStream::pair().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let left_sender = spawn_link(left, |_| {});
        let _right_sender = spawn_link(right, move |event| {
            let _ = events_tx.send(event);
        });

        let sent = Envelope::application(json!({"hello": "world"}));
        left_sender.send_flushed(sent.clone()).await.unwrap();

        match events_rx.recv().await {
            Some(LinkEvent::Envelope(received)) => assert_eq!(received.message, sent.message),
            other => panic!("unexpected link event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn peer_close_reports_disconnect_after_pending_lines() {
        let (left, right) = UnixStream::pair().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let _sender = spawn_link(right, move |event| {
            let _ = events_tx.send(event);
        });

        let mut left = left;
        let line = Envelope::stat("db", json!(3)).encode_line().unwrap();
        left.write_all(line.as_bytes()).await.unwrap();
        left.write_all(b"not json\n").await.unwrap();
        drop(left);

        let first = events_rx.recv().await.unwrap();
        assert!(matches!(first, LinkEvent::Envelope(ref e) if e.realm.as_deref() == Some("db")));
        assert_eq!(events_rx.recv().await, Some(LinkEvent::Disconnected));
    }

    #[tokio::test]
    async fn send_on_dropped_queue_reports_closed() {
        let (sender, queue) = EnvelopeSender::channel();
        drop(queue);

        assert!(sender.is_closed());
        assert!(matches!(
            sender.send(Envelope::online()),
            Err(ProtocolError::ChannelClosed)
        ));
    }
}
