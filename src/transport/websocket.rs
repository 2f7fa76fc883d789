//! WebSocket writer task.
//!
//! Every browser socket gets one writer task that owns the sink half of
//! the stream. [`WsTransport`] only pushes frames onto an unbounded
//! channel, so any thread may write to any connection without touching
//! the socket itself and without waiting on a slow peer.
//!
//! # Writer Loop
//!
//! - Frames are written in the order they were queued
//! - A failed write marks the transport closed and ends the task
//! - `close()` sends a Close frame and ends the task

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

use super::Transport;

// ============================================================================
// WriterCommand
// ============================================================================

/// Internal commands for the writer task.
enum WriterCommand {
    /// Write one text frame.
    Frame(String),
    /// Send a Close frame and stop.
    Close,
}

// ============================================================================
// WsTransport
// ============================================================================

/// Send side of a browser WebSocket.
///
/// # Thread Safety
///
/// `WsTransport` is `Send + Sync` and cheap to clone; all clones feed the
/// same writer task.
#[derive(Clone)]
pub struct WsTransport {
    /// Channel to the writer task.
    command_tx: mpsc::UnboundedSender<WriterCommand>,
    /// Cleared when the socket can no longer be written.
    open: Arc<AtomicBool>,
}

impl WsTransport {
    /// Spawns the writer task for a socket sink.
    pub fn spawn<S>(connection_id: ConnectionId, sink: S) -> Self
    where
        S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::run_writer(
            connection_id,
            sink,
            command_rx,
            Arc::clone(&open),
        ));

        Self { command_tx, open }
    }

    /// Writer loop that owns the socket sink.
    async fn run_writer<S>(
        connection_id: ConnectionId,
        mut sink: S,
        mut command_rx: mpsc::UnboundedReceiver<WriterCommand>,
        open: Arc<AtomicBool>,
    ) where
        S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        while let Some(command) = command_rx.recv().await {
            match command {
                WriterCommand::Frame(frame) => {
                    let len = frame.len();
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        warn!(%connection_id, error = %e, "WebSocket write failed");
                        break;
                    }
                    trace!(%connection_id, len, "Frame written");
                }

                WriterCommand::Close => {
                    debug!(%connection_id, "Closing WebSocket");
                    let _ = sink.close().await;
                    break;
                }
            }
        }

        open.store(false, Ordering::SeqCst);
        debug!(%connection_id, "Writer task terminated");
    }
}

impl Transport for WsTransport {
    fn send(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.command_tx
            .send(WriterCommand::Frame(frame))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.command_tx.is_closed()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.command_tx.send(WriterCommand::Close);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use parking_lot::Mutex;

    /// Sink recording every message it accepts.
    #[derive(Clone, Default)]
    struct RecordingSink {
        written: Arc<Mutex<Vec<Message>>>,
    }

    impl Sink<Message> for RecordingSink {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<StdResult<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> StdResult<(), WsError> {
            self.written.lock().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<StdResult<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<StdResult<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }

    type StdResult<T, E> = std::result::Result<T, E>;

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let sink = RecordingSink::default();
        let transport = WsTransport::spawn(ConnectionId::new("t"), sink.clone());

        transport.send("first".into()).expect("send");
        transport.send("second".into()).expect("send");

        for _ in 0..50 {
            if sink.written.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let written = sink.written.lock().clone();
        assert_eq!(
            written,
            vec![Message::Text("first".into()), Message::Text("second".into())]
        );
    }

    #[tokio::test]
    async fn test_close_rejects_further_sends() {
        let transport = WsTransport::spawn(ConnectionId::new("t"), RecordingSink::default());

        transport.close();
        assert!(!transport.is_open());
        assert!(matches!(
            transport.send("late".into()),
            Err(Error::ConnectionClosed)
        ));

        // Second close is a no-op.
        transport.close();
    }
}
