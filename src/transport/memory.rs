//! In-process channel transport.
//!
//! Connects a bridge connection to a [`ChannelPeer`] that plays the
//! browser's role. Frames are delivered in exactly the order the bridge
//! wrote them, which makes it the transport of choice for tests and
//! benchmarks.
//!
//! # Example
//!
//! ```ignore
//! let (transport, mut peer) = channel_transport();
//! let connection = bridge.open(Arc::new(transport), SessionInfo::new("/"));
//!
//! connection.eval_js_nowait("console.log('hi')")?;
//! let frame = peer.next_frame().await;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::Transport;

// ============================================================================
// Constructor
// ============================================================================

/// Creates a connected transport/peer pair.
#[must_use]
pub fn channel_transport() -> (ChannelTransport, ChannelPeer) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let transport = ChannelTransport {
        frames_tx,
        open: Arc::clone(&open),
    };
    let peer = ChannelPeer { frames_rx, open };

    (transport, peer)
}

// ============================================================================
// ChannelTransport
// ============================================================================

/// Bridge-side half of an in-process connection.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    /// Frames written by the bridge.
    frames_tx: mpsc::UnboundedSender<String>,
    /// Shared open flag.
    open: Arc<AtomicBool>,
}

impl Transport for ChannelTransport {
    fn send(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.frames_tx
            .send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.frames_tx.is_closed()
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// ChannelPeer
// ============================================================================

/// Browser-side half of an in-process connection.
#[derive(Debug)]
pub struct ChannelPeer {
    /// Frames written by the bridge.
    frames_rx: mpsc::UnboundedReceiver<String>,
    /// Shared open flag.
    open: Arc<AtomicBool>,
}

impl ChannelPeer {
    /// Waits for the next frame.
    ///
    /// Returns `None` once the bridge side is dropped.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.frames_rx.recv().await
    }

    /// Waits for the next frame and parses it as JSON.
    pub async fn next_message(&mut self) -> Option<Value> {
        let frame = self.next_frame().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Returns the next frame if one is already queued.
    #[must_use]
    pub fn try_next_frame(&mut self) -> Option<String> {
        self.frames_rx.try_recv().ok()
    }

    /// Simulates the browser going away.
    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Returns `true` until either side closes.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let (transport, mut peer) = channel_transport();

        transport.send("a".into()).expect("send a");
        transport.send("b".into()).expect("send b");

        assert_eq!(peer.next_frame().await.as_deref(), Some("a"));
        assert_eq!(peer.next_frame().await.as_deref(), Some("b"));
        assert!(peer.try_next_frame().is_none());
    }

    #[test]
    fn test_send_after_close_fails() {
        let (transport, peer) = channel_transport();
        transport.close();

        assert!(!transport.is_open());
        assert!(!peer.is_open());
        assert!(matches!(
            transport.send("x".into()),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_peer_disconnect_closes_transport() {
        let (transport, peer) = channel_transport();
        peer.disconnect();
        assert!(transport.send("x".into()).is_err());
    }

    #[test]
    fn test_dropped_peer_closes_transport() {
        let (transport, peer) = channel_transport();
        drop(peer);
        assert!(!transport.is_open());
    }
}
