//! The transport seam under a [`Crosslink`](crate::Crosslink) instance.
//!
//! A [`Channel`] is one endpoint of an ordered, reliable, bidirectional
//! envelope transport. Concrete bindings can wrap OS pipes, sockets, or a
//! postMessage-style boundary; the in-process pair shipped here is what the
//! runtime uses to reach spawned execution contexts and what tests use to
//! wire two engines back to back.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::Envelope;

/// The peer endpoint is gone; the envelope was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// One endpoint of a bidirectional, ordered envelope transport.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Deliver an envelope to the peer endpoint.
    async fn send(&self, envelope: Envelope) -> Result<(), ChannelClosed>;

    /// Receive the next envelope, or `None` once the peer endpoint is gone
    /// and everything in flight has been drained.
    async fn recv(&self) -> Option<Envelope>;
}

const CHANNEL_DEPTH: usize = 64;

/// An in-process channel endpoint built on tokio mpsc queues.
pub struct InProcessChannel {
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
}

impl InProcessChannel {
    /// Two connected endpoints: everything sent on one side arrives, in
    /// order, on the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Channel for InProcessChannel {
    async fn send(&self, envelope: Envelope) -> Result<(), ChannelClosed> {
        self.tx.send(envelope).await.map_err(|_| ChannelClosed)
    }

    async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }
}
