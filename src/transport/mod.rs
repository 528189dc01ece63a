//! Transport layer
//!
//! Network I/O is kept apart from protocol handling: a connection is split
//! into a [`FrameReader`] owned by the protocol loop and a writer task fed
//! through a [`PacketHandle`]. Everything sent through one handle (or its
//! clones) reaches the wire in send order.

use crate::error::{Error, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod tcp;

pub use tcp::{spawn_writer, write_frame, Frame, FrameReader};

/// Default number of outbound packets queued per connection
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Outbound packet channel of one connection
#[derive(Debug, Clone)]
pub struct PacketHandle {
    tx: mpsc::Sender<Bytes>,
}

impl PacketHandle {
    /// Create a handle and the receiving end for a writer task
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Queue a protocol message for writing. Waits if the queue is full.
    pub async fn send(&self, packet: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(packet.into())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
