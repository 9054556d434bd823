//! In-process duplex packet pipe
//!
//! Some tunnel engines insist on owning a TUN device. Only one real
//! interface exists, so such an engine is handed one end of a pipe as its
//! "device" while the adapter keeps the other end:
//!
//! ```text
//!   router -> adapter end.send()   ==>  engine end.recv()  (plaintext out)
//!   router <- adapter end.recv()   <==  engine end.send()  (plaintext in)
//! ```
//!
//! Each direction is a bounded queue of whole IP packets, each held in a
//! `PipeBuffer` with room reserved around it. Dropping either end closes
//! both directions for the peer.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// Bytes reserved in front of a packet for encapsulation headers
pub const PIPE_HEADROOM: usize = 256;
/// Bytes reserved behind a packet for trailers (padding, auth tags)
pub const PIPE_TAILROOM: usize = 128;

/// Pipe errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("Pipe queue full")]
    Full,

    #[error("Pipe queue empty")]
    Empty,

    #[error("Pipe closed")]
    Closed,

    #[error("Not enough headroom ({needed} needed, {available} available)")]
    NoHeadroom { needed: usize, available: usize },
}

/// Packet buffer with reserved headroom and tailroom.
///
/// An engine can prepend its headers in place instead of reallocating.
#[derive(Debug, Clone)]
pub struct PipeBuffer {
    storage: BytesMut,
    start: usize,
    end: usize,
}

impl PipeBuffer {
    pub fn from_packet(packet: &[u8]) -> Self {
        let mut storage = BytesMut::zeroed(PIPE_HEADROOM + packet.len() + PIPE_TAILROOM);
        storage[PIPE_HEADROOM..PIPE_HEADROOM + packet.len()].copy_from_slice(packet);

        Self {
            storage,
            start: PIPE_HEADROOM,
            end: PIPE_HEADROOM + packet.len(),
        }
    }

    pub fn headroom(&self) -> usize {
        self.start
    }

    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    /// Prepend `header` in front of the current contents
    pub fn push_front(&mut self, header: &[u8]) -> Result<(), PipeError> {
        if header.len() > self.start {
            return Err(PipeError::NoHeadroom {
                needed: header.len(),
                available: self.start,
            });
        }
        let new_start = self.start - header.len();
        self.storage[new_start..self.start].copy_from_slice(header);
        self.start = new_start;
        Ok(())
    }

    /// Append `trailer` behind the current contents
    pub fn push_back(&mut self, trailer: &[u8]) -> Result<(), PipeError> {
        if trailer.len() > self.tailroom() {
            return Err(PipeError::NoHeadroom {
                needed: trailer.len(),
                available: self.tailroom(),
            });
        }
        self.storage[self.end..self.end + trailer.len()].copy_from_slice(trailer);
        self.end += trailer.len();
        Ok(())
    }

    /// Remove `len` bytes from the front
    pub fn pull_front(&mut self, len: usize) -> Option<()> {
        if len > self.len() {
            return None;
        }
        self.start += len;
        Some(())
    }

    pub fn freeze(mut self) -> Bytes {
        let _ = self.storage.split_to(self.start);
        self.storage.truncate(self.end - self.start);
        self.storage.freeze()
    }
}

/// Sending half of a pipe end
#[derive(Debug, Clone)]
pub struct PipeSender {
    tx: mpsc::Sender<PipeBuffer>,
}

impl PipeSender {
    /// Queue a packet, waiting for room
    pub async fn send(&self, packet: PipeBuffer) -> Result<(), PipeError> {
        self.tx.send(packet).await.map_err(|_| PipeError::Closed)
    }

    /// Queue a packet without waiting; a full queue rejects it
    pub fn try_send(&self, packet: PipeBuffer) -> Result<(), PipeError> {
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PipeError::Full,
            mpsc::error::TrySendError::Closed(_) => PipeError::Closed,
        })
    }

    /// Copy `packet` into a fresh buffer with full headroom and queue it
    pub fn try_send_packet(&self, packet: &[u8]) -> Result<(), PipeError> {
        self.try_send(PipeBuffer::from_packet(packet))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a pipe end
#[derive(Debug)]
pub struct PipeReceiver {
    rx: mpsc::Receiver<PipeBuffer>,
}

impl PipeReceiver {
    /// Next packet, or `None` once the peer is gone and the queue drained
    pub async fn recv(&mut self) -> Option<PipeBuffer> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<PipeBuffer, PipeError> {
        self.rx.try_recv().map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => PipeError::Empty,
            mpsc::error::TryRecvError::Disconnected => PipeError::Closed,
        })
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// One end of a duplex packet pipe
#[derive(Debug)]
pub struct PipeEnd {
    sender: PipeSender,
    receiver: PipeReceiver,
}

impl PipeEnd {
    pub async fn send(&self, packet: PipeBuffer) -> Result<(), PipeError> {
        self.sender.send(packet).await
    }

    pub fn try_send(&self, packet: PipeBuffer) -> Result<(), PipeError> {
        self.sender.try_send(packet)
    }

    pub async fn recv(&mut self) -> Option<PipeBuffer> {
        self.receiver.recv().await
    }

    pub fn sender(&self) -> PipeSender {
        self.sender.clone()
    }

    pub fn split(self) -> (PipeSender, PipeReceiver) {
        (self.sender, self.receiver)
    }
}

/// Create a connected pair of pipe ends, each direction holding up to
/// `capacity` packets
pub fn packet_pipe(capacity: usize) -> (PipeEnd, PipeEnd) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    let a = PipeEnd {
        sender: PipeSender { tx: a_tx },
        receiver: PipeReceiver { rx: a_rx },
    };
    let b = PipeEnd {
        sender: PipeSender { tx: b_tx },
        receiver: PipeReceiver { rx: b_rx },
    };
    (a, b)
}
