//! Socket abstraction.
//!
//! The connection handler talks to a split socket: a [`SocketReader`] for the
//! inbound pump and a [`SocketWriter`] for the outbound pump. The WebSocket
//! adapter lives in [`crate::ws`]; [`memory_socket`] gives an in-process pair
//! for tests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level failure. Always fatal for the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer is gone
    #[error("socket closed")]
    Closed,

    /// Read or write failed
    #[error("socket I/O error: {0}")]
    Io(String),
}

/// A frame read from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame (protocol violation)
    Binary(Vec<u8>),
    /// Client sent a close frame
    Close,
}

/// Read half of a client socket.
#[async_trait]
pub trait SocketReader: Send + 'static {
    /// Next frame. `None` when the stream ended.
    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>>;
}

/// Write half of a client socket.
#[async_trait]
pub trait SocketWriter: Send + 'static {
    /// Send a text frame.
    async fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Send a close frame.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// A frame written by the server, as seen by a [`ClientEnd`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Text frame
    Text(String),
    /// Close frame
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Server-side read half of an in-memory socket.
pub struct MemoryReader {
    inbound: mpsc::Receiver<Result<InboundFrame, TransportError>>,
}

/// Server-side write half of an in-memory socket.
pub struct MemoryWriter {
    outbound: mpsc::Sender<OutboundFrame>,
}

/// Client side of an in-memory socket.
///
/// Writes block once `capacity` frames are unread, which is how tests model
/// a client that stopped reading.
pub struct ClientEnd {
    inbound: Option<mpsc::Sender<Result<InboundFrame, TransportError>>>,
    outbound: mpsc::Receiver<OutboundFrame>,
}

/// Create an in-memory socket whose server→client direction buffers
/// `capacity` frames.
pub fn memory_socket(capacity: usize) -> (MemoryReader, MemoryWriter, ClientEnd) {
    let (in_tx, in_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));

    (
        MemoryReader { inbound: in_rx },
        MemoryWriter { outbound: out_tx },
        ClientEnd { inbound: Some(in_tx), outbound: out_rx },
    )
}

#[async_trait]
impl SocketReader for MemoryReader {
    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        self.inbound.recv().await
    }
}

#[async_trait]
impl SocketWriter for MemoryWriter {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.outbound
            .send(OutboundFrame::Text(text.to_string()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.outbound
            .send(OutboundFrame::Close { code, reason: reason.to_string() })
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl ClientEnd {
    /// Send a text frame to the server.
    pub async fn send_text(&self, text: &str) -> bool {
        self.push(Ok(InboundFrame::Text(text.to_string()))).await
    }

    /// Send a binary frame to the server.
    pub async fn send_binary(&self, bytes: &[u8]) -> bool {
        self.push(Ok(InboundFrame::Binary(bytes.to_vec()))).await
    }

    /// Send a close frame.
    pub async fn send_close(&self) -> bool {
        self.push(Ok(InboundFrame::Close)).await
    }

    /// Make the server's next read fail.
    pub async fn fail_transport(&self, detail: &str) -> bool {
        self.push(Err(TransportError::Io(detail.to_string()))).await
    }

    /// End the inbound stream without a close frame.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Next frame from the server. `None` once the server dropped its writer.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Next frame from the server if one is already buffered.
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }

    async fn push(&self, frame: Result<InboundFrame, TransportError>) -> bool {
        match &self.inbound {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }
}
