//! Transport abstraction.
//!
//! A transport is a duplex, message-oriented byte channel. Framing is
//! the codec's job; implementations move whole frames. The websocket
//! transports live with the server and client crates; the in-process
//! [`PipeTransport`] here backs the test suites.

mod pipe;

pub use pipe::PipeTransport;

use async_trait::async_trait;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The channel is closed; reads and writes can no longer succeed.
    #[error("transport closed")]
    Closed,

    /// Establishing the channel failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A write failed.
    #[error("send failed: {0}")]
    Send(String),

    /// A read failed.
    #[error("receive failed: {0}")]
    Recv(String),
}

/// A duplex byte-message channel between two endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one complete frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one complete frame. Resolves with
    /// [`TransportError::Closed`] once the peer is gone.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the local end is still open.
    fn is_open(&self) -> bool;
}
