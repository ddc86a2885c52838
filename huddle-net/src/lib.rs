//! The shared RPC engine of the huddle protocol.
//!
//! Both the server and the client libraries run the same
//! [`Connection`] core: a bidirectional, multiplexed
//! request/response/notification/broadcast protocol over an abstract
//! byte-stream [`Transport`], with hybrid per-message encryption,
//! per-peer key caches, request-id correlation with timeouts and
//! cooperative cancellation on disconnect.

pub mod connection;
pub mod error;
pub mod event;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, RelaySink};
pub use error::ConnectionError;
pub use event::Emitter;
pub use transport::{PipeTransport, Transport, TransportError};
