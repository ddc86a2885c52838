//! Peer-side library for huddle.
//!
//! Wraps the shared connection core with the client half of the
//! protocol: the HTTP credential flow, the websocket transport and the
//! join handshake that ends in a live [`Session`].

pub mod api;
pub mod client;
pub mod error;
pub mod transport;

pub use api::{ApiClient, SessionTicket};
pub use client::{deciders, join, CollabClient, JoinDecider, JoinOptions, Session};
pub use error::ClientError;
pub use transport::WsTransport;
