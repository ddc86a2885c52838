//! The huddle collaboration server.
//!
//! Peers join named rooms through a two-phase credential flow (login
//! token → join token → connect) gated by host approval. Application
//! messages between peers are relayed as ciphertext the server cannot
//! read; the server only routes by recipient, enforces membership and
//! maintains room lifecycle.

pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod limits;
pub mod peer;
pub mod relay;
pub mod rooms;
pub mod server;
pub mod sweep;
pub mod users;
pub mod ws;

pub use config::Config;
pub use credentials::{CredentialsManager, JoinGrant, Ticket};
pub use error::{AuthError, ServerError};
pub use peer::Peer;
pub use rooms::{JoinOutcome, Room, RoomManager, RoomPermissions};
pub use server::ServerContext;
pub use users::{User, UserDirectory};
