//! Login and join credentials.
//!
//! Both token kinds are opaque 24-byte random strings (URL-safe
//! base64), single-use, with bounded lifetimes. A background sweeper
//! removes expired grants; lookups re-check expiry anyway so a grant
//! can never be redeemed after its deadline, sweep or no sweep.

use crate::config::TokenConfig;
use crate::error::AuthError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use huddle_types::{RoomId, UserId};
use std::time::{Duration, Instant};

/// Random bytes per token (192 bits).
const TOKEN_LEN: usize = 24;

/// A freshly minted token handed back over HTTP.
#[derive(Debug, Clone)]
pub struct Ticket {
    /// The opaque token text.
    pub token: String,
    /// Room the token is scoped to (join tokens only).
    pub room_id: Option<RoomId>,
}

/// A redeemed join grant: the authority to attach one connection to
/// one room.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinGrant {
    pub user_id: UserId,
    pub room_id: RoomId,
    /// Minted by `POST /api/session`: the connecting peer opens the
    /// room and becomes its host.
    pub host: bool,
}

#[derive(Debug, Clone, Copy)]
struct LoginEntry {
    user_id: UserId,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct JoinEntry {
    grant: JoinGrant,
    expires_at: Instant,
}

/// Mints and validates login and join tokens.
#[derive(Debug)]
pub struct CredentialsManager {
    login: DashMap<String, LoginEntry>,
    join: DashMap<String, JoinEntry>,
    login_ttl: Duration,
    join_ttl: Duration,
}

impl CredentialsManager {
    /// Create a manager with the configured lifetimes.
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            login: DashMap::new(),
            join: DashMap::new(),
            login_ttl: Duration::from_secs(config.login_ttl_secs),
            join_ttl: Duration::from_secs(config.join_ttl_secs),
        }
    }

    /// Mint a login token for an authenticated user.
    pub fn mint_login(&self, user_id: UserId) -> Ticket {
        let token = new_token();
        self.login.insert(
            token.clone(),
            LoginEntry {
                user_id,
                expires_at: Instant::now() + self.login_ttl,
            },
        );
        tracing::debug!(user = %user_id, "minted login token");
        Ticket {
            token,
            room_id: None,
        }
    }

    /// Redeem a login token. Single-use: the token is consumed even
    /// when it turns out to be expired.
    pub fn redeem_login(&self, token: &str) -> Result<UserId, AuthError> {
        let (_, entry) = self.login.remove(token).ok_or(AuthError::InvalidToken)?;
        if Instant::now() >= entry.expires_at {
            return Err(AuthError::ExpiredToken);
        }
        Ok(entry.user_id)
    }

    /// Mint a join token scoping one connection attempt to one room.
    pub fn mint_join(&self, user_id: UserId, room_id: RoomId, host: bool) -> Ticket {
        let token = new_token();
        self.join.insert(
            token.clone(),
            JoinEntry {
                grant: JoinGrant {
                    user_id,
                    room_id,
                    host,
                },
                expires_at: Instant::now() + self.join_ttl,
            },
        );
        tracing::debug!(user = %user_id, room = %room_id, host, "minted join token");
        Ticket {
            token,
            room_id: Some(room_id),
        }
    }

    /// Validate a join token without consuming it (pre-upgrade check).
    pub fn check_join(&self, token: &str) -> Result<(), AuthError> {
        let entry = self.join.get(token).ok_or(AuthError::InvalidToken)?;
        if Instant::now() >= entry.expires_at {
            return Err(AuthError::ExpiredToken);
        }
        Ok(())
    }

    /// Redeem a join token. Single-use.
    pub fn redeem_join(&self, token: &str) -> Result<JoinGrant, AuthError> {
        let (_, entry) = self.join.remove(token).ok_or(AuthError::InvalidToken)?;
        if Instant::now() >= entry.expires_at {
            return Err(AuthError::ExpiredToken);
        }
        Ok(entry.grant)
    }

    /// Remove every expired grant. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.login.len() + self.join.len();
        self.login.retain(|_, entry| entry.expires_at > now);
        self.join.retain(|_, entry| entry.expires_at > now);
        before - (self.login.len() + self.join.len())
    }

    /// Number of outstanding (unredeemed) grants.
    pub fn outstanding(&self) -> usize {
        self.login.len() + self.join.len()
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    URL_SAFE_NO_PAD.encode(bytes)
}
