//! Rate limiting for the HTTP surface.
//!
//! Clients behind shared NATs make source addresses a poor key, so the
//! limiters key on what the protocol authenticates: the public-key
//! fingerprint for logins, the user id for join-token requests. Both
//! use governor's keyed limiters.

use crate::config::LimitsConfig;
use crate::error::AuthError;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use huddle_crypto::Fingerprint;
use huddle_types::UserId;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Keyed rate limiters for the server.
#[derive(Clone)]
pub struct RateLimits {
    /// Login attempts per public-key fingerprint.
    login_limiter: Arc<DefaultKeyedRateLimiter<[u8; 32]>>,
    /// Join-token requests per user.
    session_limiter: Arc<DefaultKeyedRateLimiter<UserId>>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("login_limiter", &"KeyedLimiter<[u8;32]>")
            .field("session_limiter", &"KeyedLimiter<UserId>")
            .finish()
    }
}

impl RateLimits {
    /// Create limiters from configuration.
    ///
    /// # Panics
    ///
    /// Panics if a configured rate is zero.
    pub fn new(config: &LimitsConfig) -> Self {
        let logins =
            NonZeroU32::new(config.logins_per_minute).expect("logins_per_minute must be > 0");
        let sessions =
            NonZeroU32::new(config.sessions_per_minute).expect("sessions_per_minute must be > 0");
        Self {
            login_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(logins))),
            session_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(sessions))),
        }
    }

    /// Check whether a login attempt is allowed.
    pub fn check_login(&self, key: &Fingerprint) -> Result<(), AuthError> {
        self.login_limiter
            .check_key(key.as_bytes())
            .map_err(|_| AuthError::RateLimited)
    }

    /// Check whether a join-token request is allowed.
    pub fn check_session(&self, user: &UserId) -> Result<(), AuthError> {
        self.session_limiter
            .check_key(user)
            .map_err(|_| AuthError::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_crypto::KeyPair;

    fn limits(per_minute: u32) -> RateLimits {
        RateLimits::new(&LimitsConfig {
            logins_per_minute: per_minute,
            sessions_per_minute: per_minute,
        })
    }

    #[test]
    fn login_limit_enforced_per_key() {
        let limits = limits(3);
        let key = KeyPair::generate().public().fingerprint();

        for _ in 0..3 {
            assert!(limits.check_login(&key).is_ok());
        }
        assert_eq!(limits.check_login(&key), Err(AuthError::RateLimited));
    }

    #[test]
    fn different_keys_have_independent_budgets() {
        let limits = limits(1);
        let a = KeyPair::generate().public().fingerprint();
        let b = KeyPair::generate().public().fingerprint();

        assert!(limits.check_login(&a).is_ok());
        assert!(limits.check_login(&a).is_err());
        assert!(limits.check_login(&b).is_ok());
    }

    #[test]
    fn session_limit_enforced_per_user() {
        let limits = limits(2);
        let user = UserId::random();

        assert!(limits.check_session(&user).is_ok());
        assert!(limits.check_session(&user).is_ok());
        assert_eq!(limits.check_session(&user), Err(AuthError::RateLimited));
    }
}
