//! The user directory.
//!
//! Durable user identities, created on first successful login and keyed
//! by their public key. A persistent store is deliberately not part of
//! the core; this directory lives for the server process.

use dashmap::DashMap;
use huddle_crypto::{Fingerprint, PublicKey};
use huddle_types::UserId;

/// A durable user identity.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    /// The user's long-term public key.
    pub public_key: PublicKey,
}

/// In-memory user directory.
#[derive(Debug, Default)]
pub struct UserDirectory {
    by_id: DashMap<UserId, User>,
    by_key: DashMap<Fingerprint, UserId>,
}

impl UserDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a login to a durable user, creating the identity on
    /// first sight of the public key. Name and email follow the latest
    /// login.
    pub fn login(&self, name: &str, email: Option<&str>, public_key: PublicKey) -> User {
        let fingerprint = public_key.fingerprint();

        if let Some(id) = self.by_key.get(&fingerprint).map(|entry| *entry.value()) {
            if let Some(mut existing) = self.by_id.get_mut(&id) {
                existing.name = name.to_string();
                existing.email = email.map(str::to_string);
                return existing.clone();
            }
        }

        let user = User {
            id: UserId::random(),
            name: name.to_string(),
            email: email.map(str::to_string),
            public_key,
        };
        self.by_key.insert(fingerprint, user.id);
        self.by_id.insert(user.id, user.clone());
        tracing::info!(user = %user.id, name, "created user identity");
        user
    }

    /// Look up a user by id.
    pub fn get(&self, id: &UserId) -> Option<User> {
        self.by_id.get(id).map(|entry| entry.clone())
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_crypto::KeyPair;

    #[test]
    fn first_login_creates_a_user() {
        let users = UserDirectory::new();
        let key = KeyPair::generate().public();

        let user = users.login("alice", Some("alice@example.com"), key);
        assert_eq!(user.name, "alice");
        assert_eq!(user.email.as_deref(), Some("alice@example.com"));
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn same_key_resolves_to_same_identity() {
        let users = UserDirectory::new();
        let key = KeyPair::generate().public();

        let first = users.login("alice", None, key);
        let second = users.login("Alice Cooper", None, key);

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Alice Cooper");
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn different_keys_are_different_users() {
        let users = UserDirectory::new();
        let a = users.login("a", None, KeyPair::generate().public());
        let b = users.login("b", None, KeyPair::generate().public());
        assert_ne!(a.id, b.id);
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn get_by_id() {
        let users = UserDirectory::new();
        let user = users.login("bob", None, KeyPair::generate().public());
        assert_eq!(users.get(&user.id).unwrap().name, "bob");
        assert!(users.get(&UserId::random()).is_none());
    }
}
