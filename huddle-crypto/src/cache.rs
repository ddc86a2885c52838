//! Per-connection key caches.
//!
//! Sealing a content key for a recipient costs an X25519 agreement; the
//! caches make that cost once-per-peer instead of once-per-message.
//!
//! Capacity is `peer_budget + CACHE_HEADROOM`. On overflow the whole
//! cache is dropped rather than evicting entries, and owners drop both
//! caches whenever the peer set changes so rekeyed peers never hit
//! stale wraps.

use crate::identity::Fingerprint;
use std::collections::HashMap;

/// Extra capacity above the known-peer count.
pub const CACHE_HEADROOM: usize = 50;

/// Sender-side cache: `(recipient fingerprint, key generation)` →
/// wrapped content key.
#[derive(Debug, Default)]
pub struct SealCache {
    entries: HashMap<(Fingerprint, u64), Vec<u8>>,
    peer_budget: usize,
    hits: u64,
    misses: u64,
}

impl SealCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the known-peer count the bound derives from.
    pub fn set_peer_budget(&mut self, peers: usize) {
        self.peer_budget = peers;
    }

    fn limit(&self) -> usize {
        self.peer_budget + CACHE_HEADROOM
    }

    /// Look up a wrap. Records a hit when present.
    pub fn get(&mut self, recipient: &Fingerprint, generation: u64) -> Option<Vec<u8>> {
        let found = self.entries.get(&(*recipient, generation)).cloned();
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    /// Store a freshly computed wrap. Records the asymmetric operation
    /// that produced it; on overflow the whole cache is dropped first.
    pub fn insert(&mut self, recipient: Fingerprint, generation: u64, wrapped: Vec<u8>) {
        self.misses += 1;
        if self.entries.len() >= self.limit() {
            self.entries.clear();
        }
        self.entries.insert((recipient, generation), wrapped);
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of asymmetric seal operations performed so far.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Number of wraps served from cache.
    pub fn hits(&self) -> u64 {
        self.hits
    }
}

#[derive(Debug, Clone)]
struct OpenEntry {
    /// BLAKE3 of the wrapped slot this key was unwrapped from. A hit
    /// requires equality, which holds exactly when the sender served
    /// the wrap from its own cache.
    wrap_digest: [u8; 32],
    key: [u8; 32],
}

/// Receiver-side cache: sender fingerprint → unwrapped content key.
#[derive(Debug, Default)]
pub struct OpenCache {
    entries: HashMap<Fingerprint, OpenEntry>,
    peer_budget: usize,
    hits: u64,
    misses: u64,
}

impl OpenCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the known-peer count the bound derives from.
    pub fn set_peer_budget(&mut self, peers: usize) {
        self.peer_budget = peers;
    }

    fn limit(&self) -> usize {
        self.peer_budget + CACHE_HEADROOM
    }

    /// Look up the content key cached for a sender, if the wrap digest
    /// still matches.
    pub fn get(&mut self, sender: &Fingerprint, wrap_digest: &[u8; 32]) -> Option<[u8; 32]> {
        match self.entries.get(sender) {
            Some(entry) if &entry.wrap_digest == wrap_digest => {
                self.hits += 1;
                Some(entry.key)
            }
            _ => None,
        }
    }

    /// Store a freshly unwrapped key.
    pub fn insert(&mut self, sender: Fingerprint, wrap_digest: [u8; 32], key: [u8; 32]) {
        self.misses += 1;
        if self.entries.len() >= self.limit() {
            self.entries.clear();
        }
        self.entries.insert(sender, OpenEntry { wrap_digest, key });
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of asymmetric unwrap operations performed so far.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Number of keys served from cache.
    pub fn hits(&self) -> u64 {
        self.hits
    }
}
