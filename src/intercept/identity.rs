//! Connection identity
//!
//! Maps an opaque handle token to a stable `ConnectionId` so pool
//! wrappers layered over the same physical handle share one identity.
//! Ids are released on close; the peak open count feeds the pool
//! sample.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct ConnectionIdentity {
    ids: DashMap<u64, String>,
    next_id: AtomicU64,
    next_token: AtomicU64,
    peak_open: AtomicU64,
}

impl ConnectionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token for a handle the host has no identity for.
    pub fn fresh_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Connection id for the handle token, minting one on first
    /// observation. Re-wrapping the same token yields the same id.
    pub fn acquire(&self, token: u64) -> String {
        let id = self
            .ids
            .entry(token)
            .or_insert_with(|| {
                let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                format!("c{n}")
            })
            .value()
            .clone();

        let open = self.ids.len() as u64;
        self.peak_open.fetch_max(open, Ordering::Relaxed);
        id
    }

    /// Release the identity on close.
    pub fn release(&self, token: u64) -> Option<String> {
        self.ids.remove(&token).map(|(_, id)| id)
    }

    pub fn open_count(&self) -> usize {
        self.ids.len()
    }

    pub fn peak_open(&self) -> u64 {
        self.peak_open.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_token_shares_identity() {
        let identity = ConnectionIdentity::new();
        let token = identity.fresh_token();

        let first = identity.acquire(token);
        let again = identity.acquire(token);
        assert_eq!(first, again);
        assert_eq!(identity.open_count(), 1);
    }

    #[test]
    fn test_distinct_tokens_distinct_ids() {
        let identity = ConnectionIdentity::new();
        let a = identity.acquire(identity.fresh_token());
        let b = identity.acquire(identity.fresh_token());
        assert_ne!(a, b);
        assert_eq!(identity.open_count(), 2);
        assert_eq!(identity.peak_open(), 2);
    }

    #[test]
    fn test_release_frees_identity_but_keeps_peak() {
        let identity = ConnectionIdentity::new();
        let token = identity.fresh_token();
        let id = identity.acquire(token);

        assert_eq!(identity.release(token), Some(id));
        assert_eq!(identity.open_count(), 0);
        assert_eq!(identity.peak_open(), 1);
        assert_eq!(identity.release(token), None);
    }
}
