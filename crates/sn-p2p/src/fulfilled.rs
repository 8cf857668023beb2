// SPDX-License-Identifier: AGPL-3.0-only

//! Buchführung über bereits bediente bzw. gestellte Anfragen je Peer.
//! Verhindert, dass derselbe Peer dieselbe Anfrage zu oft stellt oder
//! von uns mehrfach bedient wird.

use sn_types::NetAddress;
use std::collections::BTreeMap;

pub const REQ_SPORK_SYNC: &str = "spork-sync";
pub const REQ_LIST_SYNC: &str = "operator-list-sync";
pub const REQ_PAYMENT_SYNC: &str = "operator-payment-sync";
pub const REQ_GOVERNANCE_SYNC: &str = "governance-sync";
pub const REQ_FULL_SYNC: &str = "full-sync";
pub const REQ_VERIFY_REQUEST: &str = "mnverify-request";
pub const REQ_VERIFY_REPLY: &str = "mnverify-reply";
pub const REQ_VERIFY_DONE: &str = "mnverify-done";

/// Standard-Lebensdauer eines Eintrags.
pub const DEFAULT_TTL_SECONDS: i64 = 60 * 60;

#[derive(Clone, Debug, Default)]
pub struct FulfilledRequestCache {
    entries: BTreeMap<NetAddress, BTreeMap<String, i64>>,
}

impl FulfilledRequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: NetAddress, tag: &str, now: i64) {
        self.add_with_ttl(addr, tag, now, DEFAULT_TTL_SECONDS);
    }

    pub fn add_with_ttl(&mut self, addr: NetAddress, tag: &str, now: i64, ttl: i64) {
        let _ = self
            .entries
            .entry(addr)
            .or_default()
            .insert(tag.to_string(), now + ttl);
    }

    pub fn has(&self, addr: &NetAddress, tag: &str, now: i64) -> bool {
        self.entries
            .get(addr)
            .and_then(|m| m.get(tag))
            .is_some_and(|until| *until > now)
    }

    pub fn remove(&mut self, addr: &NetAddress, tag: &str) {
        if let Some(m) = self.entries.get_mut(addr) {
            let _ = m.remove(tag);
            if m.is_empty() {
                let _ = self.entries.remove(addr);
            }
        }
    }

    /// Entfernt die Sync-Tags aller Peers (Neustart des Sync-Prozesses).
    pub fn clear_sync_tags(&mut self, peers: &[NetAddress]) {
        for peer in peers {
            for tag in [
                REQ_SPORK_SYNC,
                REQ_LIST_SYNC,
                REQ_PAYMENT_SYNC,
                REQ_GOVERNANCE_SYNC,
                REQ_FULL_SYNC,
            ] {
                self.remove(peer, tag);
            }
        }
    }

    /// Abgelaufene Einträge verwerfen.
    pub fn cleanup(&mut self, now: i64) {
        self.entries.retain(|_, m| {
            m.retain(|_, until| *until > now);
            !m.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> NetAddress {
        NetAddress::new([10, 0, 0, tag], 8884)
    }

    #[test]
    fn add_has_expire() {
        let mut cache = FulfilledRequestCache::new();
        let now = 1_000;
        cache.add_with_ttl(addr(1), REQ_LIST_SYNC, now, 100);
        assert!(cache.has(&addr(1), REQ_LIST_SYNC, now + 99));
        assert!(!cache.has(&addr(1), REQ_LIST_SYNC, now + 100));
        assert!(!cache.has(&addr(2), REQ_LIST_SYNC, now));
        assert!(!cache.has(&addr(1), REQ_SPORK_SYNC, now));
    }

    #[test]
    fn cleanup_drops_expired() {
        let mut cache = FulfilledRequestCache::new();
        cache.add_with_ttl(addr(1), REQ_LIST_SYNC, 0, 10);
        cache.add_with_ttl(addr(1), REQ_SPORK_SYNC, 0, 1000);
        cache.add_with_ttl(addr(2), REQ_FULL_SYNC, 0, 10);
        cache.cleanup(500);
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&addr(1), REQ_SPORK_SYNC, 500));
    }

    #[test]
    fn clear_sync_tags_keeps_verify_tags() {
        let mut cache = FulfilledRequestCache::new();
        cache.add(addr(1), REQ_FULL_SYNC, 0);
        cache.add(addr(1), REQ_VERIFY_DONE, 0);
        cache.clear_sync_tags(&[addr(1)]);
        assert!(!cache.has(&addr(1), REQ_FULL_SYNC, 1));
        assert!(cache.has(&addr(1), REQ_VERIFY_DONE, 1));
    }
}
