// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented
)]

//! Mehrphasiger Bootstrap: SPORKS, LIST, PAYMENTS, GOVERNANCE.
//! Jeder Tick stellt höchstens eine Anfrage je Asset, Timeouts schalten
//! weiter oder lassen den Sync einmalig scheitern (mit Abkühlphase).

use sn_chain::ChainView;
use sn_p2p::fulfilled::{
    FulfilledRequestCache, REQ_FULL_SYNC, REQ_GOVERNANCE_SYNC, REQ_LIST_SYNC, REQ_PAYMENT_SYNC,
    REQ_SPORK_SYNC,
};
use sn_p2p::messages::NodeMessage;
use sn_p2p::PeerInfo;
use sn_payments::{storage_limit, PaymentQueue};
use sn_registry::{OperatorRegistry, SyncFlags, MIN_PAYMENT_PROTO_VERSION};
use sn_types::NetAddress;
use tracing::{debug, info, warn};

pub const SYNC_TICK_SECONDS: i64 = 6;
pub const SYNC_TIMEOUT_SECONDS: i64 = 30;
pub const SYNC_ENOUGH_PEERS: usize = 6;
pub const SYNC_FAIL_COOLDOWN_SECONDS: i64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncAsset {
    Failed,
    Initial,
    Sporks,
    List,
    Payments,
    Governance,
    Finished,
}

impl SyncAsset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "SYNC_FAILED",
            Self::Initial => "SYNC_INITIAL",
            Self::Sporks => "SYNC_SPORKS",
            Self::List => "SYNC_LIST",
            Self::Payments => "SYNC_PAYMENTS",
            Self::Governance => "SYNC_GOVERNANCE",
            Self::Finished => "SYNC_FINISHED",
        }
    }
}

impl core::fmt::Display for SyncAsset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sicht auf die Governance-Warteschlange; der Kern stößt nur an.
pub trait GovernanceView {
    fn objects_to_request(&self, peer: &NetAddress) -> usize;
    fn vote_count(&self) -> usize;
}

/// Kein Governance-Backlog (Standalone-Betrieb und Tests).
pub struct NullGovernance;

impl GovernanceView for NullGovernance {
    fn objects_to_request(&self, _peer: &NetAddress) -> usize {
        0
    }
    fn vote_count(&self) -> usize {
        0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStep {
    Send(NetAddress, NodeMessage),
    Disconnect(NetAddress),
}

pub struct SyncController {
    asset: SyncAsset,
    attempt: u32,
    time_asset_started: i64,
    time_last_list: i64,
    time_last_payment_vote: i64,
    time_last_governance: i64,
    time_no_objects_left: i64,
    time_last_failure: i64,
    failure_count: u32,
    blockchain_synced: bool,
    first_block_accepted: bool,
    time_last_process: i64,
}

impl SyncController {
    pub fn new(now: i64) -> Self {
        let mut controller = Self {
            asset: SyncAsset::Initial,
            attempt: 0,
            time_asset_started: now,
            time_last_list: now,
            time_last_payment_vote: now,
            time_last_governance: now,
            time_no_objects_left: 0,
            time_last_failure: 0,
            failure_count: 0,
            blockchain_synced: false,
            first_block_accepted: false,
            time_last_process: now,
        };
        controller.reset(now);
        controller
    }

    pub fn reset(&mut self, now: i64) {
        self.asset = SyncAsset::Initial;
        self.attempt = 0;
        self.time_asset_started = now;
        self.time_last_list = now;
        self.time_last_payment_vote = now;
        self.time_last_governance = now;
        self.time_no_objects_left = 0;
        self.time_last_failure = 0;
    }

    fn fail(&mut self, now: i64) {
        self.time_last_failure = now;
        self.failure_count += 1;
        self.asset = SyncAsset::Failed;
        warn!("sync failed, cooling down");
    }

    pub fn asset(&self) -> SyncAsset {
        self.asset
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_failed(&self) -> bool {
        self.asset == SyncAsset::Failed
    }

    pub fn is_synced(&self) -> bool {
        self.asset == SyncAsset::Finished
    }

    pub fn is_list_synced(&self) -> bool {
        self.asset > SyncAsset::List
    }

    pub fn is_winners_synced(&self) -> bool {
        self.asset > SyncAsset::Payments
    }

    pub fn flags(&self) -> SyncFlags {
        SyncFlags {
            blockchain_synced: self.blockchain_synced,
            list_synced: self.is_list_synced(),
            fully_synced: self.is_synced(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self.asset {
            SyncAsset::Initial => "Synchronization pending...",
            SyncAsset::Sporks => "Synchronizing sporks...",
            SyncAsset::List => "Synchronizing operator list...",
            SyncAsset::Payments => "Synchronizing operator payments...",
            SyncAsset::Governance => "Synchronizing governance objects...",
            SyncAsset::Failed => "Synchronization failed",
            SyncAsset::Finished => "Synchronization finished",
        }
    }

    // Fortschritts-Meldungen der anderen Komponenten
    pub fn note_list_entry(&mut self, now: i64) {
        self.time_last_list = now;
    }

    pub fn note_payment_vote(&mut self, now: i64) {
        self.time_last_payment_vote = now;
    }

    pub fn note_governance_item(&mut self, now: i64) {
        self.time_last_governance = now;
    }

    pub fn note_block_accepted(&mut self) {
        self.first_block_accepted = true;
    }

    /// Reduzierte Chain-Synced-Heuristik: Tip-Alter gegen `max_tip_age`.
    /// Nach einer Stunde ohne Aufruf (Rechner schlief) beginnt alles neu.
    pub fn is_blockchain_synced(&mut self, chain: &dyn ChainView, now: i64) -> bool {
        if now - self.time_last_process > 60 * 60 {
            self.reset(now);
            self.blockchain_synced = false;
        }
        self.time_last_process = now;
        if self.blockchain_synced {
            return true;
        }
        let Ok(tip) = chain.tip() else {
            return false;
        };
        self.blockchain_synced = now - tip.time < chain.params().max_tip_age;
        self.blockchain_synced
    }

    fn switch_to_next_asset(
        &mut self,
        peers: &[PeerInfo],
        fulfilled: &mut FulfilledRequestCache,
        now: i64,
    ) {
        match self.asset {
            SyncAsset::Failed => {
                // darf nur über reset() verlassen werden
                debug_assert!(false, "switch from FAILED without reset");
            }
            SyncAsset::Initial => {
                let addrs: Vec<NetAddress> = peers.iter().map(|p| p.addr).collect();
                fulfilled.clear_sync_tags(&addrs);
                self.asset = SyncAsset::Sporks;
            }
            SyncAsset::Sporks => {
                self.time_last_list = now;
                self.asset = SyncAsset::List;
            }
            SyncAsset::List => {
                self.time_last_payment_vote = now;
                self.asset = SyncAsset::Payments;
            }
            SyncAsset::Payments => {
                self.time_last_governance = now;
                self.asset = SyncAsset::Governance;
            }
            SyncAsset::Governance => {
                info!("sync has finished");
                self.asset = SyncAsset::Finished;
                for peer in peers {
                    fulfilled.add(peer.addr, REQ_FULL_SYNC, now);
                }
            }
            SyncAsset::Finished => {}
        }
        self.attempt = 0;
        self.time_asset_started = now;
        info!(asset = %self.asset, "starting sync asset");
    }

    /// Ein Sync-Tick (nominell alle 6 Sekunden).
    #[allow(clippy::too_many_arguments)]
    pub fn process_tick(
        &mut self,
        chain: &dyn ChainView,
        registry: &mut OperatorRegistry,
        payments: &PaymentQueue,
        governance: &dyn GovernanceView,
        fulfilled: &mut FulfilledRequestCache,
        peers: &[PeerInfo],
        now: i64,
    ) -> Vec<SyncStep> {
        let mut steps = Vec::new();
        let registry_count = registry.size();

        if self.is_synced() {
            // Schlaf/Aufwachen oder kompletter Listenverlust: neu anfangen
            if registry_count == 0 {
                warn!("not enough data, restarting sync");
                self.reset(now);
            }
            return steps;
        }

        if self.is_failed() {
            if self.time_last_failure + SYNC_FAIL_COOLDOWN_SECONDS < now {
                self.reset(now);
            }
            return steps;
        }

        let bc_synced = self.is_blockchain_synced(chain, now);
        let is_regtest = registry.options().params.is_regtest();
        if !is_regtest && !bc_synced && self.asset > SyncAsset::Sporks {
            debug!(asset = %self.asset, "blockchain not synced yet, holding");
            self.time_last_list = now;
            self.time_last_payment_vote = now;
            self.time_last_governance = now;
            return steps;
        }

        if self.asset == SyncAsset::Initial
            || (self.asset == SyncAsset::Sporks && (bc_synced || is_regtest))
        {
            self.switch_to_next_asset(peers, fulfilled, now);
        }

        let we_are_operator = registry.local_operator().is_some();

        for peer in peers {
            // Operator-zu-Operator-Verbindungen sind kurzlebig und für den
            // Sync unzuverlässig
            if peer.operator_conn || (we_are_operator && peer.inbound) {
                continue;
            }

            if fulfilled.has(&peer.addr, REQ_FULL_SYNC, now) {
                // kürzlich komplett bedient; Slot für andere Peers freigeben
                info!(peer = %peer.addr, "disconnecting recently synced peer");
                steps.push(SyncStep::Disconnect(peer.addr));
                continue;
            }

            // Sporks holen wir von jedem neuen Peer zuerst
            if !fulfilled.has(&peer.addr, REQ_SPORK_SYNC, now) {
                fulfilled.add(peer.addr, REQ_SPORK_SYNC, now);
                debug!(peer = %peer.addr, "requesting sporks");
                steps.push(SyncStep::Send(peer.addr, NodeMessage::GetSporks));
                continue;
            }

            match self.asset {
                SyncAsset::List => {
                    if self.time_last_list < now - SYNC_TIMEOUT_SECONDS {
                        warn!(asset = %self.asset, attempt = self.attempt, "sync timeout");
                        if self.attempt == 0 {
                            // ohne Liste geht nichts; später neu versuchen
                            self.fail(now);
                        } else {
                            self.switch_to_next_asset(peers, fulfilled, now);
                        }
                        return steps;
                    }
                    if fulfilled.has(&peer.addr, REQ_LIST_SYNC, now) {
                        continue;
                    }
                    fulfilled.add(peer.addr, REQ_LIST_SYNC, now);
                    if peer.version < MIN_PAYMENT_PROTO_VERSION {
                        continue;
                    }
                    self.attempt += 1;
                    if let Some(msg) = registry.dseg_update(peer.addr, now) {
                        steps.push(SyncStep::Send(peer.addr, msg));
                    }
                    // je Tick bekommt genau ein Peer eine Anfrage
                    return steps;
                }
                SyncAsset::Payments => {
                    // kann durch neue Blöcke länger dauern als der Timeout,
                    // läuft aber irgendwann ebenfalls aus
                    if self.time_last_payment_vote < now - SYNC_TIMEOUT_SECONDS {
                        warn!(asset = %self.asset, attempt = self.attempt, "sync timeout");
                        if self.attempt == 0 {
                            self.fail(now);
                        } else {
                            self.switch_to_next_asset(peers, fulfilled, now);
                        }
                        return steps;
                    }
                    // genug Daten von mindestens zwei Peers: weiter
                    if self.attempt > 1 && payments.is_enough_data(registry_count) {
                        info!("found enough payment data");
                        self.switch_to_next_asset(peers, fulfilled, now);
                        return steps;
                    }
                    if fulfilled.has(&peer.addr, REQ_PAYMENT_SYNC, now) {
                        continue;
                    }
                    fulfilled.add(peer.addr, REQ_PAYMENT_SYNC, now);
                    if peer.version < MIN_PAYMENT_PROTO_VERSION {
                        continue;
                    }
                    self.attempt += 1;
                    steps.push(SyncStep::Send(
                        peer.addr,
                        NodeMessage::PaymentSync {
                            limit: storage_limit(registry_count),
                        },
                    ));
                    return steps;
                }
                SyncAsset::Governance => {
                    if now - self.time_last_governance > SYNC_TIMEOUT_SECONDS {
                        warn!(asset = %self.asset, attempt = self.attempt, "sync timeout");
                        if self.attempt == 0 {
                            // verschmerzbar, wir holen Governance später nach
                            warn!("failed to sync governance, continuing anyway");
                        }
                        self.switch_to_next_asset(peers, fulfilled, now);
                        return steps;
                    }
                    if fulfilled.has(&peer.addr, REQ_GOVERNANCE_SYNC, now) {
                        // Objekte sind angefragt; Ruhe heißt fertig
                        if governance.objects_to_request(&peer.addr) == 0 {
                            if self.time_no_objects_left == 0 {
                                self.time_no_objects_left = now;
                            }
                            if now - self.time_no_objects_left > SYNC_TIMEOUT_SECONDS {
                                info!("asked for all governance objects, nothing to do");
                                self.time_no_objects_left = 0;
                                self.switch_to_next_asset(peers, fulfilled, now);
                                return steps;
                            }
                        }
                        continue;
                    }
                    fulfilled.add(peer.addr, REQ_GOVERNANCE_SYNC, now);
                    self.attempt += 1;
                    steps.push(SyncStep::Send(peer.addr, NodeMessage::GovernanceSync));
                    return steps;
                }
                _ => {}
            }
        }
        steps
    }

    /// Statuszähler eines Peers (nur Protokollierung).
    pub fn process_sync_status_count(&self, peer: NetAddress, item: i32, count: i32) {
        if self.is_synced() || self.is_failed() {
            return;
        }
        info!(%peer, item, count, "inventory count received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_chain::InMemoryChain;
    use sn_registry::RegistryOptions;
    use sn_types::{ChainParams, PROTOCOL_VERSION};

    struct Harness {
        controller: SyncController,
        chain: InMemoryChain,
        registry: OperatorRegistry,
        payments: PaymentQueue,
        fulfilled: FulfilledRequestCache,
        peers: Vec<PeerInfo>,
        now: i64,
    }

    fn harness(peer_count: u8) -> Harness {
        let now = 1_000_000;
        Harness {
            controller: SyncController::new(now),
            chain: InMemoryChain::with_synthetic_blocks(ChainParams::regtest(), 50, now - 10_000),
            registry: OperatorRegistry::new(RegistryOptions::new(ChainParams::regtest())),
            payments: PaymentQueue::new(),
            fulfilled: FulfilledRequestCache::new(),
            peers: (0..peer_count)
                .map(|t| PeerInfo {
                    addr: NetAddress::new([80, 0, 0, t], 8888),
                    version: PROTOCOL_VERSION,
                    inbound: false,
                    operator_conn: false,
                })
                .collect(),
            now,
        }
    }

    fn tick(h: &mut Harness) -> Vec<SyncStep> {
        h.now += SYNC_TICK_SECONDS;
        let gov = NullGovernance;
        h.controller.process_tick(
            &h.chain,
            &mut h.registry,
            &h.payments,
            &gov,
            &mut h.fulfilled,
            &h.peers.clone(),
            h.now,
        )
    }

    #[test]
    fn advances_through_all_assets_with_responses() {
        let mut h = harness(7);

        // Erster Tick: INITIAL -> SPORKS; alle Peers bekommen zuerst eine
        // Spork-Anfrage
        let steps = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::Sporks);
        let spork_requests = steps
            .iter()
            .filter(|s| matches!(s, SyncStep::Send(_, NodeMessage::GetSporks)))
            .count();
        assert_eq!(spork_requests, 7);

        // Zweiter Tick: SPORKS -> LIST (Regtest gilt als synced),
        // Listen-Anfragen gehen an einen Peer pro Tick
        let steps = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::List);
        assert!(steps
            .iter()
            .any(|s| matches!(s, SyncStep::Send(_, NodeMessage::ListRequest { .. }))));
        assert_eq!(h.controller.attempt(), 1);
        // laufende Antworten halten das Asset am Leben
        h.controller.note_list_entry(h.now);

        // Stille nach mindestens einer Anfrage: Weiterschalten zu PAYMENTS
        h.now += SYNC_TIMEOUT_SECONDS + 1;
        let _ = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::Payments);

        // Zahlungs-Anfrage, dann Stille: GOVERNANCE
        let steps = tick(&mut h);
        assert!(steps
            .iter()
            .any(|s| matches!(s, SyncStep::Send(_, NodeMessage::PaymentSync { .. }))));
        h.controller.note_payment_vote(h.now);
        h.now += SYNC_TIMEOUT_SECONDS + 1;
        let _ = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::Governance);

        // Governance-Anfrage, dann Ruhe: FINISHED
        let steps = tick(&mut h);
        assert!(steps
            .iter()
            .any(|s| matches!(s, SyncStep::Send(_, NodeMessage::GovernanceSync))));
        h.now += SYNC_TIMEOUT_SECONDS + 1;
        let _ = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::Finished);
        assert!(h.controller.is_synced());
        assert!(h.controller.flags().fully_synced);
    }

    #[test]
    fn list_timeout_without_any_attempt_fails_then_recovers() {
        let mut h = harness(3);
        // Peers mit zu altem Protokoll: Listen-Anfragen unterbleiben
        for peer in h.peers.iter_mut() {
            peer.version = MIN_PAYMENT_PROTO_VERSION - 1;
        }

        let _ = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::Sporks);
        let _ = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::List);
        let _ = tick(&mut h);
        assert_eq!(h.controller.attempt(), 0);

        // 30 Sekunden ohne Fortschritt und ohne einen einzigen Versuch
        h.now += SYNC_TIMEOUT_SECONDS + 1;
        let _ = tick(&mut h);
        assert!(h.controller.is_failed());

        // innerhalb der Abkühlphase passiert nichts
        let _ = tick(&mut h);
        assert!(h.controller.is_failed());

        // nach 60 Sekunden Cooldown beginnt der Sync von vorn
        h.now += SYNC_FAIL_COOLDOWN_SECONDS + 1;
        let _ = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::Initial);
    }

    #[test]
    fn fully_synced_peers_are_disconnected() {
        let mut h = harness(2);
        let full_peer = h.peers.first().expect("peer").addr;
        h.fulfilled.add(full_peer, REQ_FULL_SYNC, h.now);

        let steps = tick(&mut h);
        assert!(steps.contains(&SyncStep::Disconnect(full_peer)));
    }

    #[test]
    fn finished_sync_resets_when_registry_stays_empty() {
        let mut h = harness(2);
        // bis FINISHED durchlaufen (je Stufe ein Versuch, dann Stille)
        let _ = tick(&mut h); // Sporks
        let _ = tick(&mut h); // List + erste Anfrage
        h.now += SYNC_TIMEOUT_SECONDS + 1;
        let _ = tick(&mut h); // -> Payments
        let _ = tick(&mut h); // Payment-Anfrage
        h.now += SYNC_TIMEOUT_SECONDS + 1;
        let _ = tick(&mut h); // -> Governance
        let _ = tick(&mut h); // Governance-Anfrage
        h.now += SYNC_TIMEOUT_SECONDS + 1;
        let _ = tick(&mut h); // -> Finished
        assert!(h.controller.is_synced());

        // leeres Register nach dem Sync: kompletter Neustart
        let _ = tick(&mut h);
        assert_eq!(h.controller.asset(), SyncAsset::Initial);
    }

    #[test]
    fn operator_peers_are_skipped() {
        let mut h = harness(1);
        if let Some(peer) = h.peers.first_mut() {
            peer.operator_conn = true;
        }
        let steps = tick(&mut h);
        // keinerlei Anfragen an Operator-Verbindungen
        assert!(steps.is_empty());
        assert_eq!(h.controller.asset(), SyncAsset::Sporks);
    }
}
