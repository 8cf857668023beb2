// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::todo,
    clippy::unimplemented
)]

pub mod consts;
pub mod index;
pub mod pose;
pub mod record;
pub mod snapshot;

pub use consts::*;
pub use index::OperatorIndex;
pub use record::{CheckEnv, OperatorInfo, OperatorRecord};
pub use snapshot::RegistrySnapshot;

use rand::Rng;
use sn_chain::{BlockIndex, ChainError, ChainView, UtxoQuery};
use sn_codec::{CodecError, Decodable, Encodable};
use sn_crypto::{Hash32, OperatorKeypair, ScoreU256};
use sn_p2p::messages::{Inv, InvType, NodeMessage};
use sn_types::{
    operator_score, payout_script, Announce, Heartbeat, NetAddress, OperatorState, OutPoint,
    PubKeyBytes, TxIn, Verification, PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::{debug, info, warn};

/// Sichtbarer Sync-Fortschritt, vom Sync-Controller gepflegt.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncFlags {
    pub blockchain_synced: bool,
    pub list_synced: bool,
    pub fully_synced: bool,
}

#[derive(Clone, Debug)]
pub struct RegistryOptions {
    pub params: sn_types::ChainParams,
    /// Watchdog-Mechanismus; standardmäßig aus
    pub watchdog_enabled: bool,
}

impl RegistryOptions {
    pub fn new(params: sn_types::ChainParams) -> Self {
        Self {
            params,
            watchdog_enabled: false,
        }
    }
}

/// Identität des lokal betriebenen Operators (falls konfiguriert).
#[derive(Clone, Debug)]
pub struct LocalOperator {
    pub vin: TxIn,
    pub service: NetAddress,
    pub keypair: OperatorKeypair,
}

/// Vom Register produzierte Folgeaktionen; der Node-Loop setzt sie in
/// Transport-Operationen um.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    ListSyncBumped,
    OperatorsAdded,
    OperatorsRemoved,
    RelayAnnounce(Announce),
    RelayHeartbeat(Heartbeat),
    RelayVerification(Verification),
    AskEntry { peer: NetAddress, vin: TxIn },
    /// Unser Operator wurde per fremdem Announce aktiviert
    RemoteActivation,
}

/// Ergebnis einer Announce-Einreichung.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted { relay: bool },
    AlreadyKnown,
    Ignored,
    Rejected { dos: u32 },
    /// Chain nicht greifbar; später erneut einreichen, Absender straffrei
    Deferred,
}

/// Ergebnis einer Heartbeat-Einreichung.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatAdmission {
    Accepted { relay: bool },
    AlreadyKnown,
    NotFound,
    Ignored,
    Rejected { dos: u32 },
    Deferred,
}

/// Blick in die Auszahlungs-Historie (implementiert vom Scheduler).
pub trait PayeeHistory {
    fn has_payee_with_votes(&self, height: i32, script: &[u8], min_votes: usize) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeenAnnounce {
    pub first_seen: i64,
    pub announce: Announce,
}

impl Encodable for SeenAnnounce {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.first_seen.encode(w)?;
        self.announce.encode(w)
    }
    fn encoded_len(&self) -> usize {
        8 + self.announce.encoded_len()
    }
}
impl Decodable for SeenAnnounce {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            first_seen: i64::decode(r)?,
            announce: Announce::decode(r)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryRequest {
    /// bis wann Antworten gesammelt werden
    pub until: i64,
    pub peers: Vec<NetAddress>,
}

impl Encodable for RecoveryRequest {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.until.encode(w)?;
        self.peers.encode(w)
    }
    fn encoded_len(&self) -> usize {
        8 + self.peers.encoded_len()
    }
}
impl Decodable for RecoveryRequest {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            until: i64::decode(r)?,
            peers: Vec::<NetAddress>::decode(r)?,
        })
    }
}

pub struct OperatorRegistry {
    options: RegistryOptions,
    records: BTreeMap<OutPoint, OperatorRecord>,

    // Anfrage-Buchführung
    asked_us_for_list: BTreeMap<NetAddress, i64>,
    we_asked_for_list: BTreeMap<NetAddress, i64>,
    we_asked_for_entry: BTreeMap<OutPoint, BTreeMap<NetAddress, i64>>,
    pub(crate) we_asked_for_verification: BTreeMap<NetAddress, Verification>,

    // Recovery aus NEW_START_REQUIRED
    recovery_requests: BTreeMap<Hash32, RecoveryRequest>,
    recovery_good_replies: BTreeMap<Hash32, Vec<Announce>>,
    scheduled_recovery_connections: Vec<(NetAddress, Hash32)>,

    // Seen-Caches: Announces werden nie per Zeit verworfen
    seen_announce: BTreeMap<Hash32, SeenAnnounce>,
    seen_heartbeat: BTreeMap<Hash32, Heartbeat>,
    pub(crate) seen_verification: BTreeMap<Hash32, Verification>,

    index: OperatorIndex,
    index_old: OperatorIndex,
    index_rebuilt: bool,
    last_index_rebuild: i64,

    operators_added: bool,
    operators_removed: bool,
    dirty_governance_hashes: Vec<Hash32>,

    last_watchdog_vote_time: i64,
    dsq_count: i64,

    local_operator: Option<LocalOperator>,
    events: Vec<RegistryEvent>,
}

impl OperatorRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            options,
            records: BTreeMap::new(),
            asked_us_for_list: BTreeMap::new(),
            we_asked_for_list: BTreeMap::new(),
            we_asked_for_entry: BTreeMap::new(),
            we_asked_for_verification: BTreeMap::new(),
            recovery_requests: BTreeMap::new(),
            recovery_good_replies: BTreeMap::new(),
            scheduled_recovery_connections: Vec::new(),
            seen_announce: BTreeMap::new(),
            seen_heartbeat: BTreeMap::new(),
            seen_verification: BTreeMap::new(),
            index: OperatorIndex::new(),
            index_old: OperatorIndex::new(),
            index_rebuilt: false,
            last_index_rebuild: 0,
            operators_added: false,
            operators_removed: false,
            dirty_governance_hashes: Vec::new(),
            last_watchdog_vote_time: 0,
            dsq_count: 0,
            local_operator: None,
            events: Vec::new(),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.records.contains_key(outpoint)
    }

    pub fn take_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn set_local_operator(&mut self, local: LocalOperator) {
        self.local_operator = Some(local);
    }

    pub fn local_operator(&self) -> Option<&LocalOperator> {
        self.local_operator.as_ref()
    }

    fn is_our_operator_key(&self, pk_operator: &PubKeyBytes) -> bool {
        self.local_operator
            .as_ref()
            .is_some_and(|l| PubKeyBytes::from_keypair(&l.keypair) == *pk_operator)
    }

    pub fn is_watchdog_active(&self, now: i64) -> bool {
        // Mechanismus vorhanden, netzweit aber abgeschaltet, solange die
        // Option nicht explizit gesetzt wird.
        self.options.watchdog_enabled
            && now - self.last_watchdog_vote_time <= WATCHDOG_MAX_SECONDS
    }

    pub fn update_watchdog_vote_time(&mut self, outpoint: &OutPoint, now: i64) {
        if let Some(record) = self.records.get_mut(outpoint) {
            record.time_last_watchdog_vote = now;
            self.last_watchdog_vote_time = now;
        }
    }

    pub fn dsq_count(&self) -> i64 {
        self.dsq_count
    }

    pub fn bump_dsq_count(&mut self) -> i64 {
        self.dsq_count += 1;
        self.dsq_count
    }

    // ============================
    // Zählung und Suche
    // ============================

    pub fn count_by_protocol(&self, min_protocol: i32) -> usize {
        self.records
            .values()
            .filter(|r| r.protocol_version >= min_protocol)
            .count()
    }

    pub fn count_enabled(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.protocol_version >= MIN_PAYMENT_PROTO_VERSION && r.is_enabled())
            .count()
    }

    pub fn get_info(&self, outpoint: &OutPoint) -> Option<OperatorInfo> {
        self.records.get(outpoint).map(OperatorRecord::info)
    }

    pub fn get_info_by_operator_key(&self, pk_operator: &PubKeyBytes) -> Option<OperatorInfo> {
        self.records
            .values()
            .find(|r| r.pk_operator == *pk_operator)
            .map(OperatorRecord::info)
    }

    pub fn get_info_by_payout_script(&self, script: &[u8]) -> Option<OperatorInfo> {
        self.records
            .values()
            .find(|r| payout_script(&r.pk_collateral.id()) == script)
            .map(OperatorRecord::info)
    }

    pub fn state_of(&self, outpoint: &OutPoint) -> OperatorState {
        self.records
            .get(outpoint)
            .map(|r| r.state)
            .unwrap_or(OperatorState::NewStartRequired)
    }

    pub fn infos(&self) -> Vec<OperatorInfo> {
        self.records.values().map(OperatorRecord::info).collect()
    }

    pub fn heartbeat_within(&self, outpoint: &OutPoint, seconds: i64, at: i64) -> bool {
        self.records
            .get(outpoint)
            .is_some_and(|r| r.heartbeat_within(seconds, at))
    }

    /// Zufälliger aktivierter Operator außerhalb der Ausschlussliste.
    pub fn find_random_not_in(
        &self,
        exclude: &[OutPoint],
        min_protocol: i32,
    ) -> Option<OperatorInfo> {
        let candidates: Vec<&OperatorRecord> = self
            .records
            .values()
            .filter(|r| r.protocol_version >= min_protocol && r.is_enabled())
            .filter(|r| !exclude.contains(&r.vin.prev_out))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(pick).map(|r| r.info())
    }

    // ============================
    // Announce-Einreichung
    // ============================

    pub fn submit_announce(
        &mut self,
        mut mnb: Announce,
        source: Option<NetAddress>,
        chain: &dyn ChainView,
        now: i64,
        sync: SyncFlags,
    ) -> Admission {
        let hash = mnb.digest();
        debug!(operator = %mnb.vin.prev_out, "announce received");

        if self.seen_announce.contains_key(&hash) && !mnb.recovery {
            return self.handle_seen_announce(hash, mnb, source, chain, now, sync);
        }
        let _ = self.seen_announce.insert(
            hash,
            SeenAnnounce {
                first_seen: now,
                announce: mnb.clone(),
            },
        );

        if let Err(adm) = self.simple_check_announce(&mut mnb, chain, now) {
            return adm;
        }

        if self.records.contains_key(&mnb.vin.prev_out) {
            self.update_existing_from_announce(hash, mnb, chain, now, sync)
        } else {
            self.admit_new_announce(hash, mnb, chain, now, sync)
        }
    }

    fn handle_seen_announce(
        &mut self,
        hash: Hash32,
        mnb: Announce,
        source: Option<NetAddress>,
        chain: &dyn ChainView,
        now: i64,
        sync: SyncFlags,
    ) -> Admission {
        if let Some(seen) = self.seen_announce.get_mut(&hash) {
            // weniger als zwei Heartbeat-Perioden vor dem endgültigen
            // Verfall: Sichtung zählt als Sync-Fortschritt
            if now - seen.first_seen > NEW_START_REQUIRED_SECONDS - MIN_MNP_SECONDS * 2 {
                seen.first_seen = now;
                self.events.push(RegistryEvent::ListSyncBumped);
            }
        }
        // Recovery-Antwort?
        if let Some(peer) = source {
            let in_window = self
                .recovery_requests
                .get(&hash)
                .is_some_and(|req| now < req.until && req.peers.contains(&peer));
            if in_window {
                if let Some(req) = self.recovery_requests.get_mut(&hash) {
                    // derselbe Peer darf nicht mehrfach antworten
                    req.peers.retain(|p| *p != peer);
                }
                let stored_hb_time = self
                    .seen_announce
                    .get(&hash)
                    .map(|s| s.announce.last_heartbeat.sig_time)
                    .unwrap_or(0);
                if mnb.last_heartbeat.sig_time > stored_hb_time {
                    // projizierten Zustand simulieren
                    let mut probe = OperatorRecord::from(&mnb);
                    let env = CheckEnv {
                        chain,
                        now,
                        registry_size: self.records.len(),
                        list_synced: sync.list_synced,
                        watchdog_active: self.is_watchdog_active(now),
                        our_operator: false,
                        min_payment_protocol: MIN_PAYMENT_PROTO_VERSION,
                    };
                    probe.check(&env, true);
                    if OperatorRecord::is_valid_state_for_auto_start(probe.state) {
                        debug!(operator = %mnb.vin.prev_out, "good recovery reply");
                        self.recovery_good_replies.entry(hash).or_default().push(mnb);
                    }
                }
            }
        }
        Admission::AlreadyKnown
    }

    /// Formale Checks ohne Registerbezug. Ein leerer oder ungültiger
    /// eingebetteter Heartbeat degradiert den Eintrag nur auf EXPIRED.
    fn simple_check_announce(
        &mut self,
        mnb: &mut Announce,
        chain: &dyn ChainView,
        now: i64,
    ) -> Result<(), Admission> {
        let params = &self.options.params;

        if !params.is_valid_operator_addr(&mnb.addr) {
            warn!(operator = %mnb.vin.prev_out, addr = %mnb.addr, "invalid announce addr");
            return Err(Admission::Rejected { dos: 0 });
        }
        if mnb.sig_time >= now + 60 * 60 {
            warn!(operator = %mnb.vin.prev_out, "announce sig_time too far in the future");
            return Err(Admission::Rejected { dos: 1 });
        }
        let hb_ok = !mnb.last_heartbeat.is_empty()
            && heartbeat_simple_check(&mnb.last_heartbeat, chain, now).is_ok();
        if !hb_ok {
            mnb.active_state = OperatorState::Expired;
        }
        if mnb.protocol_version < MIN_PAYMENT_PROTO_VERSION {
            debug!(operator = %mnb.vin.prev_out, version = mnb.protocol_version, "outdated announce");
            return Err(Admission::Rejected { dos: 0 });
        }
        if mnb.pk_collateral.0.len() != 33 {
            warn!("announce collateral pubkey has the wrong size");
            return Err(Admission::Rejected { dos: 100 });
        }
        if mnb.pk_operator.0.len() != 33 {
            warn!("announce operator pubkey has the wrong size");
            return Err(Admission::Rejected { dos: 100 });
        }
        if !mnb.vin.script_sig.is_empty() {
            warn!("announce vin carries a scriptSig");
            return Err(Admission::Rejected { dos: 100 });
        }
        if !params.is_valid_operator_port(mnb.addr.port) {
            return Err(Admission::Rejected { dos: 0 });
        }
        Ok(())
    }

    fn update_existing_from_announce(
        &mut self,
        hash: Hash32,
        mnb: Announce,
        chain: &dyn ChainView,
        now: i64,
        sync: SyncFlags,
    ) -> Admission {
        let registry_size = self.records.len();
        let watchdog_active = self.is_watchdog_active(now);
        let our_key = self.is_our_operator_key(&mnb.pk_operator);
        let old_hash = self
            .records
            .get(&mnb.vin.prev_out)
            .map(|r| r.to_announce().digest());

        let Some(record) = self.records.get_mut(&mnb.vin.prev_out) else {
            return Admission::Ignored;
        };

        if record.sig_time == mnb.sig_time && !mnb.recovery {
            // legitimes Duplikat aus einer zweiten Quelle
            return Admission::AlreadyKnown;
        }
        if record.sig_time > mnb.sig_time {
            warn!(
                operator = %mnb.vin.prev_out,
                "announce older than the one we have ({} < {})",
                mnb.sig_time,
                record.sig_time
            );
            return Admission::Rejected { dos: 0 };
        }

        let env = CheckEnv {
            chain,
            now,
            registry_size,
            list_synced: sync.list_synced,
            watchdog_active,
            our_operator: our_key,
            min_payment_protocol: MIN_PAYMENT_PROTO_VERSION,
        };
        record.check(&env, false);

        if record.is_pose_banned() {
            warn!(operator = %mnb.vin.prev_out, "announce for pose-banned operator");
            return Admission::Rejected { dos: 0 };
        }
        // Collateral-Key wurde beim Outpoint-Check verifiziert, danach muss
        // er nur noch übereinstimmen
        if record.pk_collateral != mnb.pk_collateral {
            warn!("announce with mismatched collateral key");
            return Admission::Rejected { dos: 33 };
        }
        if !mnb.verify_sig() {
            warn!(operator = %mnb.vin.prev_out, "bad announce signature");
            return Admission::Rejected { dos: 100 };
        }

        let mut relayed = false;
        if !record.broadcast_within(MIN_MNB_SECONDS, now) || our_key {
            if record.update_from_new_announce(&mnb) {
                info!(operator = %mnb.vin.prev_out, addr = %mnb.addr, "updated operator entry");
                let hb = mnb.last_heartbeat.clone();
                if !hb.is_empty() {
                    let ctx = HbCtx {
                        chain,
                        now,
                        sync,
                        registry_size,
                        watchdog_active,
                        our_operator: our_key,
                    };
                    let _ = check_and_update_heartbeat(record, &hb, true, &ctx, &mut self.events);
                    let _ = self.seen_heartbeat.insert(hb.digest(), hb);
                }
                record.check(&env, true);
                self.events.push(RegistryEvent::RelayAnnounce(mnb));
                relayed = true;
            }
            self.events.push(RegistryEvent::ListSyncBumped);
        }

        // alter Seen-Eintrag ist durch den neuen ersetzt
        if let Some(old) = old_hash {
            if old != hash {
                let _ = self.seen_announce.remove(&old);
            }
        }
        Admission::Accepted { relay: relayed }
    }

    fn admit_new_announce(
        &mut self,
        hash: Hash32,
        mnb: Announce,
        chain: &dyn ChainView,
        now: i64,
        sync: SyncFlags,
    ) -> Admission {
        let params = &self.options.params;
        let our_key = self.is_our_operator_key(&mnb.pk_operator);

        // unser eigener, bereits aktivierter Eintrag braucht keinen Umweg
        if let Some(local) = &self.local_operator {
            if our_key && local.vin.prev_out == mnb.vin.prev_out && !local.vin.is_unset() {
                return Admission::Ignored;
            }
        }

        if !mnb.verify_sig() {
            warn!(operator = %mnb.vin.prev_out, "bad announce signature");
            return Admission::Rejected { dos: 100 };
        }

        let utxo = match chain.utxo(&mnb.vin.prev_out) {
            Err(ChainError::Busy) => {
                // nicht Schuld des Announces; Wiedervorlage erlauben
                let _ = self.seen_announce.remove(&hash);
                return Admission::Deferred;
            }
            Err(_) => return Admission::Deferred,
            Ok(UtxoQuery::Active(utxo)) => utxo,
            Ok(UtxoQuery::Spent) | Ok(UtxoQuery::Missing) => {
                debug!(operator = %mnb.vin.prev_out, "collateral utxo not found");
                return Admission::Rejected { dos: 0 };
            }
        };

        if utxo.value != params.collateral {
            debug!(
                operator = %mnb.vin.prev_out,
                value = utxo.value,
                "collateral utxo has the wrong denomination"
            );
            return Admission::Rejected { dos: 0 };
        }

        let tip_height = match chain.height() {
            Ok(h) => h,
            Err(ChainError::Busy) => {
                let _ = self.seen_announce.remove(&hash);
                return Admission::Deferred;
            }
            Err(_) => return Admission::Deferred,
        };
        if tip_height - utxo.height + 1 < params.min_confirmations {
            info!(
                operator = %mnb.vin.prev_out,
                "collateral needs at least {} confirmations",
                params.min_confirmations
            );
            // vielleicht fehlen uns nur Blöcke; Wiedervorlage erlauben
            let _ = self.seen_announce.remove(&hash);
            return Admission::Rejected { dos: 0 };
        }

        // Collateral muss an den angegebenen Key zahlen
        if utxo.script != payout_script(&mnb.pk_collateral.id()) {
            warn!("announce with mismatched collateral key and vin");
            return Admission::Rejected { dos: 33 };
        }

        // sig_time darf nicht vor dem Block liegen, mit dem das Collateral
        // seine Mindestbestätigungen erreichte
        match chain.block_index_at(utxo.height + params.min_confirmations - 1) {
            Ok(Some(conf_block)) if conf_block.time > mnb.sig_time => {
                warn!(
                    operator = %mnb.vin.prev_out,
                    "bad sig_time {} (conf block at {})",
                    mnb.sig_time,
                    conf_block.time
                );
                return Admission::Rejected { dos: 0 };
            }
            Err(ChainError::Busy) => {
                let _ = self.seen_announce.remove(&hash);
                return Admission::Deferred;
            }
            _ => {}
        }

        let mut record = OperatorRecord::from(&mnb);
        let registry_size = self.records.len() + 1;
        let watchdog_active = self.is_watchdog_active(now);
        if our_key {
            record.pose_ban_score = -POSE_BAN_MAX_SCORE;
        }

        // der eingebettete Heartbeat wurde im SimpleCheck geprüft und kommt
        // unverändert mit in den Eintrag
        let hb = mnb.last_heartbeat.clone();
        if !hb.is_empty() {
            let _ = self.seen_heartbeat.insert(hb.digest(), hb);
        }
        let env = CheckEnv {
            chain,
            now,
            registry_size,
            list_synced: sync.list_synced,
            watchdog_active,
            our_operator: our_key,
            min_payment_protocol: MIN_PAYMENT_PROTO_VERSION,
        };
        record.check(&env, true);

        info!(operator = %mnb.vin.prev_out, addr = %mnb.addr, count = registry_size, "new operator entry");
        self.index.add(mnb.vin.prev_out);
        let _ = self.records.insert(mnb.vin.prev_out, record);
        self.operators_added = true;
        self.events.push(RegistryEvent::OperatorsAdded);
        self.events.push(RegistryEvent::ListSyncBumped);

        if our_key {
            if mnb.protocol_version == PROTOCOL_VERSION {
                info!(operator = %mnb.vin.prev_out, "remote activation via own announce");
                self.events.push(RegistryEvent::RemoteActivation);
            } else {
                warn!(
                    "own announce carries protocol {} instead of {}, re-activation required",
                    mnb.protocol_version, PROTOCOL_VERSION
                );
                return Admission::Accepted { relay: false };
            }
        }
        self.events.push(RegistryEvent::RelayAnnounce(mnb));
        Admission::Accepted { relay: true }
    }

    // ============================
    // Heartbeat-Einreichung
    // ============================

    pub fn submit_heartbeat(
        &mut self,
        hb: Heartbeat,
        source: Option<NetAddress>,
        chain: &dyn ChainView,
        now: i64,
        sync: SyncFlags,
    ) -> HeartbeatAdmission {
        let hash = hb.digest();
        if self.seen_heartbeat.contains_key(&hash) {
            return HeartbeatAdmission::AlreadyKnown;
        }
        let _ = self.seen_heartbeat.insert(hash, hb.clone());
        debug!(operator = %hb.vin.prev_out, "new heartbeat");

        let registry_size = self.records.len();
        let watchdog_active = self.is_watchdog_active(now);
        let outpoint = hb.vin.prev_out;

        let Some(record) = self.records.get_mut(&outpoint) else {
            // unbekannter Eintrag: beim Absender nach dem Announce fragen
            if let Some(peer) = source {
                self.events.push(RegistryEvent::AskEntry {
                    peer,
                    vin: hb.vin.clone(),
                });
            }
            return HeartbeatAdmission::NotFound;
        };

        // zu spät, nur ein neues Announce hilft noch
        if record.is_new_start_required() {
            return HeartbeatAdmission::Ignored;
        }

        let our_key = self
            .local_operator
            .as_ref()
            .is_some_and(|l| PubKeyBytes::from_keypair(&l.keypair) == record.pk_operator);
        let ctx = HbCtx {
            chain,
            now,
            sync,
            registry_size,
            watchdog_active,
            our_operator: our_key,
        };
        let outcome = check_and_update_heartbeat(record, &hb, false, &ctx, &mut self.events);

        match outcome {
            HbResult::Accepted { relay } => {
                // Seen-Announce des Eintrags trägt jetzt den neuen Heartbeat
                let ann_hash = record.to_announce().digest();
                if let Some(seen) = self.seen_announce.get_mut(&ann_hash) {
                    seen.announce.last_heartbeat = hb.clone();
                }
                if relay {
                    self.events.push(RegistryEvent::RelayHeartbeat(hb));
                }
                HeartbeatAdmission::Accepted { relay }
            }
            HbResult::Ignored => HeartbeatAdmission::Ignored,
            HbResult::Deferred => HeartbeatAdmission::Deferred,
            HbResult::Rejected { dos } => {
                if dos == 0 {
                    HeartbeatAdmission::Ignored
                } else {
                    HeartbeatAdmission::Rejected { dos }
                }
            }
        }
    }

    /// Übernimmt den selbst erzeugten Heartbeat des lokalen Operators und
    /// hält die Seen-Caches konsistent.
    pub fn set_last_heartbeat(&mut self, outpoint: &OutPoint, hb: Heartbeat) {
        let Some(record) = self.records.get_mut(outpoint) else {
            return;
        };
        record.last_heartbeat = hb.clone();
        let ann_hash = record.to_announce().digest();
        let _ = self.seen_heartbeat.insert(hb.digest(), hb.clone());
        if let Some(seen) = self.seen_announce.get_mut(&ann_hash) {
            seen.announce.last_heartbeat = hb;
        }
    }

    /// Erzwungene Zustandsprüfung des Eintrags mit diesem Operator-Key.
    pub fn force_check_by_operator_key(
        &mut self,
        pk_operator: &PubKeyBytes,
        chain: &dyn ChainView,
        now: i64,
        sync: SyncFlags,
    ) {
        let registry_size = self.records.len();
        let watchdog_active = self.is_watchdog_active(now);
        let Some(record) = self
            .records
            .values_mut()
            .find(|r| r.pk_operator == *pk_operator)
        else {
            return;
        };
        let env = CheckEnv {
            chain,
            now,
            registry_size,
            list_synced: sync.list_synced,
            watchdog_active,
            our_operator: true,
            min_payment_protocol: MIN_PAYMENT_PROTO_VERSION,
        };
        record.check(&env, true);
    }

    // ============================
    // Listen bedienen und erfragen
    // ============================

    /// Beantwortet eine Listen-Anfrage. Volliste höchstens einmal je
    /// `DSEG_UPDATE_SECONDS` pro Peer, gezielte Einzelanfragen jederzeit.
    pub fn serve_list_request(
        &mut self,
        peer: NetAddress,
        filter: &TxIn,
        now: i64,
        sync: SyncFlags,
    ) -> Result<Vec<NodeMessage>, u32> {
        // erst nach vollständigem Sync bedienen, das ist eine teure Anfrage
        if !sync.fully_synced {
            return Ok(Vec::new());
        }

        let full_list = filter.is_unset();
        if full_list {
            let is_local = peer.is_rfc1918() || peer.is_local();
            if !is_local && self.options.params.is_main() {
                if let Some(until) = self.asked_us_for_list.get(&peer) {
                    if now < *until {
                        warn!(%peer, "peer asked for the list again too early");
                        return Err(34);
                    }
                }
                let _ = self.asked_us_for_list.insert(peer, now + DSEG_UPDATE_SECONDS);
            }
        }

        let mut out = Vec::new();
        let mut count = 0i32;
        for record in self.records.values() {
            if !full_list && record.vin != *filter {
                continue;
            }
            if record.addr.is_rfc1918() || record.addr.is_local() {
                continue; // keine lokalen Adressen verteilen
            }
            if record.is_update_required() {
                continue;
            }
            debug!(operator = %record.vin.prev_out, addr = %record.addr, "serving entry");
            let mnb = record.to_announce();
            let hash = mnb.digest();
            if !self.seen_announce.contains_key(&hash) {
                let _ = self.seen_announce.insert(
                    hash,
                    SeenAnnounce {
                        first_seen: now,
                        announce: mnb.clone(),
                    },
                );
            }
            out.push(NodeMessage::Announce(mnb));
            if !record.last_heartbeat.is_empty() {
                out.push(NodeMessage::Heartbeat(record.last_heartbeat.clone()));
            }
            count += 1;
            if !full_list {
                info!(%peer, "sent single operator entry");
                return Ok(out);
            }
        }
        if !full_list {
            // jemand fragt nach einem Outpoint, den wir nicht kennen
            debug!(%peer, "no entries sent for single query");
            return Ok(out);
        }
        out.push(NodeMessage::SyncStatusCount {
            item: SYNC_ITEM_LIST,
            count,
        });
        info!(%peer, count, "sent operator list");
        Ok(out)
    }

    /// Gezielte Nachfrage nach einem fehlenden Eintrag bei einem Peer.
    pub fn ask_for_entry(
        &mut self,
        peer: NetAddress,
        vin: &TxIn,
        now: i64,
    ) -> Option<NodeMessage> {
        let per_peer = self.we_asked_for_entry.entry(vin.prev_out).or_default();
        if let Some(until) = per_peer.get(&peer) {
            if now < *until {
                // zu häufiges Fragen provoziert Banns
                return None;
            }
            info!(%peer, operator = %vin.prev_out, "asking same peer again");
        } else {
            info!(%peer, operator = %vin.prev_out, "asking new peer");
        }
        let _ = per_peer.insert(peer, now + DSEG_UPDATE_SECONDS);
        Some(NodeMessage::ListRequest { vin: vin.clone() })
    }

    /// Volllisten-Anfrage an einen Peer (mit Wiederhol-Drossel).
    pub fn dseg_update(&mut self, peer: NetAddress, now: i64) -> Option<NodeMessage> {
        if self.options.params.is_main() && !(peer.is_rfc1918() || peer.is_local()) {
            if let Some(until) = self.we_asked_for_list.get(&peer) {
                if now < *until {
                    debug!(%peer, "already asked for the list, skipping");
                    return None;
                }
            }
        }
        let _ = self.we_asked_for_list.insert(peer, now + DSEG_UPDATE_SECONDS);
        debug!(%peer, "asking for the operator list");
        Some(NodeMessage::ListRequest {
            vin: TxIn::default(),
        })
    }

    // ============================
    // Sweep
    // ============================

    pub fn check_all(&mut self, chain: &dyn ChainView, now: i64, sync: SyncFlags) {
        let registry_size = self.records.len();
        let watchdog_active = self.is_watchdog_active(now);
        let local_pk = self
            .local_operator
            .as_ref()
            .map(|l| PubKeyBytes::from_keypair(&l.keypair));
        for record in self.records.values_mut() {
            let our_operator = local_pk.as_ref() == Some(&record.pk_operator);
            let env = CheckEnv {
                chain,
                now,
                registry_size,
                list_synced: sync.list_synced,
                watchdog_active,
                our_operator,
                min_payment_protocol: MIN_PAYMENT_PROTO_VERSION,
            };
            record.check(&env, false);
        }
    }

    /// Vollständiger Sweep: Zustände neu berechnen, verbrauchte Einträge
    /// entfernen, Recovery anstoßen und Buchführung verfallen lassen.
    pub fn check_and_remove(&mut self, chain: &dyn ChainView, now: i64, sync: SyncFlags) {
        if !sync.list_synced {
            return;
        }
        debug!("registry sweep");
        self.check_all(chain, now, sync);

        let tip = chain.tip().ok();

        // verbrauchte Collaterals entfernen
        let spent: Vec<OutPoint> = self
            .records
            .values()
            .filter(|r| r.is_outpoint_spent())
            .map(|r| r.vin.prev_out)
            .collect();
        for outpoint in spent {
            self.erase_record(&outpoint);
        }

        // Recovery für nicht mehr heartbeat-fähige Einträge
        if let Some(tip) = tip {
            self.schedule_recovery_asks(chain, now, sync, tip);
        }
        self.process_recovery_replies(chain, now, sync);

        // Wiedervorlage nach Ablauf des Retry-Fensters
        self.recovery_requests
            .retain(|_, req| now - req.until <= MNB_RECOVERY_RETRY_SECONDS);

        // abgelaufene Anfrage-Buchführung
        self.asked_us_for_list.retain(|_, until| *until >= now);
        self.we_asked_for_list.retain(|_, until| *until >= now);
        self.we_asked_for_entry.retain(|_, peers| {
            peers.retain(|_, until| *until >= now);
            !peers.is_empty()
        });
        if let Some(tip) = tip {
            // unbeantwortete Challenges kosten den Adressinhaber Score
            let unanswered: Vec<NetAddress> = self
                .we_asked_for_verification
                .iter()
                .filter(|(_, mnv)| {
                    mnv.block_height < tip.height - MAX_POSE_BLOCKS && mnv.sig1.is_empty()
                })
                .map(|(addr, _)| *addr)
                .collect();
            for addr in unanswered {
                let hit = self.punish_address(&addr);
                if hit > 0 {
                    debug!(%addr, "verify request expired without reply");
                }
            }
            self.we_asked_for_verification
                .retain(|_, mnv| mnv.block_height >= tip.height - MAX_POSE_BLOCKS);
            self.seen_verification
                .retain(|_, mnv| mnv.block_height >= tip.height - MAX_POSE_BLOCKS);
        }

        // Seen-Announces bewusst NICHT verfallen lassen; Heartbeats schon
        self.seen_heartbeat
            .retain(|_, hb| now - hb.sig_time <= NEW_START_REQUIRED_SECONDS);

        info!("{}", self.summary());

        if self.operators_removed {
            self.check_and_rebuild_index(now);
            self.events.push(RegistryEvent::OperatorsRemoved);
            self.operators_removed = false;
        }
    }

    fn erase_record(&mut self, outpoint: &OutPoint) {
        if let Some(record) = self.records.remove(outpoint) {
            info!(operator = %outpoint, addr = %record.addr, count = self.records.len(), "removing operator entry");
            let hash = record.to_announce().digest();
            let _ = self.seen_announce.remove(&hash);
            let _ = self.we_asked_for_entry.remove(outpoint);
            // Governance-Objekte mit Stimmen dieses Operators neu bewerten
            self.dirty_governance_hashes
                .extend(record.governance_votes_cast.keys().copied());
            self.operators_removed = true;
        }
    }

    fn schedule_recovery_asks(
        &mut self,
        chain: &dyn ChainView,
        now: i64,
        sync: SyncFlags,
        tip: BlockIndex,
    ) {
        if !sync.fully_synced {
            return;
        }
        let mut ask_budget = MNB_RECOVERY_MAX_ASK_ENTRIES;
        let mut ranks: Option<Vec<(usize, OperatorInfo)>> = None;

        let needing: Vec<(OutPoint, Hash32)> = self
            .records
            .values()
            .filter(|r| r.is_new_start_required())
            .map(|r| (r.vin.prev_out, r.to_announce().digest()))
            .collect();

        for (outpoint, hash) in needing {
            if ask_budget == 0 {
                break;
            }
            if self.recovery_requests.contains_key(&hash) {
                continue;
            }
            // Ranking an einer zufälligen vergangenen Höhe, damit nicht
            // alle Knoten dieselben Peers fragen
            if ranks.is_none() {
                let height = rand::thread_rng().gen_range(0..=tip.height.max(0));
                ranks = Some(self.ranks_at(chain, height, MIN_PAYMENT_PROTO_VERSION));
            }
            let Some(ranked) = ranks.as_ref() else { break };

            let mut requested: Vec<NetAddress> = Vec::new();
            for (_, info) in ranked.iter() {
                if requested.len() >= MNB_RECOVERY_QUORUM_TOTAL {
                    break;
                }
                // Peers, die wir für diesen Outpoint kürzlich fragten, meiden
                let recently_asked = self
                    .we_asked_for_entry
                    .get(&outpoint)
                    .is_some_and(|m| m.contains_key(&info.addr));
                if recently_asked || requested.contains(&info.addr) {
                    continue;
                }
                requested.push(info.addr);
                self.scheduled_recovery_connections.push((info.addr, hash));
            }
            if !requested.is_empty() {
                debug!(operator = %outpoint, peers = requested.len(), "recovery initiated");
                ask_budget -= 1;
                let _ = self.recovery_requests.insert(
                    hash,
                    RecoveryRequest {
                        until: now + MNB_RECOVERY_WAIT_SECONDS,
                        peers: requested,
                    },
                );
            }
        }
    }

    fn process_recovery_replies(&mut self, chain: &dyn ChainView, now: i64, sync: SyncFlags) {
        let expired: Vec<Hash32> = self
            .recovery_good_replies
            .keys()
            .filter(|hash| {
                self.recovery_requests
                    .get(*hash)
                    .is_none_or(|req| req.until < now)
            })
            .copied()
            .collect();
        for hash in expired {
            let Some(replies) = self.recovery_good_replies.remove(&hash) else {
                continue;
            };
            if replies.len() >= MNB_RECOVERY_QUORUM_REQUIRED {
                // genug Peers halten den Eintrag für lebendig; eine der
                // Antworten wird autoritativ nachverarbeitet
                if let Some(first) = replies.into_iter().next() {
                    info!(operator = %first.vin.prev_out, "reprocessing recovery announce");
                    let mut rescue = first;
                    rescue.recovery = true;
                    let _ = self.submit_announce(rescue, None, chain, now, sync);
                }
            }
        }
    }

    pub fn is_recovery_requested(&self, hash: &Hash32) -> bool {
        self.recovery_requests.contains_key(hash)
    }

    /// Nächste geplante Recovery-Verbindung; gleiche Zieladresse wird zu
    /// einem Hash-Bündel zusammengefasst.
    pub fn pop_scheduled_recovery_connection(&mut self) -> Option<(NetAddress, Vec<Hash32>)> {
        if self.scheduled_recovery_connections.is_empty() {
            return None;
        }
        self.scheduled_recovery_connections.sort();
        let addr = self.scheduled_recovery_connections.first()?.0;
        let mut hashes = Vec::new();
        self.scheduled_recovery_connections.retain(|(a, h)| {
            if *a == addr {
                if !hashes.contains(h) {
                    hashes.push(*h);
                }
                false
            } else {
                true
            }
        });
        Some((addr, hashes))
    }

    // ============================
    // Ranking
    // ============================

    fn scored(
        &self,
        seed: &Hash32,
        min_protocol: i32,
        only_enabled: bool,
        watchdog_active: bool,
    ) -> Vec<(ScoreU256, OutPoint)> {
        let mut scores: Vec<(ScoreU256, OutPoint)> = self
            .records
            .values()
            .filter(|r| r.protocol_version >= min_protocol)
            .filter(|r| {
                if only_enabled {
                    r.is_enabled()
                } else {
                    r.is_valid_for_payment(watchdog_active)
                }
            })
            .map(|r| (operator_score(&r.vin.prev_out, seed), r.vin.prev_out))
            .collect();
        // Score absteigend, Outpoint als Tiebreaker
        scores.sort_by(|(sa, oa), (sb, ob)| sb.cmp(sa).then(oa.cmp(ob)));
        scores
    }

    /// Rang (1-basiert) eines Operators an einer Höhe.
    pub fn rank_of(
        &self,
        chain: &dyn ChainView,
        outpoint: &OutPoint,
        height: i32,
        min_protocol: i32,
        only_enabled: bool,
    ) -> Option<usize> {
        let seed = chain.block_hash(height).ok()?;
        let watchdog_active = false;
        self.scored(&seed, min_protocol, only_enabled, watchdog_active)
            .iter()
            .position(|(_, o)| o == outpoint)
            .map(|p| p + 1)
    }

    /// Score-sortierte Rangliste der aktivierten Operatoren an einer Höhe.
    pub fn ranks_at(
        &self,
        chain: &dyn ChainView,
        height: i32,
        min_protocol: i32,
    ) -> Vec<(usize, OperatorInfo)> {
        let Ok(seed) = chain.block_hash(height) else {
            return Vec::new();
        };
        self.scored(&seed, min_protocol, true, false)
            .iter()
            .enumerate()
            .filter_map(|(i, (_, o))| self.get_info(o).map(|info| (i + 1, info)))
            .collect()
    }

    pub fn by_rank(
        &self,
        chain: &dyn ChainView,
        rank: usize,
        height: i32,
        min_protocol: i32,
    ) -> Option<OperatorInfo> {
        self.ranks_at(chain, height, min_protocol)
            .into_iter()
            .find(|(r, _)| *r == rank)
            .map(|(_, info)| info)
    }

    // ============================
    // Auszahlung: Kandidaten & Historie
    // ============================

    /// Wert-Schnappschüsse aller zahlungsberechtigten Einträge.
    pub fn payment_candidates(&self, now: i64) -> Vec<OperatorInfo> {
        let watchdog_active = self.is_watchdog_active(now);
        self.records
            .values()
            .filter(|r| r.is_valid_for_payment(watchdog_active))
            .map(OperatorRecord::info)
            .collect()
    }

    /// Rückwärts-Scan der Blockhistorie nach der letzten Auszahlung je
    /// Operator.
    pub fn update_last_paid(
        &mut self,
        chain: &dyn ChainView,
        payees: &dyn PayeeHistory,
        max_scan_back: i32,
    ) {
        let Ok(tip) = chain.tip() else { return };
        for record in self.records.values_mut() {
            let script = payout_script(&record.pk_collateral.id());
            for i in 0..max_scan_back {
                let height = tip.height - i;
                if height <= record.last_paid_block || height < 0 {
                    break;
                }
                if !payees.has_payee_with_votes(height, &script, 2) {
                    continue;
                }
                let Ok(Some(block)) = chain.read_block(height) else {
                    continue;
                };
                let payment = chain.operator_payment(height, block.coinbase_value_out());
                let paid = block
                    .coinbase_outputs
                    .iter()
                    .any(|o| o.script == script && o.value == payment);
                if paid {
                    debug!(operator = %record.vin.prev_out, height, "found last payment");
                    record.last_paid_block = height;
                    record.last_paid_time = block.time;
                    break;
                }
            }
        }
    }

    // ============================
    // Index-Delegation
    // ============================

    pub fn index_of(&self, outpoint: &OutPoint) -> Option<i32> {
        self.index.index_of(outpoint)
    }

    pub fn outpoint_by_index(&self, idx: i32) -> Option<OutPoint> {
        self.index.get(idx)
    }

    pub fn index_of_old(&self, outpoint: &OutPoint) -> Option<i32> {
        self.index_old.index_of(outpoint)
    }

    pub fn index_rebuilt_flag(&self) -> bool {
        self.index_rebuilt
    }

    pub fn clear_old_index(&mut self) {
        self.index_old.clear();
        self.index_rebuilt = false;
    }

    fn check_and_rebuild_index(&mut self, now: i64) {
        if now - self.last_index_rebuild < MIN_INDEX_REBUILD_TIME {
            return;
        }
        if self.index.size() <= MAX_EXPECTED_INDEX_SIZE as i32 {
            return;
        }
        if self.index.size() <= self.records.len() as i32 {
            return;
        }
        // eine alte Generation bleibt für Übergangs-Lookups erhalten
        self.index_old = self.index.clone();
        self.index.clear();
        for outpoint in self.records.keys() {
            self.index.add(*outpoint);
        }
        self.index_rebuilt = true;
        self.last_index_rebuild = now;
        info!(size = self.index.size(), "operator index rebuilt");
    }

    // ============================
    // Governance-Haken
    // ============================

    pub fn add_governance_vote(&mut self, outpoint: &OutPoint, object_hash: Hash32) -> bool {
        match self.records.get_mut(outpoint) {
            Some(record) => {
                record.add_governance_vote(object_hash);
                true
            }
            None => false,
        }
    }

    pub fn remove_governance_object(&mut self, object_hash: &Hash32) {
        for record in self.records.values_mut() {
            record.remove_governance_object(object_hash);
        }
    }

    pub fn add_dirty_governance_hash(&mut self, hash: Hash32) {
        self.dirty_governance_hashes.push(hash);
    }

    pub fn get_and_clear_dirty_governance_hashes(&mut self) -> Vec<Hash32> {
        std::mem::take(&mut self.dirty_governance_hashes)
    }

    // ============================
    // Inventory-Auflösung und Diagnose
    // ============================

    pub fn message_for_inv(&self, inv: &Inv) -> Option<NodeMessage> {
        match inv.ty {
            InvType::Announce => self
                .seen_announce
                .get(&inv.hash)
                .map(|s| NodeMessage::Announce(s.announce.clone())),
            InvType::Heartbeat => self
                .seen_heartbeat
                .get(&inv.hash)
                .map(|hb| NodeMessage::Heartbeat(hb.clone())),
            InvType::Verify => self
                .seen_verification
                .get(&inv.hash)
                .map(|v| NodeMessage::Verify(v.clone())),
            InvType::PaymentVote => None,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Operators: {}, peers who asked us for the list: {}, peers we asked for the list: {}, entries we asked for: {}, index size: {}, dsq count: {}",
            self.records.len(),
            self.asked_us_for_list.len(),
            self.we_asked_for_list.len(),
            self.we_asked_for_entry.len(),
            self.index.size(),
            self.dsq_count
        )
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.asked_us_for_list.clear();
        self.we_asked_for_list.clear();
        self.we_asked_for_entry.clear();
        self.seen_announce.clear();
        self.seen_heartbeat.clear();
        self.dsq_count = 0;
        self.last_watchdog_vote_time = 0;
        self.index.clear();
        self.index_old.clear();
    }

    // interner Zugriff für PoSe und Snapshot
    pub(crate) fn records(&self) -> &BTreeMap<OutPoint, OperatorRecord> {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> &mut BTreeMap<OutPoint, OperatorRecord> {
        &mut self.records
    }

    pub(crate) fn push_event(&mut self, event: RegistryEvent) {
        self.events.push(event);
    }

    pub(crate) fn restore_parts(&mut self, snap: RegistrySnapshot) {
        self.records = snap
            .records
            .into_iter()
            .map(|r| (r.vin.prev_out, r))
            .collect();
        self.asked_us_for_list = snap.asked_us_for_list;
        self.we_asked_for_list = snap.we_asked_for_list;
        self.we_asked_for_entry = snap.we_asked_for_entry;
        self.recovery_requests = snap.recovery_requests;
        self.recovery_good_replies = snap.recovery_good_replies;
        self.last_watchdog_vote_time = snap.last_watchdog_vote_time;
        self.dsq_count = snap.dsq_count;
        self.seen_announce = snap.seen_announce;
        self.seen_heartbeat = snap.seen_heartbeat;
        self.index = snap.index;
    }

    pub(crate) fn snapshot_parts(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            version: snapshot::SERIALIZATION_VERSION.to_string(),
            records: self.records.values().cloned().collect(),
            asked_us_for_list: self.asked_us_for_list.clone(),
            we_asked_for_list: self.we_asked_for_list.clone(),
            we_asked_for_entry: self.we_asked_for_entry.clone(),
            recovery_requests: self.recovery_requests.clone(),
            recovery_good_replies: self.recovery_good_replies.clone(),
            last_watchdog_vote_time: self.last_watchdog_vote_time,
            dsq_count: self.dsq_count,
            seen_announce: self.seen_announce.clone(),
            seen_heartbeat: self.seen_heartbeat.clone(),
            index: self.index.clone(),
        }
    }
}

// ============================
// Heartbeat-Prüfkern
// ============================

struct HbCtx<'a> {
    chain: &'a dyn ChainView,
    now: i64,
    sync: SyncFlags,
    registry_size: usize,
    watchdog_active: bool,
    our_operator: bool,
}

enum HbResult {
    Accepted { relay: bool },
    Ignored,
    Rejected { dos: u32 },
    Deferred,
}

/// Formale Heartbeat-Prüfung ohne Registerbezug.
fn heartbeat_simple_check(
    hb: &Heartbeat,
    chain: &dyn ChainView,
    now: i64,
) -> Result<(), HbResult> {
    if hb.sig_time >= now + 60 * 60 {
        warn!(operator = %hb.vin.prev_out, "heartbeat sig_time too far in the future");
        return Err(HbResult::Rejected { dos: 1 });
    }
    match chain.block_index_by_hash(&hb.block_hash) {
        Err(ChainError::Busy) => Err(HbResult::Deferred),
        Err(_) => Err(HbResult::Ignored),
        Ok(None) => {
            // vielleicht hängen wir oder sind geforkt; kein Ban
            debug!(operator = %hb.vin.prev_out, "heartbeat references unknown block");
            Err(HbResult::Ignored)
        }
        Ok(Some(_)) => Ok(()),
    }
}

fn check_and_update_heartbeat(
    record: &mut OperatorRecord,
    hb: &Heartbeat,
    from_new_broadcast: bool,
    ctx: &HbCtx<'_>,
    events: &mut Vec<RegistryEvent>,
) -> HbResult {
    if let Err(fail) = heartbeat_simple_check(hb, ctx.chain, ctx.now) {
        return fail;
    }

    if !from_new_broadcast {
        if record.is_update_required() {
            debug!(operator = %hb.vin.prev_out, "heartbeat for outdated operator");
            return HbResult::Ignored;
        }
        if record.is_new_start_required() {
            debug!(operator = %hb.vin.prev_out, "heartbeat for fully expired operator");
            return HbResult::Ignored;
        }
    }

    // Referenzblock darf nicht zu tief liegen
    match (
        ctx.chain.block_index_by_hash(&hb.block_hash),
        ctx.chain.height(),
    ) {
        (Ok(Some(idx)), Ok(tip)) => {
            if idx.height < tip - 24 {
                warn!(operator = %hb.vin.prev_out, "heartbeat block hash is too old");
                return HbResult::Ignored;
            }
        }
        (Err(ChainError::Busy), _) | (_, Err(ChainError::Busy)) => return HbResult::Deferred,
        _ => return HbResult::Ignored,
    }

    // Anti-Flood: nur annehmen, wenn der letzte gespeicherte Heartbeat
    // deutlich älter ist als dieser
    if record.heartbeat_within(MIN_MNP_SECONDS - 60, hb.sig_time) {
        debug!(operator = %hb.vin.prev_out, "heartbeat arrived too early");
        return HbResult::Ignored;
    }

    if !hb.verify_sig(&record.pk_operator) {
        warn!(operator = %hb.vin.prev_out, "bad heartbeat signature");
        return HbResult::Rejected { dos: 33 };
    }

    // während der Synchronisation zählt ein lange vermisster Eintrag mit
    // frischem Heartbeat als Fortschritt
    if !ctx.sync.list_synced && !record.heartbeat_within(EXPIRATION_SECONDS / 2, ctx.now) {
        events.push(RegistryEvent::ListSyncBumped);
    }

    record.last_heartbeat = hb.clone();

    let env = CheckEnv {
        chain: ctx.chain,
        now: ctx.now,
        registry_size: ctx.registry_size,
        list_synced: ctx.sync.list_synced,
        watchdog_active: ctx.watchdog_active,
        our_operator: ctx.our_operator,
        min_payment_protocol: MIN_PAYMENT_PROTO_VERSION,
    };
    record.check(&env, true);

    let relay = record.is_enabled();
    debug!(operator = %hb.vin.prev_out, relay, "heartbeat accepted");
    HbResult::Accepted { relay }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_chain::{InMemoryChain, Utxo};
    use sn_crypto::{sha256_32, OperatorKeypair};
    use sn_types::{ChainParams, COIN};

    fn kp(seed: &[u8]) -> OperatorKeypair {
        OperatorKeypair::from_secret_bytes(&sha256_32(seed)).expect("seckey")
    }

    fn synced() -> SyncFlags {
        SyncFlags {
            blockchain_synced: true,
            list_synced: true,
            fully_synced: true,
        }
    }

    struct Operator {
        outpoint: OutPoint,
        kc: OperatorKeypair,
        ko: OperatorKeypair,
    }

    /// Mainnet-Kette: Tip 100, Blockzeiten ab 900_000, Collateral mit
    /// genau 16 Bestätigungen bei now = 1_000_000.
    fn mainnet_setup(tag: u8) -> (OperatorRegistry, InMemoryChain, Operator, i64) {
        let registry = OperatorRegistry::new(RegistryOptions::new(ChainParams::main()));
        let chain = InMemoryChain::with_synthetic_blocks(ChainParams::main(), 100, 900_000);
        let kc = kp(&[b'c', tag]);
        let ko = kp(&[b'o', tag]);
        let mut txid = [0xaau8; 32];
        txid[31] = tag;
        let outpoint = OutPoint::new(txid, 0);
        chain
            .set_utxo(
                outpoint,
                Utxo {
                    value: 2500 * COIN,
                    height: 85,
                    script: payout_script(&kc.key_id()),
                },
            )
            .expect("utxo");
        (registry, chain, Operator { outpoint, kc, ko }, 1_000_000)
    }

    fn make_heartbeat(op: &Operator, chain: &InMemoryChain, now: i64) -> Heartbeat {
        let tip = chain.height().expect("tip");
        let mut hb = Heartbeat::new(
            TxIn::from_outpoint(op.outpoint),
            chain.block_hash(tip - 12).expect("hash"),
            now,
        );
        hb.sign(&op.ko, now);
        hb
    }

    fn make_announce(op: &Operator, chain: &InMemoryChain, addr: NetAddress, now: i64) -> Announce {
        let mut mnb = Announce {
            vin: TxIn::from_outpoint(op.outpoint),
            addr,
            pk_collateral: PubKeyBytes::from_keypair(&op.kc),
            pk_operator: PubKeyBytes::from_keypair(&op.ko),
            sig: sn_types::SigBytes::default(),
            sig_time: now,
            protocol_version: PROTOCOL_VERSION,
            last_heartbeat: make_heartbeat(op, chain, now),
            active_state: OperatorState::Enabled,
            recovery: false,
        };
        mnb.sign(&op.kc, now);
        mnb
    }

    fn peer(tag: u8) -> NetAddress {
        NetAddress::new([41, 0, 0, tag], 8884)
    }

    #[test]
    fn single_operator_bootstrap() {
        let (mut registry, chain, op, now) = mainnet_setup(1);
        let mnb = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 8], 8884), now);

        let admission = registry.submit_announce(mnb, Some(peer(1)), &chain, now, synced());
        assert_eq!(admission, Admission::Accepted { relay: true });
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.state_of(&op.outpoint), OperatorState::PreEnabled);

        // nach 601 Sekunden kommt ein frischer Heartbeat
        let later = now + 601;
        let hb = make_heartbeat(&op, &chain, later);
        let result = registry.submit_heartbeat(hb, Some(peer(1)), &chain, later, synced());
        assert_eq!(result, HeartbeatAdmission::Accepted { relay: true });
        assert_eq!(registry.state_of(&op.outpoint), OperatorState::Enabled);
    }

    #[test]
    fn duplicate_announce_relays_once_and_keeps_registry_stable() {
        let (mut registry, chain, op, now) = mainnet_setup(2);
        let mnb = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 9], 8884), now);

        let first = registry.submit_announce(mnb.clone(), Some(peer(1)), &chain, now, synced());
        assert_eq!(first, Admission::Accepted { relay: true });
        let snap_after_first = sn_codec::encode_to_vec(&registry.snapshot()).expect("encode");
        let relays_first = registry
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::RelayAnnounce(_)))
            .count();
        assert_eq!(relays_first, 1);

        // identisches Announce aus zweiter Quelle
        let second = registry.submit_announce(mnb, Some(peer(2)), &chain, now, synced());
        assert_eq!(second, Admission::AlreadyKnown);
        let relays_second = registry
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::RelayAnnounce(_)))
            .count();
        assert_eq!(relays_second, 0);
        let snap_after_second = sn_codec::encode_to_vec(&registry.snapshot()).expect("encode");
        assert_eq!(snap_after_first, snap_after_second);
    }

    #[test]
    fn newer_announce_replaces_and_drops_old_seen_entry() {
        let (mut registry, chain, op, now) = mainnet_setup(3);
        let addr1 = NetAddress::new([5, 6, 7, 10], 8884);
        let addr2 = NetAddress::new([5, 6, 7, 11], 8884);
        let mut a1 = make_announce(&op, &chain, addr1, now - 400);
        a1.last_heartbeat = make_heartbeat(&op, &chain, now - 400);
        a1.sign(&op.kc, now - 400);
        let mut a2 = make_announce(&op, &chain, addr2, now - 399);
        a2.last_heartbeat = make_heartbeat(&op, &chain, now - 399);
        a2.sign(&op.kc, now - 399);
        let h1 = a1.digest();
        let h2 = a2.digest();

        assert!(matches!(
            registry.submit_announce(a1, Some(peer(1)), &chain, now, synced()),
            Admission::Accepted { .. }
        ));
        assert!(matches!(
            registry.submit_announce(a2, Some(peer(2)), &chain, now, synced()),
            Admission::Accepted { .. }
        ));

        let info = registry.get_info(&op.outpoint).expect("record");
        assert_eq!(info.addr, addr2);
        assert!(registry.message_for_inv(&Inv::new(InvType::Announce, h1)).is_none());
        assert!(registry.message_for_inv(&Inv::new(InvType::Announce, h2)).is_some());
    }

    #[test]
    fn older_announce_is_rejected() {
        let (mut registry, chain, op, now) = mainnet_setup(4);
        let newer = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 12], 8884), now - 100);
        let older = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 13], 8884), now - 500);
        assert!(matches!(
            registry.submit_announce(newer, Some(peer(1)), &chain, now, synced()),
            Admission::Accepted { .. }
        ));
        assert_eq!(
            registry.submit_announce(older, Some(peer(2)), &chain, now, synced()),
            Admission::Rejected { dos: 0 }
        );
    }

    #[test]
    fn announce_sig_time_boundary() {
        let (mut registry, chain, op, now) = mainnet_setup(5);
        // genau eine Stunde voraus: abgelehnt mit DoS 1
        let too_new = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 14], 8884), now + 3600);
        assert_eq!(
            registry.submit_announce(too_new, Some(peer(1)), &chain, now, synced()),
            Admission::Rejected { dos: 1 }
        );
        // eine Sekunde darunter: angenommen
        let ok = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 14], 8884), now + 3599);
        assert!(matches!(
            registry.submit_announce(ok, Some(peer(1)), &chain, now, synced()),
            Admission::Accepted { .. }
        ));
    }

    #[test]
    fn bad_announce_signature_scores_100() {
        let (mut registry, chain, op, now) = mainnet_setup(6);
        let mut mnb = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 15], 8884), now);
        mnb.protocol_version = PROTOCOL_VERSION; // Feld unverändert ...
        if let Some(byte) = mnb.sig.0.get_mut(3) {
            *byte ^= 0x40; // ... aber Signatur verdorben
        }
        assert_eq!(
            registry.submit_announce(mnb, Some(peer(1)), &chain, now, synced()),
            Admission::Rejected { dos: 100 }
        );
    }

    #[test]
    fn wrong_collateral_denomination_is_rejected() {
        let (mut registry, chain, op, now) = mainnet_setup(7);
        chain
            .set_utxo(
                op.outpoint,
                Utxo {
                    value: 2499 * COIN,
                    height: 85,
                    script: payout_script(&op.kc.key_id()),
                },
            )
            .expect("utxo");
        let mnb = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 16], 8884), now);
        assert_eq!(
            registry.submit_announce(mnb, Some(peer(1)), &chain, now, synced()),
            Admission::Rejected { dos: 0 }
        );
    }

    #[test]
    fn heartbeat_anti_flood_boundaries() {
        let (mut registry, chain, op, now) = mainnet_setup(8);
        let mnb = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 17], 8884), now);
        assert!(matches!(
            registry.submit_announce(mnb, Some(peer(1)), &chain, now, synced()),
            Admission::Accepted { .. }
        ));

        // Abstand MIN_MNP - 61: zu früh, still verworfen
        let early = make_heartbeat(&op, &chain, now + MIN_MNP_SECONDS - 61);
        assert_eq!(
            registry.submit_heartbeat(early, Some(peer(1)), &chain, now + MIN_MNP_SECONDS, synced()),
            HeartbeatAdmission::Ignored
        );

        // Abstand MIN_MNP - 59: angenommen
        let ok = make_heartbeat(&op, &chain, now + MIN_MNP_SECONDS - 59);
        assert!(matches!(
            registry.submit_heartbeat(ok, Some(peer(1)), &chain, now + MIN_MNP_SECONDS, synced()),
            HeartbeatAdmission::Accepted { .. }
        ));
    }

    #[test]
    fn heartbeat_for_unknown_operator_asks_source() {
        let (mut registry, chain, op, now) = mainnet_setup(9);
        let hb = make_heartbeat(&op, &chain, now);
        let source = peer(7);
        assert_eq!(
            registry.submit_heartbeat(hb, Some(source), &chain, now, synced()),
            HeartbeatAdmission::NotFound
        );
        let events = registry.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            RegistryEvent::AskEntry { peer, .. } if *peer == source
        )));
    }

    #[test]
    fn full_list_request_is_throttled_per_peer() {
        let (mut registry, chain, op, now) = mainnet_setup(10);
        let mnb = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 18], 8884), now);
        assert!(matches!(
            registry.submit_announce(mnb, Some(peer(1)), &chain, now, synced()),
            Admission::Accepted { .. }
        ));

        let requester = NetAddress::new([51, 2, 3, 4], 8884);
        let msgs = registry
            .serve_list_request(requester, &TxIn::default(), now, synced())
            .expect("serve");
        // Announce + Heartbeat + Statuszähler
        assert_eq!(msgs.len(), 3);
        assert!(matches!(
            msgs.last(),
            Some(NodeMessage::SyncStatusCount { item: _, count: 1 })
        ));

        // zweite Volliste innerhalb des Fensters: DoS 34
        assert_eq!(
            registry.serve_list_request(requester, &TxIn::default(), now + 10, synced()),
            Err(34)
        );

        // gezielte Einzelanfrage bleibt erlaubt
        let single = registry
            .serve_list_request(
                requester,
                &TxIn::from_outpoint(op.outpoint),
                now + 20,
                synced(),
            )
            .expect("serve single");
        assert_eq!(single.len(), 2);
    }

    #[test]
    fn sweep_removes_spent_and_flags_governance() {
        let (mut registry, chain, op, now) = mainnet_setup(11);
        let mnb = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 19], 8884), now);
        assert!(matches!(
            registry.submit_announce(mnb, Some(peer(1)), &chain, now, synced()),
            Admission::Accepted { .. }
        ));
        assert!(registry.add_governance_vote(&op.outpoint, sha256_32(b"gov")));

        chain.mark_spent(&op.outpoint).expect("spend");
        registry.check_and_remove(&chain, now + CHECK_SECONDS + 1, synced());

        assert_eq!(registry.size(), 0);
        assert_eq!(
            registry.get_and_clear_dirty_governance_hashes(),
            vec![sha256_32(b"gov")]
        );
        let events = registry.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, RegistryEvent::OperatorsRemoved)));
    }

    #[test]
    fn recovery_quorum_restores_record() {
        let (mut registry, chain, op, now) = mainnet_setup(12);
        // Versorgung mit Rang-Peers, damit Recovery Ziele findet
        let mut helpers = Vec::new();
        for t in 100..110u8 {
            let (_, _, helper, _) = mainnet_setup(t);
            chain
                .set_utxo(
                    helper.outpoint,
                    Utxo {
                        value: 2500 * COIN,
                        height: 85,
                        script: payout_script(&helper.kc.key_id()),
                    },
                )
                .expect("utxo");
            let mnb = make_announce(&helper, &chain, NetAddress::new([60, 0, 0, t], 8884), now);
            assert!(matches!(
                registry.submit_announce(mnb, Some(peer(t)), &chain, now, synced()),
                Admission::Accepted { .. }
            ));
            helpers.push(helper);
        }

        // der eigentliche Eintrag, dessen Heartbeats ausgeblieben sind
        let mnb = make_announce(&op, &chain, NetAddress::new([5, 6, 7, 20], 8884), now);
        let hash = mnb.digest();
        assert!(matches!(
            registry.submit_announce(mnb.clone(), Some(peer(1)), &chain, now, synced()),
            Admission::Accepted { .. }
        ));

        let later = now + NEW_START_REQUIRED_SECONDS + 10;
        // die Helfer bleiben per frischem Heartbeat aktiviert
        for helper in &helpers {
            let hb = make_heartbeat(helper, &chain, later);
            assert!(matches!(
                registry.submit_heartbeat(hb, None, &chain, later, synced()),
                HeartbeatAdmission::Accepted { .. }
            ));
        }
        registry.check_and_remove(&chain, later, synced());
        assert_eq!(registry.state_of(&op.outpoint), OperatorState::NewStartRequired);
        assert!(registry.is_recovery_requested(&hash));
        let scheduled = registry.pop_scheduled_recovery_connection();
        assert!(scheduled.is_some());

        // sechs Peers liefern dasselbe Announce mit frischem Heartbeat
        let peers: Vec<NetAddress> = {
            // die angefragten Peers sind die Quelle der gültigen Antworten
            let req = registry.recovery_requests.get(&hash).expect("request");
            req.peers.clone()
        };
        assert!(peers.len() >= MNB_RECOVERY_QUORUM_REQUIRED);
        let mut rescue = mnb;
        rescue.last_heartbeat = make_heartbeat(&op, &chain, later);
        for source in peers.iter().take(MNB_RECOVERY_QUORUM_REQUIRED) {
            assert_eq!(
                registry.submit_announce(rescue.clone(), Some(*source), &chain, later, synced()),
                Admission::AlreadyKnown
            );
        }

        // Quorum erreicht: nach Ablauf des Wartefensters wird die Antwort
        // autoritativ nachverarbeitet
        let after_wait = later + MNB_RECOVERY_WAIT_SECONDS + 1;
        registry.check_and_remove(&chain, after_wait, synced());
        let info = registry.get_info(&op.outpoint).expect("restored");
        assert_eq!(info.last_heartbeat_time, later);
    }
}
