// SPDX-License-Identifier: AGPL-3.0-only

//! Einzelner Operator-Eintrag mit Aktivitäts-Zustandsmaschine.

use crate::consts::*;
use sn_chain::{ChainError, ChainView, UtxoQuery};
use sn_codec::{CodecError, Decodable, Encodable};
use sn_crypto::Hash32;
use sn_types::{
    Announce, Heartbeat, NetAddress, OperatorState, PubKeyBytes, SigBytes, TxIn, PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::debug;

/// Umgebung für eine State-Neuberechnung. Alle Fakten kommen vom Aufrufer;
/// der Eintrag selbst hält keine Uhr und keinen globalen Zustand.
pub struct CheckEnv<'a> {
    pub chain: &'a dyn ChainView,
    pub now: i64,
    pub registry_size: usize,
    pub list_synced: bool,
    pub watchdog_active: bool,
    pub our_operator: bool,
    pub min_payment_protocol: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorRecord {
    pub vin: TxIn,
    pub addr: NetAddress,
    pub pk_collateral: PubKeyBytes,
    pub pk_operator: PubKeyBytes,
    pub last_heartbeat: Heartbeat,
    pub sig: SigBytes,
    pub sig_time: i64,
    pub last_dsq: i64,
    pub time_last_checked: i64,
    pub last_paid_time: i64,
    pub time_last_watchdog_vote: i64,
    pub state: OperatorState,
    /// Höhe des Collateral-Blocks (0 = noch nicht aufgelöst)
    pub collateral_height: i32,
    pub last_paid_block: i32,
    pub protocol_version: i32,
    pub pose_ban_score: i32,
    pub pose_ban_until_height: i32,
    pub governance_votes_cast: BTreeMap<Hash32, i32>,
}

impl From<&Announce> for OperatorRecord {
    fn from(mnb: &Announce) -> Self {
        Self {
            vin: mnb.vin.clone(),
            addr: mnb.addr,
            pk_collateral: mnb.pk_collateral.clone(),
            pk_operator: mnb.pk_operator.clone(),
            last_heartbeat: mnb.last_heartbeat.clone(),
            sig: mnb.sig.clone(),
            sig_time: mnb.sig_time,
            last_dsq: 0,
            time_last_checked: 0,
            last_paid_time: 0,
            time_last_watchdog_vote: mnb.sig_time,
            state: mnb.active_state,
            collateral_height: 0,
            last_paid_block: 0,
            protocol_version: mnb.protocol_version,
            pose_ban_score: 0,
            pose_ban_until_height: 0,
            governance_votes_cast: BTreeMap::new(),
        }
    }
}

impl OperatorRecord {
    pub fn outpoint(&self) -> sn_types::OutPoint {
        self.vin.prev_out
    }

    pub fn is_enabled(&self) -> bool {
        self.state == OperatorState::Enabled
    }

    pub fn is_pre_enabled(&self) -> bool {
        self.state == OperatorState::PreEnabled
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == OperatorState::PoseBan
    }

    pub fn is_new_start_required(&self) -> bool {
        self.state == OperatorState::NewStartRequired
    }

    pub fn is_update_required(&self) -> bool {
        self.state == OperatorState::UpdateRequired
    }

    pub fn is_outpoint_spent(&self) -> bool {
        self.state == OperatorState::OutpointSpent
    }

    /// Score-Untergrenze erreicht: per Challenge verifiziert.
    pub fn is_pose_verified(&self) -> bool {
        self.pose_ban_score <= -POSE_BAN_MAX_SCORE
    }

    pub fn increase_pose_ban_score(&mut self) {
        if self.pose_ban_score < POSE_BAN_MAX_SCORE {
            self.pose_ban_score += 1;
        }
    }

    pub fn decrease_pose_ban_score(&mut self) {
        if self.pose_ban_score > -POSE_BAN_MAX_SCORE {
            self.pose_ban_score -= 1;
        }
    }

    pub fn heartbeat_within(&self, seconds: i64, at: i64) -> bool {
        if self.last_heartbeat.is_empty() {
            return false;
        }
        at - self.last_heartbeat.sig_time < seconds
    }

    pub fn broadcast_within(&self, seconds: i64, now: i64) -> bool {
        now - self.sig_time < seconds
    }

    /// Zahlungsberechtigt: aktiviert, oder Watchdog abgelaufen solange der
    /// Watchdog-Mechanismus netzweit inaktiv ist.
    pub fn is_valid_for_payment(&self, watchdog_active: bool) -> bool {
        match self.state {
            OperatorState::Enabled => true,
            OperatorState::WatchdogExpired => !watchdog_active,
            _ => false,
        }
    }

    pub fn is_valid_state_for_auto_start(state: OperatorState) -> bool {
        matches!(
            state,
            OperatorState::Enabled
                | OperatorState::PreEnabled
                | OperatorState::Expired
                | OperatorState::WatchdogExpired
        )
    }

    /// Collateral-Alter in Blöcken; None solange die Höhe unbekannt ist.
    pub fn collateral_age(&self, tip_height: i32) -> Option<i32> {
        if self.collateral_height == 0 {
            return None;
        }
        Some(tip_height - self.collateral_height)
    }

    /// Announce-Rekonstruktion aus dem Eintrag (für Listen und Seen-Pflege).
    pub fn to_announce(&self) -> Announce {
        Announce {
            vin: self.vin.clone(),
            addr: self.addr,
            pk_collateral: self.pk_collateral.clone(),
            pk_operator: self.pk_operator.clone(),
            sig: self.sig.clone(),
            sig_time: self.sig_time,
            protocol_version: self.protocol_version,
            last_heartbeat: self.last_heartbeat.clone(),
            active_state: self.state,
            recovery: false,
        }
    }

    pub fn info(&self) -> OperatorInfo {
        OperatorInfo {
            vin: self.vin.clone(),
            addr: self.addr,
            pk_collateral: self.pk_collateral.clone(),
            pk_operator: self.pk_operator.clone(),
            sig_time: self.sig_time,
            last_heartbeat_time: self.last_heartbeat.sig_time,
            state: self.state,
            protocol_version: self.protocol_version,
            last_paid_block: self.last_paid_block,
            last_paid_time: self.last_paid_time,
            collateral_height: self.collateral_height,
        }
    }

    /// Übernimmt ein neueres Announce. Liefert false, wenn es nicht neuer
    /// ist und kein Recovery-Override trägt.
    pub fn update_from_new_announce(&mut self, mnb: &Announce) -> bool {
        if mnb.sig_time <= self.sig_time && !mnb.recovery {
            return false;
        }
        self.pk_operator = mnb.pk_operator.clone();
        self.sig_time = mnb.sig_time;
        self.sig = mnb.sig.clone();
        self.protocol_version = mnb.protocol_version;
        self.addr = mnb.addr;
        self.pose_ban_score = 0;
        self.pose_ban_until_height = 0;
        self.time_last_checked = 0;
        true
    }

    /// Neuberechnung des Aktivitätszustands. Chain-Zugriffe sind
    /// try-lock-artig: bei `Busy` bleibt der alte Zustand stehen.
    pub fn check(&mut self, env: &CheckEnv<'_>, force: bool) {
        if !force && env.now - self.time_last_checked < CHECK_SECONDS {
            return;
        }
        self.time_last_checked = env.now;

        // einmal verbraucht, keine weiteren Prüfungen
        if self.is_outpoint_spent() {
            return;
        }

        let height = match env.chain.utxo(&self.vin.prev_out) {
            Err(ChainError::Busy) => return,
            Err(_) => return,
            Ok(UtxoQuery::Active(utxo)) => {
                if self.collateral_height == 0 {
                    self.collateral_height = utxo.height;
                }
                match env.chain.height() {
                    Ok(h) => h,
                    Err(_) => return,
                }
            }
            Ok(UtxoQuery::Spent) | Ok(UtxoQuery::Missing) => {
                self.state = OperatorState::OutpointSpent;
                debug!(operator = %self.vin.prev_out, "collateral utxo gone");
                return;
            }
        };

        if self.is_pose_banned() {
            if height < self.pose_ban_until_height {
                return;
            }
            // Ban abgelaufen: Score sinkt um eins, der Eintrag bleibt auf
            // Bewährung und kann schnell erneut gebannt werden.
            debug!(operator = %self.vin.prev_out, "pose ban lifted");
            self.decrease_pose_ban_score();
        } else if self.pose_ban_score >= POSE_BAN_MAX_SCORE {
            self.state = OperatorState::PoseBan;
            // Ban über einen ganzen Auszahlungszyklus
            self.pose_ban_until_height = height + env.registry_size as i32;
            debug!(
                operator = %self.vin.prev_out,
                until = self.pose_ban_until_height,
                "pose banned"
            );
            return;
        }

        let prev_state = self.state;

        let require_update = self.protocol_version < env.min_payment_protocol
            || (env.our_operator && self.protocol_version < PROTOCOL_VERSION);
        if require_update {
            self.set_state(prev_state, OperatorState::UpdateRequired);
            return;
        }

        // Einträge aus einer frischen Synchronisation nicht sofort
        // verfallen lassen; sie bekommen Zeit für einen Heartbeat.
        let wait_for_ping = !env.list_synced && !self.heartbeat_within(MIN_MNP_SECONDS, env.now);
        if wait_for_ping && !env.our_operator {
            if matches!(
                self.state,
                OperatorState::Expired
                    | OperatorState::WatchdogExpired
                    | OperatorState::NewStartRequired
            ) {
                return;
            }
        }

        if !wait_for_ping || env.our_operator {
            if !self.heartbeat_within(NEW_START_REQUIRED_SECONDS, env.now) {
                self.set_state(prev_state, OperatorState::NewStartRequired);
                return;
            }

            let watchdog_expired = env.watchdog_active
                && env.now - self.time_last_watchdog_vote > WATCHDOG_MAX_SECONDS;
            if watchdog_expired {
                self.set_state(prev_state, OperatorState::WatchdogExpired);
                return;
            }

            if !self.heartbeat_within(EXPIRATION_SECONDS, env.now) {
                self.set_state(prev_state, OperatorState::Expired);
                return;
            }
        }

        if self.last_heartbeat.sig_time - self.sig_time < MIN_MNP_SECONDS {
            self.set_state(prev_state, OperatorState::PreEnabled);
            return;
        }

        self.set_state(prev_state, OperatorState::Enabled);
    }

    fn set_state(&mut self, prev: OperatorState, next: OperatorState) {
        self.state = next;
        if prev != next {
            debug!(operator = %self.vin.prev_out, state = %next, "state changed");
        }
    }

    pub fn add_governance_vote(&mut self, object_hash: Hash32) {
        *self.governance_votes_cast.entry(object_hash).or_insert(0) += 1;
    }

    pub fn remove_governance_object(&mut self, object_hash: &Hash32) {
        let _ = self.governance_votes_cast.remove(object_hash);
    }
}

/// Wert-Schnappschuss für Abfragen außerhalb des Registers. Mutationen
/// laufen immer über Outpoint-Schlüssel, nie über geteilte Referenzen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorInfo {
    pub vin: TxIn,
    pub addr: NetAddress,
    pub pk_collateral: PubKeyBytes,
    pub pk_operator: PubKeyBytes,
    pub sig_time: i64,
    pub last_heartbeat_time: i64,
    pub state: OperatorState,
    pub protocol_version: i32,
    pub last_paid_block: i32,
    pub last_paid_time: i64,
    pub collateral_height: i32,
}

impl Encodable for OperatorRecord {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.vin.encode(w)?;
        self.addr.encode(w)?;
        self.pk_collateral.encode(w)?;
        self.pk_operator.encode(w)?;
        self.last_heartbeat.encode(w)?;
        self.sig.encode(w)?;
        self.sig_time.encode(w)?;
        self.last_dsq.encode(w)?;
        self.time_last_checked.encode(w)?;
        self.last_paid_time.encode(w)?;
        self.time_last_watchdog_vote.encode(w)?;
        self.state.encode(w)?;
        self.collateral_height.encode(w)?;
        self.last_paid_block.encode(w)?;
        self.protocol_version.encode(w)?;
        self.pose_ban_score.encode(w)?;
        self.pose_ban_until_height.encode(w)?;
        self.governance_votes_cast.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.vin.encoded_len()
            + self.addr.encoded_len()
            + self.pk_collateral.encoded_len()
            + self.pk_operator.encoded_len()
            + self.last_heartbeat.encoded_len()
            + self.sig.encoded_len()
            + 8 * 5
            + 1
            + 4 * 5
            + self.governance_votes_cast.encoded_len()
    }
}

impl Decodable for OperatorRecord {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            vin: TxIn::decode(r)?,
            addr: NetAddress::decode(r)?,
            pk_collateral: PubKeyBytes::decode(r)?,
            pk_operator: PubKeyBytes::decode(r)?,
            last_heartbeat: Heartbeat::decode(r)?,
            sig: SigBytes::decode(r)?,
            sig_time: i64::decode(r)?,
            last_dsq: i64::decode(r)?,
            time_last_checked: i64::decode(r)?,
            last_paid_time: i64::decode(r)?,
            time_last_watchdog_vote: i64::decode(r)?,
            state: OperatorState::decode(r)?,
            collateral_height: i32::decode(r)?,
            last_paid_block: i32::decode(r)?,
            protocol_version: i32::decode(r)?,
            pose_ban_score: i32::decode(r)?,
            pose_ban_until_height: i32::decode(r)?,
            governance_votes_cast: BTreeMap::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_chain::{InMemoryChain, Utxo};
    use sn_crypto::{sha256_32, OperatorKeypair};
    use sn_types::{ChainParams, OutPoint, COIN};

    fn kp(seed: &[u8]) -> OperatorKeypair {
        OperatorKeypair::from_secret_bytes(&sha256_32(seed)).expect("seckey")
    }

    fn chain_with_collateral(op: &OutPoint, script: Vec<u8>) -> InMemoryChain {
        let chain = InMemoryChain::with_synthetic_blocks(ChainParams::regtest(), 200, 1_000_000);
        chain
            .set_utxo(
                *op,
                Utxo {
                    value: 2500 * COIN,
                    height: 100,
                    script,
                },
            )
            .expect("utxo");
        chain
    }

    fn record(now: i64) -> (OperatorRecord, InMemoryChain) {
        let ko = kp(b"rec-op");
        let kc = kp(b"rec-col");
        let op = OutPoint::new(sha256_32(b"rec"), 0);
        let script = sn_types::payout_script(&kc.key_id());
        let chain = chain_with_collateral(&op, script);
        let mut hb = Heartbeat::new(
            TxIn::from_outpoint(op),
            InMemoryChain::synthetic_hash(188),
            now,
        );
        hb.sign(&ko, now);
        let rec = OperatorRecord {
            vin: TxIn::from_outpoint(op),
            addr: NetAddress::new([8, 8, 8, 8], 8884),
            pk_collateral: PubKeyBytes::from_keypair(&kc),
            pk_operator: PubKeyBytes::from_keypair(&ko),
            last_heartbeat: hb,
            sig: SigBytes::default(),
            sig_time: now - 2 * MIN_MNP_SECONDS,
            last_dsq: 0,
            time_last_checked: 0,
            last_paid_time: 0,
            time_last_watchdog_vote: now,
            state: OperatorState::Enabled,
            collateral_height: 0,
            last_paid_block: 0,
            protocol_version: PROTOCOL_VERSION,
            pose_ban_score: 0,
            pose_ban_until_height: 0,
            governance_votes_cast: BTreeMap::new(),
        };
        (rec, chain)
    }

    fn env<'a>(chain: &'a InMemoryChain, now: i64) -> CheckEnv<'a> {
        CheckEnv {
            chain,
            now,
            registry_size: 30,
            list_synced: true,
            watchdog_active: false,
            our_operator: false,
            min_payment_protocol: MIN_PAYMENT_PROTO_VERSION,
        }
    }

    #[test]
    fn enabled_record_stays_enabled() {
        let now = 2_000_000;
        let (mut rec, chain) = record(now);
        rec.check(&env(&chain, now), true);
        assert_eq!(rec.state, OperatorState::Enabled);
        assert_eq!(rec.collateral_height, 100);
    }

    #[test]
    fn fresh_heartbeat_means_pre_enabled() {
        let now = 2_000_000;
        let (mut rec, chain) = record(now);
        // Announce und Heartbeat liegen dicht beieinander
        rec.sig_time = now - 1;
        rec.last_heartbeat.sig_time = now;
        rec.check(&env(&chain, now), true);
        assert_eq!(rec.state, OperatorState::PreEnabled);
    }

    #[test]
    fn expiration_ladder() {
        let now = 2_000_000;
        let (mut rec, chain) = record(now);
        rec.last_heartbeat.sig_time = now - EXPIRATION_SECONDS - 1;
        rec.check(&env(&chain, now), true);
        assert_eq!(rec.state, OperatorState::Expired);

        rec.last_heartbeat.sig_time = now - NEW_START_REQUIRED_SECONDS - 1;
        rec.check(&env(&chain, now), true);
        assert_eq!(rec.state, OperatorState::NewStartRequired);
    }

    #[test]
    fn spent_collateral_is_terminal() {
        let now = 2_000_000;
        let (mut rec, chain) = record(now);
        chain.mark_spent(&rec.vin.prev_out).expect("spend");
        rec.check(&env(&chain, now), true);
        assert_eq!(rec.state, OperatorState::OutpointSpent);
        // weitere Checks ändern nichts mehr
        rec.check(&env(&chain, now + 100), true);
        assert_eq!(rec.state, OperatorState::OutpointSpent);
    }

    #[test]
    fn pose_ban_threshold_and_unban() {
        let now = 2_000_000;
        let (mut rec, chain) = record(now);
        for _ in 0..POSE_BAN_MAX_SCORE {
            rec.increase_pose_ban_score();
        }
        assert_eq!(rec.pose_ban_score, 5);
        rec.check(&env(&chain, now), true);
        assert_eq!(rec.state, OperatorState::PoseBan);
        assert_eq!(rec.pose_ban_until_height, 200 + 30);

        // vor Ablauf der Ban-Höhe bleibt alles wie es ist
        rec.check(&env(&chain, now + 10), true);
        assert_eq!(rec.state, OperatorState::PoseBan);

        // Ban-Höhe erreicht: Score wird dekrementiert, nicht genullt
        rec.pose_ban_until_height = 150;
        rec.check(&env(&chain, now + 20), true);
        assert_eq!(rec.pose_ban_score, 4);
        assert_ne!(rec.state, OperatorState::PoseBan);
    }

    #[test]
    fn outdated_protocol_requires_update() {
        let now = 2_000_000;
        let (mut rec, chain) = record(now);
        rec.protocol_version = MIN_PAYMENT_PROTO_VERSION - 1;
        rec.check(&env(&chain, now), true);
        assert_eq!(rec.state, OperatorState::UpdateRequired);
    }

    #[test]
    fn watchdog_only_when_active() {
        let now = 2_000_000;
        let (mut rec, chain) = record(now);
        rec.time_last_watchdog_vote = now - WATCHDOG_MAX_SECONDS - 1;
        rec.check(&env(&chain, now), true);
        assert_eq!(rec.state, OperatorState::Enabled);

        let mut e = env(&chain, now);
        e.watchdog_active = true;
        rec.time_last_checked = 0;
        rec.check(&e, true);
        assert_eq!(rec.state, OperatorState::WatchdogExpired);
    }

    #[test]
    fn check_throttle_without_force() {
        let now = 2_000_000;
        let (mut rec, chain) = record(now);
        rec.check(&env(&chain, now), true);
        chain.mark_spent(&rec.vin.prev_out).expect("spend");
        // innerhalb des Check-Intervalls ohne force: keine Neubewertung
        rec.check(&env(&chain, now + 1), false);
        assert_ne!(rec.state, OperatorState::OutpointSpent);
        rec.check(&env(&chain, now + CHECK_SECONDS + 1), false);
        assert_eq!(rec.state, OperatorState::OutpointSpent);
    }

    #[test]
    fn update_from_newer_announce_resets_pose() {
        let now = 2_000_000;
        let (mut rec, _chain) = record(now);
        rec.pose_ban_score = 3;
        let mut mnb = rec.to_announce();
        mnb.sig_time = rec.sig_time + 1;
        mnb.addr = NetAddress::new([9, 9, 9, 9], 8884);
        assert!(rec.update_from_new_announce(&mnb));
        assert_eq!(rec.addr, mnb.addr);
        assert_eq!(rec.pose_ban_score, 0);

        // gleiche sig_time ohne Recovery: keine Übernahme
        let again = rec.to_announce();
        assert!(!rec.update_from_new_announce(&again));
        // mit Recovery-Flag schon
        let mut rescue = rec.to_announce();
        rescue.recovery = true;
        assert!(rec.update_from_new_announce(&rescue));
    }

    #[test]
    fn record_codec_roundtrip() {
        let now = 2_000_000;
        let (mut rec, _chain) = record(now);
        rec.add_governance_vote(sha256_32(b"gov1"));
        rec.add_governance_vote(sha256_32(b"gov1"));
        rec.add_governance_vote(sha256_32(b"gov2"));
        let buf = sn_codec::encode_to_vec(&rec).expect("encode");
        assert_eq!(buf.len(), rec.encoded_len());
        let back: OperatorRecord = sn_codec::decode_from_slice(&buf).expect("decode");
        assert_eq!(back, rec);
        assert_eq!(back.governance_votes_cast.get(&sha256_32(b"gov1")), Some(&2));
    }
}
