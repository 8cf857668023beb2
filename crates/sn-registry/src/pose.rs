// SPDX-License-Identifier: AGPL-3.0-only

//! Proof-of-Service: gezielte Verifikations-Challenges zwischen hoch
//! gerankten Operatoren, Antwort-/Broadcast-Verarbeitung und die
//! Gleiche-Adresse-Razzia.

use crate::consts::*;
use crate::{LocalOperator, OperatorRegistry, RegistryEvent, SyncFlags};
use rand::Rng;
use sn_chain::{ChainError, ChainView};
use sn_p2p::fulfilled::{
    FulfilledRequestCache, REQ_VERIFY_DONE, REQ_VERIFY_REPLY, REQ_VERIFY_REQUEST,
};
use sn_types::{NetAddress, OutPoint, Verification};
use tracing::{debug, info, warn};

impl OperatorRegistry {
    /// Ein Verifikationsschritt: nur wer selbst in den Top-Rängen steht,
    /// challenged; Ziele liegen ab Offset `MAX_POSE_RANK + eigener Rang - 1`
    /// mit Schrittweite `MAX_POSE_CONNECTIONS`.
    pub fn do_verification_step(
        &mut self,
        local: &LocalOperator,
        chain: &dyn ChainView,
        fulfilled: &mut FulfilledRequestCache,
        now: i64,
    ) -> Vec<(NetAddress, Verification)> {
        let mut out = Vec::new();
        if local.vin.is_unset() {
            return out;
        }
        let Ok(tip) = chain.tip() else {
            return out;
        };
        let ranks = self.ranks_at(chain, tip.height - 1, MIN_POSE_PROTO_VERSION);
        let my_rank = match ranks
            .iter()
            .find(|(_, info)| info.vin == local.vin)
            .map(|(r, _)| *r)
        {
            Some(rank) if rank <= MAX_POSE_RANK => rank,
            Some(_) | None => {
                debug!("not in top {} ranks, no verification duty", MAX_POSE_RANK);
                return out;
            }
        };
        debug!(rank = my_rank, total = ranks.len(), "running verification step");

        let mut idx = MAX_POSE_RANK + my_rank - 1;
        let mut count = 0usize;
        while idx < ranks.len() {
            let Some((_, target)) = ranks.get(idx) else {
                break;
            };
            let target_state = self.records().get(&target.vin.prev_out);
            let skip = target_state
                .map(|r| r.is_pose_verified() || r.is_pose_banned())
                .unwrap_or(true);
            if skip {
                idx += MAX_POSE_CONNECTIONS;
                continue;
            }
            if fulfilled.has(&target.addr, REQ_VERIFY_REQUEST, now) {
                debug!(addr = %target.addr, "already asked for verification recently");
            } else {
                fulfilled.add(target.addr, REQ_VERIFY_REQUEST, now);
                let nonce: u32 = rand::thread_rng().gen_range(1..999_999);
                let mnv = Verification::request(target.addr, nonce, tip.height - 1);
                let _ = self.we_asked_for_verification.insert(target.addr, mnv.clone());
                info!(addr = %target.addr, nonce, "sending verify request");
                out.push((target.addr, mnv));
                count += 1;
                if count >= MAX_POSE_CONNECTIONS {
                    break;
                }
            }
            idx += MAX_POSE_CONNECTIONS;
        }
        debug!(sent = out.len(), "verification requests issued");
        out
    }

    /// Stufe 1 eingehend: jemand will, dass wir unsere Adresse beweisen.
    /// Nur konfigurierte Operatoren antworten; alle anderen schweigen,
    /// ohne den Absender zu bestrafen.
    pub fn send_verify_reply(
        &mut self,
        peer: NetAddress,
        mnv: Verification,
        local: Option<&LocalOperator>,
        chain: &dyn ChainView,
        fulfilled: &mut FulfilledRequestCache,
        now: i64,
    ) -> Result<Option<Verification>, u32> {
        let Some(local) = local else {
            return Ok(None);
        };
        if fulfilled.has(&peer, REQ_VERIFY_REPLY, now) {
            warn!(%peer, "peer asked for verification again too soon");
            return Err(20);
        }
        let block_hash = match chain.block_hash(mnv.block_height) {
            Ok(h) => h,
            Err(ChainError::Busy) => return Ok(None),
            Err(_) => {
                warn!(height = mnv.block_height, "verify request for unknown block");
                return Ok(None);
            }
        };
        let mut reply = mnv;
        reply.addr = local.service;
        reply.sign_reply(&local.keypair, &block_hash);
        fulfilled.add(peer, REQ_VERIFY_REPLY, now);
        Ok(Some(reply))
    }

    /// Stufe 2 eingehend: die Antwort auf eine Challenge, die wir gestellt
    /// haben. Bei Erfolg wird der Broadcast (Stufe 3) signiert und relayed.
    pub fn process_verify_reply(
        &mut self,
        peer: NetAddress,
        mnv: Verification,
        local: Option<&LocalOperator>,
        chain: &dyn ChainView,
        fulfilled: &mut FulfilledRequestCache,
        now: i64,
    ) -> Result<(), u32> {
        // haben wir überhaupt gefragt?
        if !fulfilled.has(&peer, REQ_VERIFY_REQUEST, now) {
            warn!(%peer, "unrequested verify reply");
            return Err(20);
        }
        let asked = match self.we_asked_for_verification.get(&peer) {
            Some(asked) => asked.clone(),
            None => {
                warn!(%peer, "no stored verify request");
                return Err(20);
            }
        };
        if asked.nonce != mnv.nonce {
            warn!(%peer, requested = asked.nonce, received = mnv.nonce, "wrong verify nonce");
            let _ = self.punish_address(&peer);
            return Err(20);
        }
        if asked.block_height != mnv.block_height {
            warn!(%peer, "wrong verify block height");
            let _ = self.punish_address(&peer);
            return Err(20);
        }
        let block_hash = match chain.block_hash(mnv.block_height) {
            Ok(h) => h,
            Err(ChainError::Busy) => return Ok(()),
            Err(_) => return Ok(()),
        };
        if fulfilled.has(&peer, REQ_VERIFY_DONE, now) {
            warn!(%peer, "address already verified recently");
            return Err(20);
        }

        let mut real: Option<OutPoint> = None;
        let mut to_ban: Vec<OutPoint> = Vec::new();
        for (outpoint, record) in self.records().iter() {
            if record.addr != peer {
                continue;
            }
            if mnv.verify_reply_sig(&record.pk_operator, &block_hash) {
                real = Some(*outpoint);
            } else {
                to_ban.push(*outpoint);
            }
        }

        // falsche Signaturen kosten Score, auch wenn am Ende niemand an
        // dieser Adresse bestehen bleibt
        let banned = to_ban.len();
        for outpoint in &to_ban {
            if let Some(record) = self.records_mut().get_mut(outpoint) {
                record.increase_pose_ban_score();
                debug!(operator = %outpoint, score = record.pose_ban_score, "pose score increased");
            }
        }

        let Some(real_outpoint) = real else {
            warn!(%peer, "no real operator found for address");
            return Err(20);
        };

        let mut real_vin = None;
        let mut real_addr = None;
        if let Some(record) = self.records_mut().get_mut(&real_outpoint) {
            if !record.is_pose_verified() {
                record.decrease_pose_ban_score();
            }
            real_vin = Some(record.vin.clone());
            real_addr = Some(record.addr);
        }
        fulfilled.add(peer, REQ_VERIFY_DONE, now);
        info!(operator = %real_outpoint, %peer, "verified operator address");

        // Broadcast nur als aktivierter Operator
        if let (Some(local), Some(vin1), Some(addr)) = (local, real_vin, real_addr) {
            if !local.vin.is_unset() {
                let mut bcast = mnv;
                bcast.addr = addr;
                bcast.vin1 = vin1;
                bcast.vin2 = local.vin.clone();
                bcast.sign_broadcast(&local.keypair, &block_hash);
                let _ = self.we_asked_for_verification.insert(peer, bcast.clone());
                let _ = self.seen_verification.insert(bcast.digest(), bcast.clone());
                self.push_event(RegistryEvent::RelayVerification(bcast));
            }
        }

        if banned > 0 {
            info!(%peer, count = banned, "pose score increased for fake operators");
        }
        Ok(())
    }

    /// Erhöht den PoSe-Score aller Einträge an einer Adresse (Challenge
    /// fehlgeschlagen oder unbeantwortet). Liefert die Trefferzahl.
    pub(crate) fn punish_address(&mut self, addr: &NetAddress) -> usize {
        let targets: Vec<OutPoint> = self
            .records()
            .values()
            .filter(|r| r.addr == *addr)
            .map(|r| r.vin.prev_out)
            .collect();
        let count = targets.len();
        for outpoint in targets {
            if let Some(record) = self.records_mut().get_mut(&outpoint) {
                record.increase_pose_ban_score();
                debug!(operator = %outpoint, score = record.pose_ban_score, "pose score increased");
            }
        }
        count
    }

    /// Stufe 3 eingehend: ein fremder Verifier bürgt für einen Operator.
    pub fn process_verify_broadcast(
        &mut self,
        peer: NetAddress,
        mnv: Verification,
        chain: &dyn ChainView,
    ) -> Result<(), u32> {
        let hash = mnv.digest();
        if self.seen_verification.contains_key(&hash) {
            return Ok(());
        }
        let _ = self.seen_verification.insert(hash, mnv.clone());

        let Ok(tip) = chain.tip() else {
            return Ok(());
        };
        // Historie interessiert nicht
        if mnv.block_height < tip.height - MAX_POSE_BLOCKS {
            debug!(%peer, height = mnv.block_height, "outdated verify broadcast");
            return Ok(());
        }
        if mnv.vin1.prev_out == mnv.vin2.prev_out {
            // Selbstverifikation ist ein Täuschungsversuch
            warn!(%peer, operator = %mnv.vin1.prev_out, "self-verification attempt");
            return Err(100);
        }
        let block_hash = match chain.block_hash(mnv.block_height) {
            Ok(h) => h,
            Err(_) => return Ok(()),
        };

        // der Bürge muss selbst in den Top-Rängen stehen
        let rank = self.rank_of(
            chain,
            &mnv.vin2.prev_out,
            mnv.block_height,
            MIN_POSE_PROTO_VERSION,
            true,
        );
        match rank {
            None => {
                debug!(operator = %mnv.vin2.prev_out, "cannot rank verifier");
                return Ok(());
            }
            Some(r) if r > MAX_POSE_RANK => {
                debug!(operator = %mnv.vin2.prev_out, rank = r, "verifier not in top ranks");
                return Ok(());
            }
            Some(_) => {}
        }

        let Some(record1) = self.records().get(&mnv.vin1.prev_out) else {
            warn!(operator = %mnv.vin1.prev_out, "verify broadcast for unknown prover");
            return Ok(());
        };
        let Some(record2) = self.records().get(&mnv.vin2.prev_out) else {
            warn!(operator = %mnv.vin2.prev_out, "verify broadcast from unknown verifier");
            return Ok(());
        };
        if record1.addr != mnv.addr {
            warn!(%peer, "verify broadcast addr mismatch");
            return Ok(());
        }
        if !mnv.verify_reply_sig(&record1.pk_operator, &block_hash) {
            warn!("verify broadcast with bad prover signature");
            return Ok(());
        }
        if !mnv.verify_broadcast_sig(&record2.pk_operator, &block_hash) {
            warn!("verify broadcast with bad verifier signature");
            return Ok(());
        }

        if let Some(record) = self.records_mut().get_mut(&mnv.vin1.prev_out) {
            if !record.is_pose_verified() {
                record.decrease_pose_ban_score();
            }
        }
        info!(operator = %mnv.vin1.prev_out, addr = %mnv.addr, "operator verified via broadcast");
        self.push_event(RegistryEvent::RelayVerification(mnv.clone()));

        let same_addr: Vec<OutPoint> = self
            .records()
            .values()
            .filter(|r| r.addr == mnv.addr && r.vin.prev_out != mnv.vin1.prev_out)
            .map(|r| r.vin.prev_out)
            .collect();
        let count = same_addr.len();
        for outpoint in same_addr {
            if let Some(record) = self.records_mut().get_mut(&outpoint) {
                record.increase_pose_ban_score();
                debug!(operator = %outpoint, score = record.pose_ban_score, "pose score increased");
            }
        }
        if count > 0 {
            info!(addr = %mnv.addr, count, "pose score increased for fake operators");
        }
        Ok(())
    }

    /// Razzia über Adressduplikate: innerhalb einer Adressgruppe wird bei
    /// vorhandenem verifizierten Eintrag jeder andere gebannt. Ohne
    /// verifizierten Eintrag passiert nichts.
    pub fn check_same_addr(&mut self, sync: SyncFlags) {
        if !sync.fully_synced || self.records().is_empty() {
            return;
        }

        let mut sorted: Vec<(NetAddress, OutPoint, bool)> = self
            .records()
            .values()
            .filter(|r| r.is_enabled() || r.is_pre_enabled())
            .map(|r| (r.addr, r.vin.prev_out, r.is_pose_verified()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut to_ban: Vec<OutPoint> = Vec::new();
        let mut prev_addr: Option<NetAddress> = None;
        let mut verified_in_run: Option<OutPoint> = None;
        let mut run: Vec<OutPoint> = Vec::new();

        for (addr, outpoint, verified) in sorted {
            if prev_addr != Some(addr) {
                // Lauf abschließen
                if let Some(keeper) = verified_in_run {
                    to_ban.extend(run.iter().filter(|o| **o != keeper));
                }
                run.clear();
                verified_in_run = None;
                prev_addr = Some(addr);
            }
            run.push(outpoint);
            if verified && verified_in_run.is_none() {
                verified_in_run = Some(outpoint);
            }
        }
        if let Some(keeper) = verified_in_run {
            to_ban.extend(run.iter().filter(|o| **o != keeper));
        }

        for outpoint in to_ban {
            if let Some(record) = self.records_mut().get_mut(&outpoint) {
                info!(operator = %outpoint, "increasing pose ban score for duplicate address");
                record.increase_pose_ban_score();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OperatorRecord;
    use crate::RegistryOptions;
    use sn_chain::{InMemoryChain, Utxo};
    use sn_crypto::{sha256_32, OperatorKeypair};
    use sn_types::{
        payout_script, Announce, ChainParams, Heartbeat, OperatorState, PubKeyBytes, SigBytes,
        TxIn, COIN, PROTOCOL_VERSION,
    };

    fn kp(seed: &[u8]) -> OperatorKeypair {
        OperatorKeypair::from_secret_bytes(&sha256_32(seed)).expect("seckey")
    }

    struct Harness {
        registry: OperatorRegistry,
        chain: InMemoryChain,
        now: i64,
    }

    fn harness() -> Harness {
        Harness {
            registry: OperatorRegistry::new(RegistryOptions::new(ChainParams::regtest())),
            chain: InMemoryChain::with_synthetic_blocks(ChainParams::regtest(), 300, 1_000_000),
            now: 2_000_000,
        }
    }

    fn seed_record(h: &mut Harness, tag: u8, addr: NetAddress) -> (OutPoint, OperatorKeypair) {
        let ko = kp(&[b'o', tag]);
        let kc = kp(&[b'c', tag]);
        let op = sn_types::OutPoint::new(sha256_32(&[b'v', tag]), 0);
        h.chain
            .set_utxo(
                op,
                Utxo {
                    value: 2500 * COIN,
                    height: 50,
                    script: payout_script(&kc.key_id()),
                },
            )
            .expect("utxo");
        let mut hb = Heartbeat::new(
            TxIn::from_outpoint(op),
            InMemoryChain::synthetic_hash(290),
            h.now,
        );
        hb.sign(&ko, h.now);
        let mut record = OperatorRecord::from(&Announce {
            vin: TxIn::from_outpoint(op),
            addr,
            pk_collateral: PubKeyBytes::from_keypair(&kc),
            pk_operator: PubKeyBytes::from_keypair(&ko),
            sig: SigBytes::default(),
            sig_time: h.now - 2 * MIN_MNP_SECONDS,
            protocol_version: PROTOCOL_VERSION,
            last_heartbeat: hb,
            active_state: OperatorState::Enabled,
            recovery: false,
        });
        record.state = OperatorState::Enabled;
        let _ = h.registry.records_mut().insert(op, record);
        (op, ko)
    }

    fn synced() -> SyncFlags {
        SyncFlags {
            blockchain_synced: true,
            list_synced: true,
            fully_synced: true,
        }
    }

    #[test]
    fn five_bad_replies_ban_an_operator() {
        let mut h = harness();
        let addr = NetAddress::new([7, 7, 7, 7], 8884);
        let (victim, _ko) = seed_record(&mut h, 1, addr);
        let local_kp = kp(b"pose-local");
        let (local_op, _) = seed_record(&mut h, 2, NetAddress::new([7, 7, 7, 8], 8884));
        // lokaler Operator gehört uns nicht wirklich; nur vin zählt hier
        let local = LocalOperator {
            vin: TxIn::from_outpoint(local_op),
            service: NetAddress::new([7, 7, 7, 8], 8884),
            keypair: local_kp,
        };
        let mut fulfilled = FulfilledRequestCache::new();
        let wrong_key = kp(b"pose-wrong");

        for round in 0..POSE_BAN_MAX_SCORE {
            let now = h.now + round as i64 * 120;
            // Anfrage vorbereiten wie do_verification_step
            fulfilled.add(addr, REQ_VERIFY_REQUEST, now);
            let mut mnv = Verification::request(addr, 1000 + round as u32, 299);
            let _ = h
                .registry
                .we_asked_for_verification
                .insert(addr, mnv.clone());
            // Prover antwortet mit fremdem Schlüssel
            let block_hash = h.chain.block_hash(299).expect("hash");
            mnv.sign_reply(&wrong_key, &block_hash);
            let res = h.registry.process_verify_reply(
                addr,
                mnv,
                Some(&local),
                &h.chain,
                &mut fulfilled,
                now,
            );
            assert_eq!(res, Err(20));
            fulfilled.remove(&addr, REQ_VERIFY_REQUEST);
            fulfilled.remove(&addr, REQ_VERIFY_DONE);
        }

        let record = h.registry.records().get(&victim).expect("record");
        assert_eq!(record.pose_ban_score, POSE_BAN_MAX_SCORE);
        // Check kippt den Eintrag jetzt in den Ban
        h.registry.check_all(&h.chain, h.now + 600, synced());
        let record = h.registry.records().get(&victim).expect("record");
        assert_eq!(record.state, OperatorState::PoseBan);
        assert_eq!(
            record.pose_ban_until_height,
            300 + h.registry.size() as i32
        );
    }

    #[test]
    fn correct_reply_decreases_score_and_emits_broadcast() {
        let mut h = harness();
        let addr = NetAddress::new([9, 9, 9, 9], 8884);
        let (prover, prover_key) = seed_record(&mut h, 3, addr);
        let local_addr = NetAddress::new([9, 9, 9, 10], 8884);
        let (local_outpoint, local_key) = seed_record(&mut h, 4, local_addr);
        let local = LocalOperator {
            vin: TxIn::from_outpoint(local_outpoint),
            service: local_addr,
            keypair: local_key,
        };
        let mut fulfilled = FulfilledRequestCache::new();

        fulfilled.add(addr, REQ_VERIFY_REQUEST, h.now);
        let mut mnv = Verification::request(addr, 424_242, 299);
        let _ = h
            .registry
            .we_asked_for_verification
            .insert(addr, mnv.clone());
        let block_hash = h.chain.block_hash(299).expect("hash");
        mnv.sign_reply(&prover_key, &block_hash);

        let res = h.registry.process_verify_reply(
            addr,
            mnv,
            Some(&local),
            &h.chain,
            &mut fulfilled,
            h.now,
        );
        assert_eq!(res, Ok(()));
        assert_eq!(
            h.registry.records().get(&prover).expect("record").pose_ban_score,
            -1
        );
        assert!(fulfilled.has(&addr, REQ_VERIFY_DONE, h.now));
        let events = h.registry.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, RegistryEvent::RelayVerification(_))));
    }

    #[test]
    fn broadcast_bans_other_records_on_same_address() {
        let mut h = harness();
        let shared = NetAddress::new([3, 3, 3, 3], 8884);
        let (real, real_key) = seed_record(&mut h, 5, shared);
        let (fake, _) = seed_record(&mut h, 6, shared);
        let (verifier, verifier_key) = seed_record(&mut h, 7, NetAddress::new([3, 3, 3, 4], 8884));

        let block_hash = h.chain.block_hash(295).expect("hash");
        let mut mnv = Verification::request(shared, 7, 295);
        mnv.vin1 = TxIn::from_outpoint(real);
        mnv.vin2 = TxIn::from_outpoint(verifier);
        mnv.sign_reply(&real_key, &block_hash);
        mnv.sign_broadcast(&verifier_key, &block_hash);

        // Bürge muss Top-Rank sein: bei 3 Einträgen immer erfüllt
        let res = h.registry.process_verify_broadcast(
            NetAddress::new([5, 5, 5, 5], 8884),
            mnv,
            &h.chain,
        );
        assert_eq!(res, Ok(()));
        assert_eq!(h.registry.records().get(&real).expect("r").pose_ban_score, -1);
        assert_eq!(h.registry.records().get(&fake).expect("r").pose_ban_score, 1);
    }

    #[test]
    fn self_verification_is_heavily_punished() {
        let mut h = harness();
        let shared = NetAddress::new([4, 4, 4, 4], 8884);
        let (real, real_key) = seed_record(&mut h, 8, shared);
        let block_hash = h.chain.block_hash(295).expect("hash");
        let mut mnv = Verification::request(shared, 9, 295);
        mnv.vin1 = TxIn::from_outpoint(real);
        mnv.vin2 = TxIn::from_outpoint(real);
        mnv.sign_reply(&real_key, &block_hash);
        mnv.sign_broadcast(&real_key, &block_hash);
        let res = h.registry.process_verify_broadcast(
            NetAddress::new([5, 5, 5, 6], 8884),
            mnv,
            &h.chain,
        );
        assert_eq!(res, Err(100));
    }

    #[test]
    fn same_addr_sweep_bans_only_with_verified_witness() {
        let mut h = harness();
        let shared = NetAddress::new([6, 6, 6, 6], 8884);
        let (a, _) = seed_record(&mut h, 9, shared);
        let (b, _) = seed_record(&mut h, 10, shared);

        // niemand verifiziert: keine Banns
        h.registry.check_same_addr(synced());
        assert_eq!(h.registry.records().get(&a).expect("a").pose_ban_score, 0);
        assert_eq!(h.registry.records().get(&b).expect("b").pose_ban_score, 0);

        // a gilt als verifiziert: b wird bestraft
        if let Some(rec) = h.registry.records_mut().get_mut(&a) {
            rec.pose_ban_score = -POSE_BAN_MAX_SCORE;
        }
        h.registry.check_same_addr(synced());
        assert_eq!(h.registry.records().get(&b).expect("b").pose_ban_score, 1);
        assert_eq!(
            h.registry.records().get(&a).expect("a").pose_ban_score,
            -POSE_BAN_MAX_SCORE
        );
    }

    #[test]
    fn verify_reply_requires_matching_nonce() {
        let mut h = harness();
        let addr = NetAddress::new([8, 8, 8, 9], 8884);
        let (_, prover_key) = seed_record(&mut h, 11, addr);
        let mut fulfilled = FulfilledRequestCache::new();
        fulfilled.add(addr, REQ_VERIFY_REQUEST, h.now);
        let asked = Verification::request(addr, 111, 299);
        let _ = h.registry.we_asked_for_verification.insert(addr, asked);

        let block_hash = h.chain.block_hash(299).expect("hash");
        let mut mnv = Verification::request(addr, 222, 299);
        mnv.sign_reply(&prover_key, &block_hash);
        let res = h
            .registry
            .process_verify_reply(addr, mnv, None, &h.chain, &mut fulfilled, h.now);
        assert_eq!(res, Err(20));
    }
}
