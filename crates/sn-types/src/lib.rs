// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::todo,
    clippy::unimplemented
)]

use sn_codec::{CodecError, Decodable, Encodable};
use sn_crypto::{
    key_id, sha256_32, sha256d_32, sign_message, verify_message, Hash32, KeyId, OperatorKeypair,
    ScoreU256,
};
use std::io::{Read, Write};

pub type Amount = u64;
/// kleinste Einheit (1e-8)
pub const COIN: Amount = 100_000_000;

/// aktuelle Protokollversion dieses Teilnehmers
pub const PROTOCOL_VERSION: i32 = 70208;

// ============================
// Netzadresse (IPv4:Port)
// ============================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetAddress {
    pub ip: [u8; 4],
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip, port }
    }

    pub fn is_unset(&self) -> bool {
        self.ip == [0u8; 4] && self.port == 0
    }

    pub fn is_local(&self) -> bool {
        let [a, ..] = self.ip;
        a == 127 || self.ip == [0, 0, 0, 0]
    }

    /// RFC1918-Bereiche (privat)
    pub fn is_rfc1918(&self) -> bool {
        let [a, b, ..] = self.ip;
        a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
    }

    pub fn is_routable(&self) -> bool {
        let [a, b, ..] = self.ip;
        if self.is_local() || self.is_rfc1918() {
            return false;
        }
        // Link-local, Multicast, reserviert
        !((a == 169 && b == 254) || a >= 224 || a == 0)
    }
}

impl core::fmt::Display for NetAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let [a, b, c, d] = self.ip;
        write!(f, "{a}.{b}.{c}.{d}:{}", self.port)
    }
}

impl Encodable for NetAddress {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.ip.encode(w)?;
        self.port.encode(w)
    }
    fn encoded_len(&self) -> usize {
        4 + 2
    }
}
impl Decodable for NetAddress {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            ip: <[u8; 4]>::decode(r)?,
            port: u16::decode(r)?,
        })
    }
}

// ============================
// OutPoint / TxIn
// ============================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutPoint {
    pub txid: Hash32,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash32, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl core::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Kurzform "txid-vout"; fließt in signierte Nachrichten ein und ist
        // damit Teil des Protokolls.
        write!(f, "{}-{}", hex::encode(self.txid), self.vout)
    }
}

impl Encodable for OutPoint {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.txid.encode(w)?;
        self.vout.encode(w)
    }
    fn encoded_len(&self) -> usize {
        32 + 4
    }
}
impl Decodable for OutPoint {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            txid: <[u8; 32]>::decode(r)?,
            vout: u32::decode(r)?,
        })
    }
}

/// Collateral-Input: Outpoint mit leerem scriptSig und Sequenznummer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Default for TxIn {
    fn default() -> Self {
        Self {
            prev_out: OutPoint::default(),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }
    }
}

impl TxIn {
    pub fn from_outpoint(prev_out: OutPoint) -> Self {
        Self {
            prev_out,
            ..Default::default()
        }
    }

    pub fn is_unset(&self) -> bool {
        *self == TxIn::default()
    }
}

impl core::fmt::Display for TxIn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // ebenfalls protokollrelevant (Heartbeat-Signaturtext)
        write!(f, "TxIn({}, scriptSig=)", self.prev_out)
    }
}

impl Encodable for TxIn {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.prev_out.encode(w)?;
        self.script_sig.encode(w)?;
        self.sequence.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.prev_out.encoded_len() + self.script_sig.encoded_len() + 4
    }
}
impl Decodable for TxIn {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            prev_out: OutPoint::decode(r)?,
            script_sig: Vec::<u8>::decode(r)?,
            sequence: u32::decode(r)?,
        })
    }
}

// ============================
// Schlüssel- und Signatur-Bytes
// ============================

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubKeyBytes(pub Vec<u8>);

impl PubKeyBytes {
    pub fn from_keypair(kp: &OperatorKeypair) -> Self {
        Self(kp.public_bytes().to_vec())
    }

    pub fn id(&self) -> KeyId {
        key_id(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Encodable for PubKeyBytes {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.0.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.0.encoded_len()
    }
}
impl Decodable for PubKeyBytes {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self(Vec::<u8>::decode(r)?))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SigBytes(pub Vec<u8>);

impl SigBytes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl Encodable for SigBytes {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.0.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.0.encoded_len()
    }
}
impl Decodable for SigBytes {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self(Vec::<u8>::decode(r)?))
    }
}

// ============================
// Auszahlungs-Script (P2PKH)
// ============================

pub const PAYOUT_SCRIPT_LEN: usize = 25;

/// Standard-P2PKH-Script für eine Key-ID.
pub fn payout_script(id: &KeyId) -> Vec<u8> {
    let mut s = Vec::with_capacity(PAYOUT_SCRIPT_LEN);
    s.push(0x76); // OP_DUP
    s.push(0xa9); // OP_HASH160
    s.push(0x14); // push 20
    s.extend_from_slice(id);
    s.push(0x88); // OP_EQUALVERIFY
    s.push(0xac); // OP_CHECKSIG
    s
}

// ============================
// Operator-Zustand
// ============================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OperatorState {
    PreEnabled,
    #[default]
    Enabled,
    Expired,
    OutpointSpent,
    UpdateRequired,
    WatchdogExpired,
    NewStartRequired,
    PoseBan,
}

impl OperatorState {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::PreEnabled => 0,
            Self::Enabled => 1,
            Self::Expired => 2,
            Self::OutpointSpent => 3,
            Self::UpdateRequired => 4,
            Self::WatchdogExpired => 5,
            Self::NewStartRequired => 6,
            Self::PoseBan => 7,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::PreEnabled),
            1 => Some(Self::Enabled),
            2 => Some(Self::Expired),
            3 => Some(Self::OutpointSpent),
            4 => Some(Self::UpdateRequired),
            5 => Some(Self::WatchdogExpired),
            6 => Some(Self::NewStartRequired),
            7 => Some(Self::PoseBan),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreEnabled => "PRE_ENABLED",
            Self::Enabled => "ENABLED",
            Self::Expired => "EXPIRED",
            Self::OutpointSpent => "OUTPOINT_SPENT",
            Self::UpdateRequired => "UPDATE_REQUIRED",
            Self::WatchdogExpired => "WATCHDOG_EXPIRED",
            Self::NewStartRequired => "NEW_START_REQUIRED",
            Self::PoseBan => "POSE_BAN",
        }
    }
}

impl core::fmt::Display for OperatorState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Encodable for OperatorState {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.as_u8().encode(w)
    }
    fn encoded_len(&self) -> usize {
        1
    }
}
impl Decodable for OperatorState {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        let v = u8::decode(r)?;
        Self::from_u8(v).ok_or(CodecError::InvalidTag(v))
    }
}

// ============================
// Heartbeat (Liveness-Ping)
// ============================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub vin: TxIn,
    pub block_hash: Hash32,
    pub sig_time: i64,
    pub sig: SigBytes,
}

impl Heartbeat {
    pub fn new(vin: TxIn, block_hash: Hash32, now: i64) -> Self {
        Self {
            vin,
            block_hash,
            sig_time: now,
            sig: SigBytes::default(),
        }
    }

    /// leerer Platzhalter (kein Ping bekannt)
    pub fn is_empty(&self) -> bool {
        *self == Heartbeat::default()
    }

    pub fn signed_message(&self) -> String {
        format!(
            "{}{}{}",
            self.vin,
            hex::encode(self.block_hash),
            self.sig_time
        )
    }

    pub fn sign(&mut self, kp_operator: &OperatorKeypair, now: i64) {
        self.sig_time = now;
        let msg = self.signed_message();
        self.sig = SigBytes(sign_message(msg.as_bytes(), kp_operator).to_vec());
    }

    pub fn verify_sig(&self, pk_operator: &PubKeyBytes) -> bool {
        verify_message(&pk_operator.0, &self.sig.0, self.signed_message().as_bytes())
    }

    pub fn digest(&self) -> Hash32 {
        digest_encodable(self)
    }
}

impl Encodable for Heartbeat {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.vin.encode(w)?;
        self.block_hash.encode(w)?;
        self.sig_time.encode(w)?;
        self.sig.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.vin.encoded_len() + 32 + 8 + self.sig.encoded_len()
    }
}
impl Decodable for Heartbeat {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            vin: TxIn::decode(r)?,
            block_hash: <[u8; 32]>::decode(r)?,
            sig_time: i64::decode(r)?,
            sig: SigBytes::decode(r)?,
        })
    }
}

// ============================
// Announce (signierte Operator-Ankündigung)
// ============================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Announce {
    pub vin: TxIn,
    pub addr: NetAddress,
    pub pk_collateral: PubKeyBytes,
    pub pk_operator: PubKeyBytes,
    pub sig: SigBytes,
    pub sig_time: i64,
    pub protocol_version: i32,
    pub last_heartbeat: Heartbeat,
    pub active_state: OperatorState,
    /// lokal gesetztes Recovery-Flag, nicht Teil der Kodierung
    pub recovery: bool,
}

impl Announce {
    pub fn signed_message(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.sig_time,
            hex::encode(self.pk_collateral.id()),
            hex::encode(self.pk_operator.id()),
            self.protocol_version
        )
    }

    pub fn sign(&mut self, kp_collateral: &OperatorKeypair, now: i64) {
        self.sig_time = now;
        let msg = self.signed_message();
        self.sig = SigBytes(sign_message(msg.as_bytes(), kp_collateral).to_vec());
    }

    pub fn verify_sig(&self) -> bool {
        verify_message(
            &self.pk_collateral.0,
            &self.sig.0,
            self.signed_message().as_bytes(),
        )
    }

    /// Identitäts-Hash: deckt nur vin, Collateral-Key und sig_time ab.
    /// Ein aktualisierter eingebetteter Heartbeat ändert den Hash nicht,
    /// dadurch bleibt die Duplikat-Erkennung über Updates hinweg stabil.
    pub fn digest(&self) -> Hash32 {
        let mut buf = Vec::with_capacity(self.vin.encoded_len() + self.pk_collateral.encoded_len() + 8);
        if self.vin.encode(&mut buf).is_err()
            || self.pk_collateral.encode(&mut buf).is_err()
            || self.sig_time.encode(&mut buf).is_err()
        {
            debug_assert!(false, "encode to Vec<u8> should not fail");
        }
        sha256d_32(&buf)
    }
}

impl Encodable for Announce {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.vin.encode(w)?;
        self.addr.encode(w)?;
        self.pk_collateral.encode(w)?;
        self.pk_operator.encode(w)?;
        self.sig.encode(w)?;
        self.sig_time.encode(w)?;
        self.protocol_version.encode(w)?;
        self.last_heartbeat.encode(w)?;
        self.active_state.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.vin.encoded_len()
            + self.addr.encoded_len()
            + self.pk_collateral.encoded_len()
            + self.pk_operator.encoded_len()
            + self.sig.encoded_len()
            + 8
            + 4
            + self.last_heartbeat.encoded_len()
            + 1
    }
}
impl Decodable for Announce {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            vin: TxIn::decode(r)?,
            addr: NetAddress::decode(r)?,
            pk_collateral: PubKeyBytes::decode(r)?,
            pk_operator: PubKeyBytes::decode(r)?,
            sig: SigBytes::decode(r)?,
            sig_time: i64::decode(r)?,
            protocol_version: i32::decode(r)?,
            last_heartbeat: Heartbeat::decode(r)?,
            active_state: OperatorState::decode(r)?,
            recovery: false,
        })
    }
}

// ============================
// PaymentVote
// ============================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaymentVote {
    pub voter: TxIn,
    pub block_height: i32,
    pub payee_script: Vec<u8>,
    pub sig: SigBytes,
}

impl PaymentVote {
    pub fn new(voter: TxIn, block_height: i32, payee_script: Vec<u8>) -> Self {
        Self {
            voter,
            block_height,
            payee_script,
            sig: SigBytes::default(),
        }
    }

    pub fn signed_message(&self) -> String {
        format!(
            "{}{}{}",
            self.voter.prev_out,
            self.block_height,
            hex::encode(&self.payee_script)
        )
    }

    pub fn sign(&mut self, kp_operator: &OperatorKeypair) {
        let msg = self.signed_message();
        self.sig = SigBytes(sign_message(msg.as_bytes(), kp_operator).to_vec());
    }

    pub fn verify_sig(&self, pk_operator: &PubKeyBytes) -> bool {
        verify_message(&pk_operator.0, &self.sig.0, self.signed_message().as_bytes())
    }

    pub fn is_verified(&self) -> bool {
        !self.sig.is_empty()
    }

    pub fn digest(&self) -> Hash32 {
        digest_encodable(self)
    }
}

impl Encodable for PaymentVote {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.voter.encode(w)?;
        self.block_height.encode(w)?;
        self.payee_script.encode(w)?;
        self.sig.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.voter.encoded_len() + 4 + self.payee_script.encoded_len() + self.sig.encoded_len()
    }
}
impl Decodable for PaymentVote {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            voter: TxIn::decode(r)?,
            block_height: i32::decode(r)?,
            payee_script: Vec::<u8>::decode(r)?,
            sig: SigBytes::decode(r)?,
        })
    }
}

// ============================
// Verification (PoSe-Challenge, drei Stufen)
// ============================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Verification {
    pub addr: NetAddress,
    pub nonce: u32,
    pub block_height: i32,
    pub sig1: SigBytes,
    pub sig2: SigBytes,
    pub vin1: TxIn,
    pub vin2: TxIn,
}

impl Verification {
    pub fn request(addr: NetAddress, nonce: u32, block_height: i32) -> Self {
        Self {
            addr,
            nonce,
            block_height,
            ..Default::default()
        }
    }

    /// Text der Prover-Antwort (Stufe 2)
    pub fn reply_message(&self, block_hash: &Hash32) -> String {
        format!("{}{}{}", self.addr, self.nonce, hex::encode(block_hash))
    }

    /// Text des Verifier-Broadcasts (Stufe 3)
    pub fn broadcast_message(&self, block_hash: &Hash32) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.nonce,
            hex::encode(block_hash),
            self.vin1.prev_out,
            self.vin2.prev_out
        )
    }

    pub fn sign_reply(&mut self, kp_operator: &OperatorKeypair, block_hash: &Hash32) {
        let msg = self.reply_message(block_hash);
        self.sig1 = SigBytes(sign_message(msg.as_bytes(), kp_operator).to_vec());
    }

    pub fn sign_broadcast(&mut self, kp_operator: &OperatorKeypair, block_hash: &Hash32) {
        let msg = self.broadcast_message(block_hash);
        self.sig2 = SigBytes(sign_message(msg.as_bytes(), kp_operator).to_vec());
    }

    pub fn verify_reply_sig(&self, pk_operator: &PubKeyBytes, block_hash: &Hash32) -> bool {
        verify_message(
            &pk_operator.0,
            &self.sig1.0,
            self.reply_message(block_hash).as_bytes(),
        )
    }

    pub fn verify_broadcast_sig(&self, pk_operator: &PubKeyBytes, block_hash: &Hash32) -> bool {
        verify_message(
            &pk_operator.0,
            &self.sig2.0,
            self.broadcast_message(block_hash).as_bytes(),
        )
    }

    pub fn digest(&self) -> Hash32 {
        digest_encodable(self)
    }
}

impl Encodable for Verification {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.addr.encode(w)?;
        self.nonce.encode(w)?;
        self.block_height.encode(w)?;
        self.sig1.encode(w)?;
        self.sig2.encode(w)?;
        self.vin1.encode(w)?;
        self.vin2.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.addr.encoded_len()
            + 4
            + 4
            + self.sig1.encoded_len()
            + self.sig2.encoded_len()
            + self.vin1.encoded_len()
            + self.vin2.encoded_len()
    }
}
impl Decodable for Verification {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            addr: NetAddress::decode(r)?,
            nonce: u32::decode(r)?,
            block_height: i32::decode(r)?,
            sig1: SigBytes::decode(r)?,
            sig2: SigBytes::decode(r)?,
            vin1: TxIn::decode(r)?,
            vin2: TxIn::decode(r)?,
        })
    }
}

// ============================
// BlockPayees (Stimmen-Aggregat pro Höhe)
// ============================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payee {
    pub script: Vec<u8>,
    pub vote_hashes: Vec<Hash32>,
}

impl Payee {
    pub fn new(script: Vec<u8>, first_vote: Hash32) -> Self {
        Self {
            script,
            vote_hashes: vec![first_vote],
        }
    }

    pub fn vote_count(&self) -> usize {
        self.vote_hashes.len()
    }
}

impl Encodable for Payee {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.script.encode(w)?;
        self.vote_hashes.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.script.encoded_len() + self.vote_hashes.encoded_len()
    }
}
impl Decodable for Payee {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            script: Vec::<u8>::decode(r)?,
            vote_hashes: Vec::<Hash32>::decode(r)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockPayees {
    pub height: i32,
    pub payees: Vec<Payee>,
}

impl BlockPayees {
    pub fn new(height: i32) -> Self {
        Self {
            height,
            payees: Vec::new(),
        }
    }

    pub fn add_vote(&mut self, script: &[u8], vote_hash: Hash32) {
        for payee in self.payees.iter_mut() {
            if payee.script == script {
                payee.vote_hashes.push(vote_hash);
                return;
            }
        }
        self.payees.push(Payee::new(script.to_vec(), vote_hash));
    }

    /// Payee mit den meisten Stimmen (None bei leerem Aggregat).
    pub fn best_payee(&self) -> Option<&Payee> {
        self.payees.iter().max_by_key(|p| p.vote_count())
    }

    pub fn has_payee_with_votes(&self, script: &[u8], min_votes: usize) -> bool {
        self.payees
            .iter()
            .any(|p| p.script == script && p.vote_count() >= min_votes)
    }

    pub fn max_votes(&self) -> usize {
        self.payees.iter().map(Payee::vote_count).max().unwrap_or(0)
    }
}

impl Encodable for BlockPayees {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.height.encode(w)?;
        self.payees.encode(w)
    }
    fn encoded_len(&self) -> usize {
        4 + self.payees.encoded_len()
    }
}
impl Decodable for BlockPayees {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            height: i32::decode(r)?,
            payees: Vec::<Payee>::decode(r)?,
        })
    }
}

// ============================
// Deterministischer Auszahlungs-Score
// ============================

/// Score eines Operators relativ zum Seed (Blockhash H-101):
/// |SHA256(seed || (txid + vout)) - SHA256(seed)| als 256-Bit-Distanz.
pub fn operator_score(outpoint: &OutPoint, seed: &Hash32) -> ScoreU256 {
    let aux = ScoreU256::from_le_bytes(&outpoint.txid).wrapping_add_u64(outpoint.vout as u64);

    let hash2 = ScoreU256::from_le_bytes(&sha256_32(seed));

    let mut buf = [0u8; 64];
    for (dst, src) in buf.iter_mut().zip(seed.iter().chain(aux.to_le_bytes().iter())) {
        *dst = *src;
    }
    let hash3 = ScoreU256::from_le_bytes(&sha256_32(&buf));

    hash3.abs_diff(hash2)
}

// ============================
// Netzwerk-Parameter
// ============================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Main,
    Test,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub default_port: u16,
    pub min_confirmations: i32,
    /// Collateral-Stückelung; netzabhängig, nie im Kern hartkodieren
    pub collateral: Amount,
    pub max_tip_age: i64,
}

impl ChainParams {
    pub fn main() -> Self {
        Self {
            network: Network::Main,
            default_port: 8884,
            min_confirmations: 15,
            collateral: 2500 * COIN,
            max_tip_age: 6 * 60 * 60,
        }
    }

    pub fn test() -> Self {
        Self {
            network: Network::Test,
            default_port: 18884,
            min_confirmations: 1,
            collateral: 2500 * COIN,
            max_tip_age: 6 * 60 * 60,
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            default_port: 8888,
            min_confirmations: 1,
            collateral: 2500 * COIN,
            max_tip_age: i64::MAX,
        }
    }

    pub fn is_main(&self) -> bool {
        self.network == Network::Main
    }

    pub fn is_regtest(&self) -> bool {
        self.network == Network::Regtest
    }

    /// Adress-Check für Operatoren: Regtest akzeptiert alles, sonst
    /// routbares IPv4.
    pub fn is_valid_operator_addr(&self, addr: &NetAddress) -> bool {
        self.is_regtest() || addr.is_routable()
    }

    /// Port-Regel: Mainnet nur Default-Port, andere Netze nie Default-Port.
    pub fn is_valid_operator_port(&self, port: u16) -> bool {
        if self.is_regtest() {
            return true;
        }
        if self.is_main() {
            port == self.default_port
        } else {
            port != ChainParams::main().default_port
        }
    }
}

// ============================
// Digest-Helfer
// ============================

fn digest_encodable<T: Encodable>(v: &T) -> Hash32 {
    let mut buf = Vec::with_capacity(v.encoded_len());
    // Encoding in einen Vec kann nur bei OOM scheitern
    if let Err(_e) = v.encode(&mut buf) {
        debug_assert!(false, "encode to Vec<u8> should not fail");
    }
    sha256d_32(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_codec::{decode_from_slice, encode_to_vec};

    fn rt<T: Encodable + Decodable + core::fmt::Debug + PartialEq>(v: &T) -> T {
        let buf = encode_to_vec(v).expect("encode");
        assert_eq!(buf.len(), v.encoded_len());
        decode_from_slice(&buf).expect("decode")
    }

    fn kp(seed: &[u8]) -> OperatorKeypair {
        OperatorKeypair::from_secret_bytes(&sha256_32(seed)).expect("seckey")
    }

    fn sample_outpoint(tag: u8) -> OutPoint {
        OutPoint::new(sha256_32(&[tag]), tag as u32)
    }

    fn sample_heartbeat(tag: u8, now: i64, kp_op: &OperatorKeypair) -> Heartbeat {
        let mut hb = Heartbeat::new(
            TxIn::from_outpoint(sample_outpoint(tag)),
            sha256_32(b"block"),
            now,
        );
        hb.sign(kp_op, now);
        hb
    }

    fn sample_announce(tag: u8, now: i64) -> (Announce, OperatorKeypair, OperatorKeypair) {
        let kc = kp(&[b'c', tag]);
        let ko = kp(&[b'o', tag]);
        let mut ann = Announce {
            vin: TxIn::from_outpoint(sample_outpoint(tag)),
            addr: NetAddress::new([5, 6, 7, tag], 8884),
            pk_collateral: PubKeyBytes::from_keypair(&kc),
            pk_operator: PubKeyBytes::from_keypair(&ko),
            sig: SigBytes::default(),
            sig_time: now,
            protocol_version: PROTOCOL_VERSION,
            last_heartbeat: sample_heartbeat(tag, now, &ko),
            active_state: OperatorState::Enabled,
            recovery: false,
        };
        ann.sign(&kc, now);
        (ann, kc, ko)
    }

    #[test]
    fn roundtrip_all_messages() {
        let now = 1_700_000_000;
        let (ann, _, ko) = sample_announce(1, now);
        assert_eq!(rt(&ann), ann);

        let hb = sample_heartbeat(2, now, &ko);
        assert_eq!(rt(&hb), hb);

        let mut vote = PaymentVote::new(
            TxIn::from_outpoint(sample_outpoint(3)),
            1234,
            payout_script(&[9u8; 20]),
        );
        vote.sign(&ko);
        assert_eq!(rt(&vote), vote);

        let mut mnv = Verification::request(NetAddress::new([1, 2, 3, 4], 8884), 42, 99);
        mnv.vin1 = TxIn::from_outpoint(sample_outpoint(4));
        mnv.vin2 = TxIn::from_outpoint(sample_outpoint(5));
        mnv.sign_reply(&ko, &sha256_32(b"h"));
        mnv.sign_broadcast(&ko, &sha256_32(b"h"));
        assert_eq!(rt(&mnv), mnv);

        let mut bp = BlockPayees::new(77);
        bp.add_vote(&payout_script(&[1u8; 20]), sha256_32(b"v1"));
        bp.add_vote(&payout_script(&[1u8; 20]), sha256_32(b"v2"));
        bp.add_vote(&payout_script(&[2u8; 20]), sha256_32(b"v3"));
        assert_eq!(rt(&bp), bp);
    }

    #[test]
    fn announce_signature_binds_fields() {
        let now = 1_700_000_000;
        let (mut ann, _, _) = sample_announce(7, now);
        assert!(ann.verify_sig());
        ann.protocol_version += 1;
        assert!(!ann.verify_sig());
    }

    #[test]
    fn heartbeat_signature_checks_operator_key() {
        let now = 1_700_000_000;
        let ko = kp(b"hb-op");
        let other = kp(b"hb-other");
        let hb = sample_heartbeat(9, now, &ko);
        assert!(hb.verify_sig(&PubKeyBytes::from_keypair(&ko)));
        assert!(!hb.verify_sig(&PubKeyBytes::from_keypair(&other)));
    }

    #[test]
    fn verification_two_stage_signatures() {
        let ko = kp(b"mnv-op");
        let hash = sha256_32(b"blk");
        let mut mnv = Verification::request(NetAddress::new([9, 9, 9, 9], 8884), 7, 10);
        mnv.sign_reply(&ko, &hash);
        assert!(mnv.verify_reply_sig(&PubKeyBytes::from_keypair(&ko), &hash));
        // Broadcast bindet zusätzlich beide Outpoints
        mnv.vin1 = TxIn::from_outpoint(sample_outpoint(1));
        mnv.vin2 = TxIn::from_outpoint(sample_outpoint(2));
        mnv.sign_broadcast(&ko, &hash);
        assert!(mnv.verify_broadcast_sig(&PubKeyBytes::from_keypair(&ko), &hash));
        let mut tampered = mnv.clone();
        tampered.vin1 = TxIn::from_outpoint(sample_outpoint(3));
        assert!(!tampered.verify_broadcast_sig(&PubKeyBytes::from_keypair(&ko), &hash));
    }

    #[test]
    fn digest_ignores_recovery_flag() {
        let now = 1_700_000_000;
        let (ann, _, _) = sample_announce(11, now);
        let mut flagged = ann.clone();
        flagged.recovery = true;
        assert_eq!(ann.digest(), flagged.digest());
    }

    #[test]
    fn announce_digest_is_identity_stable() {
        let now = 1_700_000_000;
        let (ann, _, ko) = sample_announce(12, now);
        // neuer Heartbeat ändert die Identität nicht ...
        let mut updated = ann.clone();
        updated.last_heartbeat = sample_heartbeat(12, now + 700, &ko);
        assert_eq!(ann.digest(), updated.digest());
        // ... eine neue sig_time schon
        let mut newer = ann.clone();
        newer.sig_time += 1;
        assert_ne!(ann.digest(), newer.digest());
    }

    #[test]
    fn score_is_deterministic_and_spreads() {
        let seed = sha256_32(b"seed");
        let a = operator_score(&sample_outpoint(1), &seed);
        let b = operator_score(&sample_outpoint(1), &seed);
        assert_eq!(a, b);
        assert_ne!(a, operator_score(&sample_outpoint(2), &seed));
        assert_ne!(a, operator_score(&sample_outpoint(1), &sha256_32(b"seed2")));
    }

    #[test]
    fn payout_script_shape() {
        let s = payout_script(&[0xabu8; 20]);
        assert_eq!(s.len(), PAYOUT_SCRIPT_LEN);
        assert_eq!(s.first(), Some(&0x76));
        assert_eq!(s.last(), Some(&0xac));
    }

    #[test]
    fn addr_classification() {
        assert!(!NetAddress::new([127, 0, 0, 1], 8884).is_routable());
        assert!(!NetAddress::new([10, 1, 2, 3], 8884).is_routable());
        assert!(!NetAddress::new([192, 168, 0, 1], 8884).is_routable());
        assert!(!NetAddress::new([172, 16, 0, 1], 8884).is_routable());
        assert!(NetAddress::new([5, 6, 7, 8], 8884).is_routable());
    }

    #[test]
    fn port_rules_per_network() {
        let main = ChainParams::main();
        assert!(main.is_valid_operator_port(8884));
        assert!(!main.is_valid_operator_port(18884));
        let test = ChainParams::test();
        assert!(test.is_valid_operator_port(18884));
        assert!(!test.is_valid_operator_port(8884));
        assert!(ChainParams::regtest().is_valid_operator_port(8884));
    }

    #[test]
    fn outpoint_display_is_short_form() {
        let op = OutPoint::new([0u8; 32], 3);
        let s = op.to_string();
        assert!(s.ends_with("-3"));
        assert_eq!(s.len(), 64 + 2);
    }
}
