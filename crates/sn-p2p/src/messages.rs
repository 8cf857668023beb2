// SPDX-License-Identifier: AGPL-3.0-only

//! Nachrichtenformate und Codec-Implementierungen des Service-Node-Protokolls.
//! Die Tags sind Teil des Wire-Formats und dürfen nicht umsortiert werden.

use sn_codec::{CodecError, Decodable, Encodable};
use sn_types::{Announce, Heartbeat, PaymentVote, SigBytes, TxIn, Verification};
use std::io::{Read, Write};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeMessage {
    Announce(Announce),
    Heartbeat(Heartbeat),
    Verify(Verification),
    PaymentVote(PaymentVote),
    /// Listen-Anfrage; unbesetzter `vin` bedeutet Volliste
    ListRequest { vin: TxIn },
    /// Anfrage nach Auszahlungsstimmen bis zum Speicherlimit
    PaymentSync { limit: i32 },
    SyncStatusCount { item: i32, count: i32 },
    GetSporks,
    Spork(SporkPayload),
    /// Anstoß einer Governance-Synchronisation (Objekte folgen extern)
    GovernanceSync,
}

/// Spork-Nutzlast; der Kern reicht sie nur für die Sync-Phase durch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SporkPayload {
    pub id: i32,
    pub value: i64,
    pub sig_time: i64,
    pub sig: SigBytes,
}

impl Encodable for SporkPayload {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.id.encode(w)?;
        self.value.encode(w)?;
        self.sig_time.encode(w)?;
        self.sig.encode(w)
    }
    fn encoded_len(&self) -> usize {
        4 + 8 + 8 + self.sig.encoded_len()
    }
}
impl Decodable for SporkPayload {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            id: i32::decode(r)?,
            value: i64::decode(r)?,
            sig_time: i64::decode(r)?,
            sig: SigBytes::decode(r)?,
        })
    }
}

// Tags
const TAG_ANNOUNCE: u8 = 1;
const TAG_HEARTBEAT: u8 = 2;
const TAG_VERIFY: u8 = 3;
const TAG_PAYMENT_VOTE: u8 = 4;
const TAG_LIST_REQ: u8 = 5;
const TAG_PAYMENT_SYNC: u8 = 6;
const TAG_SYNC_STATUS: u8 = 7;
const TAG_GET_SPORKS: u8 = 8;
const TAG_SPORK: u8 = 9;
const TAG_GOV_SYNC: u8 = 10;

impl Encodable for NodeMessage {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        match self {
            NodeMessage::Announce(a) => {
                TAG_ANNOUNCE.encode(w)?;
                a.encode(w)
            }
            NodeMessage::Heartbeat(h) => {
                TAG_HEARTBEAT.encode(w)?;
                h.encode(w)
            }
            NodeMessage::Verify(v) => {
                TAG_VERIFY.encode(w)?;
                v.encode(w)
            }
            NodeMessage::PaymentVote(v) => {
                TAG_PAYMENT_VOTE.encode(w)?;
                v.encode(w)
            }
            NodeMessage::ListRequest { vin } => {
                TAG_LIST_REQ.encode(w)?;
                vin.encode(w)
            }
            NodeMessage::PaymentSync { limit } => {
                TAG_PAYMENT_SYNC.encode(w)?;
                limit.encode(w)
            }
            NodeMessage::SyncStatusCount { item, count } => {
                TAG_SYNC_STATUS.encode(w)?;
                item.encode(w)?;
                count.encode(w)
            }
            NodeMessage::GetSporks => TAG_GET_SPORKS.encode(w),
            NodeMessage::Spork(s) => {
                TAG_SPORK.encode(w)?;
                s.encode(w)
            }
            NodeMessage::GovernanceSync => TAG_GOV_SYNC.encode(w),
        }
    }
    fn encoded_len(&self) -> usize {
        1 + match self {
            NodeMessage::Announce(a) => a.encoded_len(),
            NodeMessage::Heartbeat(h) => h.encoded_len(),
            NodeMessage::Verify(v) => v.encoded_len(),
            NodeMessage::PaymentVote(v) => v.encoded_len(),
            NodeMessage::ListRequest { vin } => vin.encoded_len(),
            NodeMessage::PaymentSync { .. } => 4,
            NodeMessage::SyncStatusCount { .. } => 8,
            NodeMessage::GetSporks => 0,
            NodeMessage::Spork(s) => s.encoded_len(),
            NodeMessage::GovernanceSync => 0,
        }
    }
}

impl Decodable for NodeMessage {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        let tag = u8::decode(r)?;
        match tag {
            TAG_ANNOUNCE => Ok(NodeMessage::Announce(Announce::decode(r)?)),
            TAG_HEARTBEAT => Ok(NodeMessage::Heartbeat(Heartbeat::decode(r)?)),
            TAG_VERIFY => Ok(NodeMessage::Verify(Verification::decode(r)?)),
            TAG_PAYMENT_VOTE => Ok(NodeMessage::PaymentVote(PaymentVote::decode(r)?)),
            TAG_LIST_REQ => Ok(NodeMessage::ListRequest {
                vin: TxIn::decode(r)?,
            }),
            TAG_PAYMENT_SYNC => Ok(NodeMessage::PaymentSync {
                limit: i32::decode(r)?,
            }),
            TAG_SYNC_STATUS => Ok(NodeMessage::SyncStatusCount {
                item: i32::decode(r)?,
                count: i32::decode(r)?,
            }),
            TAG_GET_SPORKS => Ok(NodeMessage::GetSporks),
            TAG_SPORK => Ok(NodeMessage::Spork(SporkPayload::decode(r)?)),
            TAG_GOV_SYNC => Ok(NodeMessage::GovernanceSync),
            _ => Err(CodecError::InvalidTag(tag)),
        }
    }
}

// ============================
// Inventory
// ============================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvType {
    Announce,
    Heartbeat,
    Verify,
    PaymentVote,
}

impl InvType {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Announce => 1,
            Self::Heartbeat => 2,
            Self::Verify => 3,
            Self::PaymentVote => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Announce),
            2 => Some(Self::Heartbeat),
            3 => Some(Self::Verify),
            4 => Some(Self::PaymentVote),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inv {
    pub ty: InvType,
    pub hash: [u8; 32],
}

impl Inv {
    pub fn new(ty: InvType, hash: [u8; 32]) -> Self {
        Self { ty, hash }
    }
}

impl Encodable for Inv {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.ty.as_u8().encode(w)?;
        self.hash.encode(w)
    }
    fn encoded_len(&self) -> usize {
        1 + 32
    }
}
impl Decodable for Inv {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        let raw = u8::decode(r)?;
        let ty = InvType::from_u8(raw).ok_or(CodecError::InvalidTag(raw))?;
        Ok(Self {
            ty,
            hash: <[u8; 32]>::decode(r)?,
        })
    }
}
