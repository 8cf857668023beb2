// SPDX-License-Identifier: AGPL-3.0-only

//! Versionierter Register-Schnappschuss. Ein abweichender Versions-Tag
//! beim Laden verwirft den gesamten Stand und startet mit leerem Register.

use crate::index::OperatorIndex;
use crate::record::OperatorRecord;
use crate::{OperatorRegistry, RecoveryRequest, SeenAnnounce};
use sn_codec::{CodecError, Decodable, Encodable};
use sn_crypto::Hash32;
use sn_types::{Announce, Heartbeat, NetAddress, OutPoint};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::warn;

pub const SERIALIZATION_VERSION: &str = "OperatorRegistry-Version-1";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub version: String,
    pub records: Vec<OperatorRecord>,
    pub asked_us_for_list: BTreeMap<NetAddress, i64>,
    pub we_asked_for_list: BTreeMap<NetAddress, i64>,
    pub we_asked_for_entry: BTreeMap<OutPoint, BTreeMap<NetAddress, i64>>,
    pub recovery_requests: BTreeMap<Hash32, RecoveryRequest>,
    pub recovery_good_replies: BTreeMap<Hash32, Vec<Announce>>,
    pub last_watchdog_vote_time: i64,
    pub dsq_count: i64,
    pub seen_announce: BTreeMap<Hash32, SeenAnnounce>,
    pub seen_heartbeat: BTreeMap<Hash32, Heartbeat>,
    pub index: OperatorIndex,
}

impl Encodable for RegistrySnapshot {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.version.encode(w)?;
        self.records.encode(w)?;
        self.asked_us_for_list.encode(w)?;
        self.we_asked_for_list.encode(w)?;
        self.we_asked_for_entry.encode(w)?;
        self.recovery_requests.encode(w)?;
        self.recovery_good_replies.encode(w)?;
        self.last_watchdog_vote_time.encode(w)?;
        self.dsq_count.encode(w)?;
        self.seen_announce.encode(w)?;
        self.seen_heartbeat.encode(w)?;
        self.index.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.version.encoded_len()
            + self.records.encoded_len()
            + self.asked_us_for_list.encoded_len()
            + self.we_asked_for_list.encoded_len()
            + self.we_asked_for_entry.encoded_len()
            + self.recovery_requests.encoded_len()
            + self.recovery_good_replies.encoded_len()
            + 16
            + self.seen_announce.encoded_len()
            + self.seen_heartbeat.encoded_len()
            + self.index.encoded_len()
    }
}

impl Decodable for RegistrySnapshot {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            version: String::decode(r)?,
            records: Vec::<OperatorRecord>::decode(r)?,
            asked_us_for_list: BTreeMap::decode(r)?,
            we_asked_for_list: BTreeMap::decode(r)?,
            we_asked_for_entry: BTreeMap::decode(r)?,
            recovery_requests: BTreeMap::decode(r)?,
            recovery_good_replies: BTreeMap::decode(r)?,
            last_watchdog_vote_time: i64::decode(r)?,
            dsq_count: i64::decode(r)?,
            seen_announce: BTreeMap::decode(r)?,
            seen_heartbeat: BTreeMap::decode(r)?,
            index: OperatorIndex::decode(r)?,
        })
    }
}

impl OperatorRegistry {
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_parts()
    }

    /// Lädt einen Schnappschuss. Liefert false (und leert das Register),
    /// wenn der Versions-Tag nicht passt.
    pub fn restore(&mut self, snap: RegistrySnapshot) -> bool {
        if snap.version != SERIALIZATION_VERSION {
            warn!(
                found = %snap.version,
                expected = SERIALIZATION_VERSION,
                "registry snapshot version mismatch, starting clean"
            );
            self.clear();
            return false;
        }
        self.restore_parts(snap);
        true
    }
}
