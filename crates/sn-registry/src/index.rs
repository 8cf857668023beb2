// SPDX-License-Identifier: AGPL-3.0-only

//! Stabiler Vorwärts-/Rückwärts-Index zwischen Collateral-Outpoints und
//! kleinen Ganzzahlen. Normalerweise nur wachsend; ein Rebuild passiert
//! erst, wenn der Index die erwartete Maximalgröße und die aktuelle
//! Eintragszahl überschreitet.

use sn_codec::{CodecError, Decodable, Encodable};
use sn_types::OutPoint;
use std::collections::BTreeMap;
use std::io::{Read, Write};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatorIndex {
    size: i32,
    map: BTreeMap<OutPoint, i32>,
    reverse: BTreeMap<i32, OutPoint>,
}

impl OperatorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn get(&self, index: i32) -> Option<OutPoint> {
        self.reverse.get(&index).copied()
    }

    pub fn index_of(&self, outpoint: &OutPoint) -> Option<i32> {
        self.map.get(outpoint).copied()
    }

    pub fn add(&mut self, outpoint: OutPoint) {
        if self.map.contains_key(&outpoint) {
            return;
        }
        let next = self.size;
        let _ = self.map.insert(outpoint, next);
        let _ = self.reverse.insert(next, outpoint);
        self.size += 1;
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.reverse.clear();
        self.size = 0;
    }

    fn rebuild_reverse(&mut self) {
        self.size = self.map.len() as i32;
        self.reverse.clear();
        for (outpoint, idx) in &self.map {
            let _ = self.reverse.insert(*idx, *outpoint);
        }
    }
}

// Nur die Vorwärts-Map ist Teil des Schnappschusses; die Rückrichtung
// wird beim Laden rekonstruiert.
impl Encodable for OperatorIndex {
    fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        self.map.encode(w)
    }
    fn encoded_len(&self) -> usize {
        self.map.encoded_len()
    }
}

impl Decodable for OperatorIndex {
    fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        let map = BTreeMap::<OutPoint, i32>::decode(r)?;
        let mut idx = Self {
            size: 0,
            map,
            reverse: BTreeMap::new(),
        };
        idx.rebuild_reverse();
        Ok(idx)
    }
}
