// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented
)]

use sn_crypto::{sha256d_32, Hash32};
use sn_types::{Amount, ChainParams, OutPoint};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug)]
pub enum ChainError {
    /// Chain-Lock nicht verfügbar; Aufrufer soll später erneut versuchen,
    /// niemals blockieren und niemals den Absender bestrafen.
    Busy,
    NoTip,
    UnknownBlock(i32),
}

impl core::fmt::Display for ChainError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Busy => f.write_str("chain lock contended"),
            Self::NoTip => f.write_str("no chain tip"),
            Self::UnknownBlock(h) => write!(f, "unknown block at height {h}"),
        }
    }
}
impl std::error::Error for ChainError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockIndex {
    pub height: i32,
    pub hash: Hash32,
    pub time: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub value: Amount,
    pub height: i32,
    pub script: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UtxoQuery {
    Active(Utxo),
    Spent,
    Missing,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxOutView {
    pub value: Amount,
    pub script: Vec<u8>,
}

/// Minimale Block-Sicht: nur die Coinbase interessiert den Kern
/// (Auszahlungsvalidierung und Last-Paid-Scan).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockView {
    pub coinbase_outputs: Vec<TxOutView>,
    pub time: i64,
}

impl BlockView {
    pub fn coinbase_value_out(&self) -> Amount {
        self.coinbase_outputs.iter().map(|o| o.value).sum()
    }
}

/// Vertrag zum Host-Daemon. Implementierungen dürfen bei Lock-Kontention
/// `Busy` liefern; der Kern wertet das als "später erneut versuchen".
pub trait ChainView: Send + Sync {
    fn tip(&self) -> Result<BlockIndex, ChainError>;
    fn height(&self) -> Result<i32, ChainError>;
    fn block_hash(&self, height: i32) -> Result<Hash32, ChainError>;
    fn block_index_by_hash(&self, hash: &Hash32) -> Result<Option<BlockIndex>, ChainError>;
    fn block_index_at(&self, height: i32) -> Result<Option<BlockIndex>, ChainError>;
    fn utxo(&self, outpoint: &OutPoint) -> Result<UtxoQuery, ChainError>;
    fn read_block(&self, height: i32) -> Result<Option<BlockView>, ChainError>;
    /// Operator-Anteil an der Block-Auszahlung bei gegebener Gesamtausgabe.
    fn operator_payment(&self, height: i32, total_out: Amount) -> Amount;
    fn params(&self) -> &ChainParams;
}

// ============================
// In-Memory-Referenzimplementierung
// ============================

struct ChainInner {
    blocks: Vec<BlockIndex>,
    block_views: BTreeMap<i32, BlockView>,
    utxos: BTreeMap<OutPoint, UtxoQuery>,
}

pub struct InMemoryChain {
    params: ChainParams,
    /// Anteil der Operator-Auszahlung in Basispunkten der Gesamtausgabe
    payment_share_bp: u64,
    inner: Mutex<ChainInner>,
}

impl InMemoryChain {
    pub fn new(params: ChainParams) -> Self {
        Self {
            params,
            payment_share_bp: 5000,
            inner: Mutex::new(ChainInner {
                blocks: Vec::new(),
                block_views: BTreeMap::new(),
                utxos: BTreeMap::new(),
            }),
        }
    }

    /// Deterministischer Blockhash für synthetische Ketten.
    pub fn synthetic_hash(height: i32) -> Hash32 {
        let mut buf = *b"sn:block:................................";
        for (dst, src) in buf.iter_mut().skip(9).zip(height.to_le_bytes().iter()) {
            *dst = *src;
        }
        sha256d_32(&buf)
    }

    /// Baut eine Kette der Länge `height + 1` mit fester Blockzeit-Spreizung.
    pub fn with_synthetic_blocks(params: ChainParams, height: i32, genesis_time: i64) -> Self {
        let chain = Self::new(params);
        {
            let mut inner = match chain.inner.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            for h in 0..=height {
                inner.blocks.push(BlockIndex {
                    height: h,
                    hash: Self::synthetic_hash(h),
                    time: genesis_time + (h as i64) * 150,
                });
            }
        }
        chain
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ChainInner>, ChainError> {
        // try_lock statt lock: der Kern darf hier nicht blockieren
        match self.inner.try_lock() {
            Ok(g) => Ok(g),
            Err(std::sync::TryLockError::WouldBlock) => Err(ChainError::Busy),
            Err(std::sync::TryLockError::Poisoned(p)) => Ok(p.into_inner()),
        }
    }

    pub fn push_block(&self, time: i64) -> Result<BlockIndex, ChainError> {
        let mut inner = self.lock()?;
        let height = inner.blocks.len() as i32;
        let idx = BlockIndex {
            height,
            hash: Self::synthetic_hash(height),
            time,
        };
        inner.blocks.push(idx);
        Ok(idx)
    }

    pub fn set_block_view(&self, height: i32, view: BlockView) -> Result<(), ChainError> {
        let mut inner = self.lock()?;
        let _ = inner.block_views.insert(height, view);
        Ok(())
    }

    pub fn set_utxo(&self, outpoint: OutPoint, utxo: Utxo) -> Result<(), ChainError> {
        let mut inner = self.lock()?;
        let _ = inner.utxos.insert(outpoint, UtxoQuery::Active(utxo));
        Ok(())
    }

    pub fn mark_spent(&self, outpoint: &OutPoint) -> Result<(), ChainError> {
        let mut inner = self.lock()?;
        let _ = inner.utxos.insert(*outpoint, UtxoQuery::Spent);
        Ok(())
    }
}

impl ChainView for InMemoryChain {
    fn tip(&self) -> Result<BlockIndex, ChainError> {
        let inner = self.lock()?;
        inner.blocks.last().copied().ok_or(ChainError::NoTip)
    }

    fn height(&self) -> Result<i32, ChainError> {
        Ok(self.tip()?.height)
    }

    fn block_hash(&self, height: i32) -> Result<Hash32, ChainError> {
        let inner = self.lock()?;
        inner
            .blocks
            .get(usize::try_from(height).map_err(|_| ChainError::UnknownBlock(height))?)
            .map(|b| b.hash)
            .ok_or(ChainError::UnknownBlock(height))
    }

    fn block_index_by_hash(&self, hash: &Hash32) -> Result<Option<BlockIndex>, ChainError> {
        let inner = self.lock()?;
        Ok(inner.blocks.iter().find(|b| b.hash == *hash).copied())
    }

    fn block_index_at(&self, height: i32) -> Result<Option<BlockIndex>, ChainError> {
        let inner = self.lock()?;
        let idx = usize::try_from(height).ok();
        Ok(idx.and_then(|i| inner.blocks.get(i)).copied())
    }

    fn utxo(&self, outpoint: &OutPoint) -> Result<UtxoQuery, ChainError> {
        let inner = self.lock()?;
        Ok(inner
            .utxos
            .get(outpoint)
            .cloned()
            .unwrap_or(UtxoQuery::Missing))
    }

    fn read_block(&self, height: i32) -> Result<Option<BlockView>, ChainError> {
        let inner = self.lock()?;
        Ok(inner.block_views.get(&height).cloned())
    }

    fn operator_payment(&self, _height: i32, total_out: Amount) -> Amount {
        total_out / 10_000 * self.payment_share_bp
    }

    fn params(&self) -> &ChainParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_types::COIN;

    #[test]
    fn synthetic_chain_basics() {
        let chain = InMemoryChain::with_synthetic_blocks(ChainParams::regtest(), 120, 1_000_000);
        assert_eq!(chain.height().expect("height"), 120);
        let tip = chain.tip().expect("tip");
        assert_eq!(tip.hash, InMemoryChain::synthetic_hash(120));
        assert_eq!(
            chain.block_hash(19).expect("hash"),
            InMemoryChain::synthetic_hash(19)
        );
        assert!(matches!(
            chain.block_hash(121),
            Err(ChainError::UnknownBlock(121))
        ));
        let idx = chain
            .block_index_by_hash(&InMemoryChain::synthetic_hash(7))
            .expect("query")
            .expect("found");
        assert_eq!(idx.height, 7);
    }

    #[test]
    fn utxo_lifecycle() {
        let chain = InMemoryChain::with_synthetic_blocks(ChainParams::regtest(), 10, 0);
        let op = OutPoint::new([1u8; 32], 0);
        assert_eq!(chain.utxo(&op).expect("query"), UtxoQuery::Missing);
        chain
            .set_utxo(
                op,
                Utxo {
                    value: 2500 * COIN,
                    height: 3,
                    script: vec![0x76],
                },
            )
            .expect("set");
        assert!(matches!(
            chain.utxo(&op).expect("query"),
            UtxoQuery::Active(_)
        ));
        chain.mark_spent(&op).expect("spend");
        assert_eq!(chain.utxo(&op).expect("query"), UtxoQuery::Spent);
    }

    #[test]
    fn busy_while_locked() {
        let chain = InMemoryChain::with_synthetic_blocks(ChainParams::regtest(), 5, 0);
        let guard = chain.inner.lock().expect("outer lock");
        assert!(matches!(chain.height(), Err(ChainError::Busy)));
        drop(guard);
        assert_eq!(chain.height().expect("height"), 5);
    }

    #[test]
    fn operator_payment_share() {
        let chain = InMemoryChain::new(ChainParams::regtest());
        assert_eq!(chain.operator_payment(100, 50 * COIN), 25 * COIN);
    }
}
