// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented
)]

pub mod fulfilled;
pub mod messages;
pub mod svc;

pub use fulfilled::FulfilledRequestCache;
pub use messages::{Inv, InvType, NodeMessage, SporkPayload};
pub use svc::{
    inbound_subscribe, metrics_snapshot, spawn_service, MessageHandler, MetricsSnapshot, Outbound,
    P2pService, PeerHub,
};

#[derive(Debug)]
pub enum P2pError {
    InvalidConfig,
    ChannelClosed,
    PeerUnreachable,
}

impl core::fmt::Display for P2pError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            P2pError::InvalidConfig => f.write_str("invalid p2p config"),
            P2pError::ChannelClosed => f.write_str("channel closed"),
            P2pError::PeerUnreachable => f.write_str("peer unreachable"),
        }
    }
}

impl std::error::Error for P2pError {}

#[derive(Clone, Debug)]
pub struct P2pConfig {
    pub max_peers: u16,
    pub rate: Option<RateLimitConfig>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            max_peers: 64,
            rate: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RateLimitConfig {
    pub ann_capacity: u32,
    pub ann_refill_per_sec: u32,
    pub ping_capacity: u32,
    pub ping_refill_per_sec: u32,
    pub other_capacity: u32,
    pub other_refill_per_sec: u32,
    pub per_peer: bool,
    pub peer_ttl_secs: u64,
}

/// Sicht auf einen verbundenen Peer, wie sie der Transport liefert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: sn_types::NetAddress,
    pub version: i32,
    pub inbound: bool,
    /// kurzlebige Operator-zu-Operator-Verbindung
    pub operator_conn: bool,
}
