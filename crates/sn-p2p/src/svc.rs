// SPDX-License-Identifier: AGPL-3.0-only

//! Async-Nachrichtendienst: nimmt eingehende Peer-Nachrichten entgegen,
//! drosselt sie (global und je Peer) und reicht sie an den Handler weiter.
//! Ausgehende Nachrichten laufen über den externen Transport (`PeerHub`).

use crate::messages::{Inv, NodeMessage};
use crate::{P2pConfig, P2pError, RateLimitConfig};
use async_trait::async_trait;
use sn_types::NetAddress;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Externer Gossip-Transport. Die Implementierung gehört dem Host-Daemon;
/// der Kern kennt nur diese Operationen.
#[async_trait]
pub trait PeerHub: Send + Sync {
    async fn send(&self, peer: NetAddress, msg: NodeMessage) -> Result<(), P2pError>;
    async fn broadcast_inv(&self, inv: Inv) -> Result<(), P2pError>;
    async fn ask_for(&self, peer: NetAddress, inv: Inv) -> Result<(), P2pError>;
    /// Verbindungsaufbau; liefert die Peer-Adresse bei Erfolg.
    async fn connect(&self, addr: NetAddress) -> Result<Option<NetAddress>, P2pError>;
    async fn disconnect(&self, peer: NetAddress) -> Result<(), P2pError>;
    fn peers(&self) -> Vec<crate::PeerInfo>;
}

/// Verarbeitet eingehende, bereits gedrosselte Nachrichten.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, peer: NetAddress, msg: NodeMessage);
}

#[derive(Clone, Debug)]
pub enum Outbound {
    Direct(NetAddress, NodeMessage),
    BroadcastInv(Inv),
    AskFor(NetAddress, Inv),
    /// Verbindung aufbauen und Nachricht zustellen (PoSe-Challenges)
    ConnectAndSend(NetAddress, NodeMessage),
    Disconnect(NetAddress),
}

#[derive(Debug)]
enum P2pCmd {
    IncomingFrom(NetAddress, NodeMessage),
    Outgoing(Outbound),
    Shutdown,
}

#[derive(Clone)]
pub struct P2pService {
    tx: mpsc::Sender<P2pCmd>,
}

impl P2pService {
    pub async fn incoming(&self, peer: NetAddress, msg: NodeMessage) -> Result<(), P2pError> {
        self.tx
            .send(P2pCmd::IncomingFrom(peer, msg))
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }

    pub async fn outgoing(&self, out: Outbound) -> Result<(), P2pError> {
        self.tx
            .send(P2pCmd::Outgoing(out))
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<(), P2pError> {
        self.tx
            .send(P2pCmd::Shutdown)
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }
}

// Globale Metriken (prozessweit)
static INBOUND_TOTAL: AtomicU64 = AtomicU64::new(0);
static INBOUND_DROPPED_RATE: AtomicU64 = AtomicU64::new(0);
static OUTBOUND_TOTAL: AtomicU64 = AtomicU64::new(0);
static OUT_ERRORS_TOTAL: AtomicU64 = AtomicU64::new(0);
static PEER_RL_PURGED_TOTAL: AtomicU64 = AtomicU64::new(0);
static IN_ANN_TOTAL: AtomicU64 = AtomicU64::new(0);
static IN_PING_TOTAL: AtomicU64 = AtomicU64::new(0);
static IN_OTHER_TOTAL: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub inbound_total: u64,
    pub inbound_dropped_rate: u64,
    pub outbound_total: u64,
    pub out_errors_total: u64,
    pub peer_rl_purged_total: u64,
    pub in_ann_total: u64,
    pub in_ping_total: u64,
    pub in_other_total: u64,
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        inbound_total: INBOUND_TOTAL.load(Ordering::Relaxed),
        inbound_dropped_rate: INBOUND_DROPPED_RATE.load(Ordering::Relaxed),
        outbound_total: OUTBOUND_TOTAL.load(Ordering::Relaxed),
        out_errors_total: OUT_ERRORS_TOTAL.load(Ordering::Relaxed),
        peer_rl_purged_total: PEER_RL_PURGED_TOTAL.load(Ordering::Relaxed),
        in_ann_total: IN_ANN_TOTAL.load(Ordering::Relaxed),
        in_ping_total: IN_PING_TOTAL.load(Ordering::Relaxed),
        in_other_total: IN_OTHER_TOTAL.load(Ordering::Relaxed),
    }
}

// Inbound-Observer (Broadcast): externe Abonnenten sehen verarbeitete Nachrichten
static INBOUND_OBS: OnceLock<broadcast::Sender<NodeMessage>> = OnceLock::new();

fn notify_inbound(msg: &NodeMessage) {
    if let Some(tx) = INBOUND_OBS.get() {
        let _ = tx.send(msg.clone());
    }
}

pub fn inbound_subscribe() -> broadcast::Receiver<NodeMessage> {
    let tx = INBOUND_OBS.get_or_init(|| {
        let (tx, _rx) = broadcast::channel(1024);
        tx
    });
    tx.subscribe()
}

// Einfacher Token-Bucket je Nachrichtenklasse
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl Bucket {
    fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            last: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let dt = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + dt * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct RateLimiter {
    ann: Bucket,
    ping: Bucket,
    other: Bucket,
}

impl RateLimiter {
    fn from_cfg(cfg: Option<&RateLimitConfig>) -> Self {
        match cfg {
            Some(c) => Self {
                ann: Bucket::new(
                    if c.ann_capacity == 0 { 200 } else { c.ann_capacity },
                    if c.ann_refill_per_sec == 0 {
                        200
                    } else {
                        c.ann_refill_per_sec
                    },
                ),
                ping: Bucket::new(
                    if c.ping_capacity == 0 {
                        500
                    } else {
                        c.ping_capacity
                    },
                    if c.ping_refill_per_sec == 0 {
                        500
                    } else {
                        c.ping_refill_per_sec
                    },
                ),
                other: Bucket::new(
                    if c.other_capacity == 0 {
                        1000
                    } else {
                        c.other_capacity
                    },
                    if c.other_refill_per_sec == 0 {
                        1000
                    } else {
                        c.other_refill_per_sec
                    },
                ),
            },
            None => Self {
                ann: Bucket::new(200, 200),
                ping: Bucket::new(500, 500),
                other: Bucket::new(1000, 1000),
            },
        }
    }

    fn allow_msg(&mut self, msg: &NodeMessage) -> bool {
        match msg {
            NodeMessage::Announce(_) => self.ann.allow(),
            NodeMessage::Heartbeat(_) => self.ping.allow(),
            _ => self.other.allow(),
        }
    }
}

fn count_inbound(msg: &NodeMessage) {
    INBOUND_TOTAL.fetch_add(1, Ordering::Relaxed);
    match msg {
        NodeMessage::Announce(_) => {
            IN_ANN_TOTAL.fetch_add(1, Ordering::Relaxed);
        }
        NodeMessage::Heartbeat(_) => {
            IN_PING_TOTAL.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            IN_OTHER_TOTAL.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn dispatch_outbound(hub: &Arc<dyn PeerHub>, out: Outbound) {
    OUTBOUND_TOTAL.fetch_add(1, Ordering::Relaxed);
    let result = match out {
        Outbound::Direct(peer, msg) => hub.send(peer, msg).await,
        Outbound::BroadcastInv(inv) => hub.broadcast_inv(inv).await,
        Outbound::AskFor(peer, inv) => hub.ask_for(peer, inv).await,
        Outbound::ConnectAndSend(addr, msg) => match hub.connect(addr).await {
            Ok(Some(peer)) => hub.send(peer, msg).await,
            Ok(None) => Err(P2pError::PeerUnreachable),
            Err(e) => Err(e),
        },
        Outbound::Disconnect(peer) => hub.disconnect(peer).await,
    };
    if let Err(e) = result {
        OUT_ERRORS_TOTAL.fetch_add(1, Ordering::Relaxed);
        debug!("outbound delivery failed: {e}");
    }
}

/// Startet den Dienst; liefert Handle und Task.
pub fn spawn_service(
    cfg: P2pConfig,
    handler: Arc<dyn MessageHandler>,
    hub: Arc<dyn PeerHub>,
) -> Result<(P2pService, tokio::task::JoinHandle<()>), P2pError> {
    if cfg.max_peers == 0 {
        return Err(P2pError::InvalidConfig);
    }
    let (tx, rx) = mpsc::channel::<P2pCmd>(1024);
    let svc = P2pService { tx };
    let task = tokio::spawn(run_loop(cfg, rx, handler, hub));
    Ok((svc, task))
}

async fn run_loop(
    cfg: P2pConfig,
    mut rx: mpsc::Receiver<P2pCmd>,
    handler: Arc<dyn MessageHandler>,
    hub: Arc<dyn PeerHub>,
) {
    let mut rl = RateLimiter::from_cfg(cfg.rate.as_ref());
    struct PeerRate {
        rl: RateLimiter,
        last_seen: Instant,
    }
    let mut per_peer_rl: HashMap<NetAddress, PeerRate> = HashMap::new();
    let use_per_peer = cfg.rate.as_ref().map(|r| r.per_peer).unwrap_or(true);
    let ttl_secs = cfg
        .rate
        .as_ref()
        .map(|r| if r.peer_ttl_secs == 0 { 600 } else { r.peer_ttl_secs })
        .unwrap_or(600);
    let mut purge_tick = tokio::time::interval(std::time::Duration::from_secs(60));

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(P2pCmd::IncomingFrom(peer, msg)) => {
                        let allowed = if use_per_peer {
                            let entry = per_peer_rl.entry(peer).or_insert_with(|| PeerRate {
                                rl: RateLimiter::from_cfg(cfg.rate.as_ref()),
                                last_seen: Instant::now(),
                            });
                            entry.last_seen = Instant::now();
                            entry.rl.allow_msg(&msg)
                        } else {
                            rl.allow_msg(&msg)
                        };
                        if allowed {
                            count_inbound(&msg);
                            notify_inbound(&msg);
                            handler.handle_message(peer, msg).await;
                        } else {
                            INBOUND_DROPPED_RATE.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Some(P2pCmd::Outgoing(out)) => {
                        dispatch_outbound(&hub, out).await;
                    }
                    Some(P2pCmd::Shutdown) | None => {
                        warn!("p2p service loop terminating");
                        return;
                    }
                }
            }
            _ = purge_tick.tick() => {
                let before = per_peer_rl.len();
                per_peer_rl.retain(|_, v| v.last_seen.elapsed().as_secs() < ttl_secs);
                let purged = before.saturating_sub(per_peer_rl.len());
                if purged > 0 {
                    PEER_RL_PURGED_TOTAL.fetch_add(purged as u64, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        seen: Mutex<Vec<(NetAddress, NodeMessage)>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle_message(&self, peer: NetAddress, msg: NodeMessage) {
            if let Ok(mut guard) = self.seen.lock() {
                guard.push((peer, msg));
            }
        }
    }

    struct NullHub {
        sent: Mutex<Vec<(NetAddress, NodeMessage)>>,
    }

    #[async_trait]
    impl PeerHub for NullHub {
        async fn send(&self, peer: NetAddress, msg: NodeMessage) -> Result<(), P2pError> {
            if let Ok(mut guard) = self.sent.lock() {
                guard.push((peer, msg));
            }
            Ok(())
        }
        async fn broadcast_inv(&self, _inv: Inv) -> Result<(), P2pError> {
            Ok(())
        }
        async fn ask_for(&self, _peer: NetAddress, _inv: Inv) -> Result<(), P2pError> {
            Ok(())
        }
        async fn connect(&self, addr: NetAddress) -> Result<Option<NetAddress>, P2pError> {
            Ok(Some(addr))
        }
        async fn disconnect(&self, _peer: NetAddress) -> Result<(), P2pError> {
            Ok(())
        }
        fn peers(&self) -> Vec<crate::PeerInfo> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn inbound_reaches_handler_and_outbound_reaches_hub() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let hub = Arc::new(NullHub {
            sent: Mutex::new(Vec::new()),
        });
        let (svc, task) = spawn_service(P2pConfig::default(), handler.clone(), hub.clone())
            .expect("spawn");

        let peer = NetAddress::new([1, 2, 3, 4], 8884);
        svc.incoming(peer, NodeMessage::GetSporks).await.expect("in");
        svc.outgoing(Outbound::Direct(
            peer,
            NodeMessage::PaymentSync { limit: 10 },
        ))
        .await
        .expect("out");
        svc.shutdown().await.expect("shutdown");
        task.await.expect("join");

        let seen = handler.seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        let sent = hub.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn rejects_zero_peer_config() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let hub = Arc::new(NullHub {
            sent: Mutex::new(Vec::new()),
        });
        let cfg = P2pConfig {
            max_peers: 0,
            rate: None,
        };
        assert!(spawn_service(cfg, handler, hub).is_err());
    }
}
