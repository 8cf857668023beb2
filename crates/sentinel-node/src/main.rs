// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented
)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use sn_active::{ActiveOperator, ActiveStep, MemoryWallet, StaticProbe};
use sn_chain::{ChainView, InMemoryChain};
use sn_crypto::{sha256_32, OperatorKeypair};
use sn_p2p::fulfilled::FulfilledRequestCache;
use sn_p2p::messages::{Inv, InvType, NodeMessage, SporkPayload};
use sn_p2p::svc::{spawn_service, MessageHandler, Outbound, P2pService, PeerHub};
use sn_p2p::{metrics_snapshot, P2pConfig, P2pError, PeerInfo};
use sn_payments::{PaymentQueue, PaymentsSnapshot};
use sn_registry::{
    Admission, HeartbeatAdmission, LocalOperator, OperatorRegistry, RegistryEvent,
    RegistryOptions, RegistrySnapshot, SyncFlags, LAST_PAID_SCAN_BLOCKS,
};
use sn_store::SnapshotStore;
use sn_sync::{NullGovernance, SyncController, SyncStep, SYNC_TICK_SECONDS};
use sn_types::{ChainParams, NetAddress, PubKeyBytes, TxIn};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

const REGISTRY_SNAPSHOT: &str = "operators";
const PAYMENTS_SNAPSHOT: &str = "payments";
/// Stimmen gelten der Höhe Tip + 10, damit sie vor dem Block propagieren
const VOTE_LOOKAHEAD_BLOCKS: i32 = 10;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn parse_net_address(s: &str) -> Result<NetAddress> {
    let (ip_str, port_str) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected ip:port, got {s}"))?;
    let ip = std::net::Ipv4Addr::from_str(ip_str)?;
    let port: u16 = port_str.parse()?;
    Ok(NetAddress::new(ip.octets(), port))
}

#[derive(Parser, Debug)]
#[command(name = "sentinel-node", about = "Sentinel service-node subsystem")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Startet den Dienstknoten
    Run(RunArgs),
    /// Erzeugt ein frisches Operator-Schlüsselpaar
    Genkey,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Netz: main, test oder regtest
    #[arg(long, default_value = "regtest")]
    network: String,
    /// Datenverzeichnis für Schnappschüsse
    #[arg(long, default_value = "./sentinel-data")]
    data_dir: String,
    /// Operator-Secret (Hex, 32 Bytes); ohne Angabe läuft der Knoten passiv
    #[arg(long)]
    operator_key: Option<String>,
    /// feste externe Adresse (ip:port) statt Erkennung
    #[arg(long)]
    external_addr: Option<String>,
    /// bekannte Peers (ip:port), mehrfach angebbar
    #[arg(long = "peer")]
    peers: Vec<String>,
    /// Watchdog-Mechanismus aktivieren (Standard: aus)
    #[arg(long, default_value_t = false)]
    watchdog: bool,
    /// fsync beim Persistieren
    #[arg(long, default_value_t = false)]
    fsync: bool,
    /// Höhe der synthetischen Demo-Kette
    #[arg(long, default_value_t = 200)]
    demo_height: i32,
    /// Sekunden zwischen synthetischen Demo-Blöcken (0 = aus)
    #[arg(long, default_value_t = 150)]
    demo_block_seconds: u64,
}

// ============================
// Transport-Anbindung (Demo)
// ============================

/// Platzhalter-Transport: merkt sich konfigurierte Peers, protokolliert
/// ausgehende Nachrichten. Der Host-Daemon ersetzt ihn durch sein Gossip.
struct LoopbackHub {
    peers: Vec<PeerInfo>,
}

#[async_trait]
impl PeerHub for LoopbackHub {
    async fn send(&self, peer: NetAddress, msg: NodeMessage) -> Result<(), P2pError> {
        debug!(%peer, ?msg, "outbound message (loopback)");
        Ok(())
    }
    async fn broadcast_inv(&self, inv: Inv) -> Result<(), P2pError> {
        debug!(?inv, "broadcast inv (loopback)");
        Ok(())
    }
    async fn ask_for(&self, peer: NetAddress, inv: Inv) -> Result<(), P2pError> {
        debug!(%peer, ?inv, "ask for inv (loopback)");
        Ok(())
    }
    async fn connect(&self, addr: NetAddress) -> Result<Option<NetAddress>, P2pError> {
        Ok(Some(addr))
    }
    async fn disconnect(&self, peer: NetAddress) -> Result<(), P2pError> {
        debug!(%peer, "disconnect (loopback)");
        Ok(())
    }
    fn peers(&self) -> Vec<PeerInfo> {
        self.peers.clone()
    }
}

// ============================
// Knoten-Kontext
// ============================

/// Ein Kontextwert statt globaler Singletons; Tests und Binary bauen sich
/// je eine frische Instanz. Lock-Reihenfolge: Chain (intern, try-lock)
/// vor Registry; alle kritischen Abschnitte bleiben kurz und enden vor
/// jedem Transport-I/O.
struct NodeContext {
    chain: Arc<InMemoryChain>,
    registry: Mutex<OperatorRegistry>,
    payments: Mutex<PaymentQueue>,
    sync: Mutex<SyncController>,
    fulfilled: Mutex<FulfilledRequestCache>,
    active: Mutex<Option<ActiveOperator>>,
    wallet: Mutex<MemoryWallet>,
    probe: StaticProbe,
    hub: Arc<dyn PeerHub>,
    store: SnapshotStore,
}

impl NodeContext {
    fn sync_flags(&self) -> SyncFlags {
        self.sync
            .lock()
            .map(|s| s.flags())
            .unwrap_or_default()
    }

    fn local_operator(&self) -> Option<LocalOperator> {
        self.registry
            .lock()
            .ok()
            .and_then(|r| r.local_operator().cloned())
    }

    /// Register-Events in Transportaktionen übersetzen.
    fn drain_registry_events(&self, now: i64) -> Vec<Outbound> {
        let mut out = Vec::new();
        let events = match self.registry.lock() {
            Ok(mut registry) => registry.take_events(),
            Err(_) => return out,
        };
        for event in events {
            match event {
                RegistryEvent::ListSyncBumped => {
                    if let Ok(mut sync) = self.sync.lock() {
                        sync.note_list_entry(now);
                    }
                }
                RegistryEvent::OperatorsAdded | RegistryEvent::OperatorsRemoved => {
                    // Governance-Subsystem außerhalb; nur Haken ziehen
                    if let Ok(mut registry) = self.registry.lock() {
                        let dirty = registry.get_and_clear_dirty_governance_hashes();
                        if !dirty.is_empty() {
                            debug!(count = dirty.len(), "governance hashes flagged dirty");
                        }
                    }
                }
                RegistryEvent::RelayAnnounce(mnb) => {
                    out.push(Outbound::BroadcastInv(Inv::new(
                        InvType::Announce,
                        mnb.digest(),
                    )));
                }
                RegistryEvent::RelayHeartbeat(hb) => {
                    out.push(Outbound::BroadcastInv(Inv::new(
                        InvType::Heartbeat,
                        hb.digest(),
                    )));
                }
                RegistryEvent::RelayVerification(mnv) => {
                    out.push(Outbound::BroadcastInv(Inv::new(
                        InvType::Verify,
                        mnv.digest(),
                    )));
                }
                RegistryEvent::AskEntry { peer, vin } => {
                    let ask = self
                        .registry
                        .lock()
                        .ok()
                        .and_then(|mut r| r.ask_for_entry(peer, &vin, now));
                    if let Some(msg) = ask {
                        out.push(Outbound::Direct(peer, msg));
                    }
                }
                RegistryEvent::RemoteActivation => {
                    info!("remote activation signalled, running activation step");
                    self.manage_active_state(now);
                }
            }
        }
        out
    }

    fn manage_active_state(&self, now: i64) -> Vec<ActiveStep> {
        let sync = self.sync_flags();
        let peers = self.hub.peers();
        let mut steps = Vec::new();
        if let (Ok(mut active_guard), Ok(mut registry), Ok(mut wallet)) =
            (self.active.lock(), self.registry.lock(), self.wallet.lock())
        {
            if let Some(active) = active_guard.as_mut() {
                steps = active.manage_state(
                    self.chain.as_ref(),
                    &mut registry,
                    &mut *wallet,
                    &self.probe,
                    &peers,
                    sync,
                    now,
                );
            }
        }
        steps
    }

    fn persist(&self) -> Result<()> {
        if let Ok(registry) = self.registry.lock() {
            self.store.put(REGISTRY_SNAPSHOT, &registry.snapshot())?;
        }
        if let Ok(payments) = self.payments.lock() {
            self.store.put(PAYMENTS_SNAPSHOT, &payments.snapshot())?;
        }
        debug!("snapshots persisted");
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        if let Some(snap) = self.store.get::<RegistrySnapshot>(REGISTRY_SNAPSHOT)? {
            if let Ok(mut registry) = self.registry.lock() {
                if registry.restore(snap) {
                    info!(count = registry.size(), "registry snapshot loaded");
                }
            }
        }
        if let Some(snap) = self.store.get::<PaymentsSnapshot>(PAYMENTS_SNAPSHOT)? {
            if let Ok(mut payments) = self.payments.lock() {
                if payments.restore(snap) {
                    info!(votes = payments.vote_count(), "payments snapshot loaded");
                }
            }
        }
        Ok(())
    }

    /// Fan-out eines neuen Chain-Tips an alle Teilsysteme.
    fn updated_block_tip(&self, now: i64) -> Vec<Outbound> {
        let mut out = Vec::new();
        let sync = self.sync_flags();
        let tip_height = match self.chain.height() {
            Ok(h) => h,
            Err(_) => return out,
        };
        debug!(height = tip_height, "updated block tip");

        if let Ok(mut registry) = self.registry.lock() {
            registry.check_same_addr(sync);
        }
        // Last-Paid nur als aktiver Operator bei jedem Block nachziehen
        if self.local_operator().is_some() {
            if let (Ok(mut registry), Ok(payments)) =
                (self.registry.lock(), self.payments.lock())
            {
                registry.update_last_paid(self.chain.as_ref(), &*payments, LAST_PAID_SCAN_BLOCKS);
            }
        }

        // eigene Zahlungsstimme für Tip + 10
        let vote = {
            match (self.registry.lock(), self.payments.lock()) {
                (Ok(registry), Ok(mut payments)) => payments.process_block(
                    tip_height + VOTE_LOOKAHEAD_BLOCKS,
                    &registry,
                    self.chain.as_ref(),
                    now,
                    sync,
                ),
                _ => None,
            }
        };
        if let Some(vote) = vote {
            out.push(Outbound::BroadcastInv(Inv::new(
                InvType::PaymentVote,
                vote.digest(),
            )));
        }

        if let (Ok(registry), Ok(mut payments)) = (self.registry.lock(), self.payments.lock()) {
            payments.check_and_remove(tip_height, registry.size());
        }
        out
    }
}

// ============================
// Nachrichten-Dispatch
// ============================

struct NodeHandler {
    ctx: Arc<NodeContext>,
    svc: Mutex<Option<P2pService>>,
}

impl NodeHandler {
    async fn emit(&self, outs: Vec<Outbound>) {
        let svc = match self.svc.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(svc) = svc {
            for out in outs {
                if let Err(e) = svc.outgoing(out).await {
                    warn!("failed to queue outbound message: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for NodeHandler {
    async fn handle_message(&self, peer: NetAddress, msg: NodeMessage) {
        let ctx = &self.ctx;
        let now = unix_now();
        let sync = ctx.sync_flags();
        if !sync.blockchain_synced {
            debug!(%peer, "dropping message, blockchain not synced");
            return;
        }
        let mut outs: Vec<Outbound> = Vec::new();

        match msg {
            NodeMessage::Announce(mnb) => {
                let admission = match ctx.registry.lock() {
                    Ok(mut registry) => {
                        registry.submit_announce(mnb, Some(peer), ctx.chain.as_ref(), now, sync)
                    }
                    Err(_) => return,
                };
                if let Admission::Rejected { dos } = admission {
                    if dos > 0 {
                        warn!(%peer, dos, "misbehaving peer (announce)");
                    }
                }
            }
            NodeMessage::Heartbeat(hb) => {
                let admission = match ctx.registry.lock() {
                    Ok(mut registry) => {
                        registry.submit_heartbeat(hb, Some(peer), ctx.chain.as_ref(), now, sync)
                    }
                    Err(_) => return,
                };
                if let HeartbeatAdmission::Rejected { dos } = admission {
                    if dos > 0 {
                        warn!(%peer, dos, "misbehaving peer (heartbeat)");
                    }
                }
            }
            NodeMessage::Verify(mnv) => {
                let local = ctx.local_operator();
                let result = match ctx.registry.lock() {
                    Ok(mut registry) => {
                        if mnv.sig1.is_empty() {
                            // Stufe 1: wir sollen uns beweisen
                            let reply = match ctx.fulfilled.lock() {
                                Ok(mut fulfilled) => registry.send_verify_reply(
                                    peer,
                                    mnv,
                                    local.as_ref(),
                                    ctx.chain.as_ref(),
                                    &mut fulfilled,
                                    now,
                                ),
                                Err(_) => Ok(None),
                            };
                            match reply {
                                Ok(Some(reply)) => {
                                    outs.push(Outbound::Direct(peer, NodeMessage::Verify(reply)));
                                    Ok(())
                                }
                                Ok(None) => Ok(()),
                                Err(dos) => Err(dos),
                            }
                        } else if mnv.sig2.is_empty() {
                            // Stufe 2: Antwort auf unsere Challenge
                            match ctx.fulfilled.lock() {
                                Ok(mut fulfilled) => registry.process_verify_reply(
                                    peer,
                                    mnv,
                                    local.as_ref(),
                                    ctx.chain.as_ref(),
                                    &mut fulfilled,
                                    now,
                                ),
                                Err(_) => Ok(()),
                            }
                        } else {
                            // Stufe 3: fremder Verifikations-Broadcast
                            registry.process_verify_broadcast(peer, mnv, ctx.chain.as_ref())
                        }
                    }
                    Err(_) => return,
                };
                if let Err(dos) = result {
                    warn!(%peer, dos, "misbehaving peer (verification)");
                }
            }
            NodeMessage::PaymentVote(vote) => {
                let voter = vote.voter.clone();
                let admission = match (ctx.registry.lock(), ctx.payments.lock()) {
                    (Ok(registry), Ok(mut payments)) => payments.submit_vote(
                        vote.clone(),
                        Some(peer),
                        &registry,
                        ctx.chain.as_ref(),
                        sync,
                    ),
                    _ => return,
                };
                match admission {
                    sn_payments::VoteAdmission::Accepted { relay } => {
                        if let Ok(mut sync_ctl) = ctx.sync.lock() {
                            sync_ctl.note_payment_vote(now);
                        }
                        if relay {
                            outs.push(Outbound::BroadcastInv(Inv::new(
                                InvType::PaymentVote,
                                vote.digest(),
                            )));
                        }
                    }
                    sn_payments::VoteAdmission::UnknownVoter => {
                        let ask = ctx
                            .registry
                            .lock()
                            .ok()
                            .and_then(|mut r| r.ask_for_entry(peer, &voter, now));
                        if let Some(msg) = ask {
                            outs.push(Outbound::Direct(peer, msg));
                        }
                    }
                    sn_payments::VoteAdmission::Rejected { dos } => {
                        warn!(%peer, dos, "misbehaving peer (payment vote)");
                    }
                    _ => {}
                }
            }
            NodeMessage::ListRequest { vin } => {
                let served = match ctx.registry.lock() {
                    Ok(mut registry) => {
                        registry.serve_list_request(peer, &vin, now, sync)
                    }
                    Err(_) => return,
                };
                match served {
                    Ok(messages) => {
                        for message in messages {
                            outs.push(Outbound::Direct(peer, message));
                        }
                    }
                    Err(dos) => warn!(%peer, dos, "misbehaving peer (list request)"),
                }
            }
            NodeMessage::PaymentSync { limit } => {
                debug!(%peer, limit, "serving payment sync");
                let tip_height = ctx.chain.height().unwrap_or(0);
                let messages = match (ctx.registry.lock(), ctx.payments.lock()) {
                    (Ok(registry), Ok(payments)) => {
                        payments.serve_payment_sync(tip_height, registry.size())
                    }
                    _ => return,
                };
                for message in messages {
                    outs.push(Outbound::Direct(peer, message));
                }
            }
            NodeMessage::SyncStatusCount { item, count } => {
                if let Ok(sync_ctl) = ctx.sync.lock() {
                    sync_ctl.process_sync_status_count(peer, item, count);
                }
            }
            NodeMessage::GetSporks => {
                // Spork-Verwaltung liegt beim Host; eine leere Antwort
                // genügt als Lebenszeichen für den Sync
                outs.push(Outbound::Direct(
                    peer,
                    NodeMessage::Spork(SporkPayload::default()),
                ));
            }
            NodeMessage::Spork(spork) => {
                debug!(%peer, id = spork.id, "spork received");
            }
            NodeMessage::GovernanceSync => {
                debug!(%peer, "governance sync requested, no backlog");
            }
        }

        outs.extend(ctx.drain_registry_events(now));
        self.emit(outs).await;
    }
}

// ============================
// Run-Loop
// ============================

fn build_params(network: &str) -> Result<ChainParams> {
    match network {
        "main" => Ok(ChainParams::main()),
        "test" => Ok(ChainParams::test()),
        "regtest" => Ok(ChainParams::regtest()),
        other => bail!("unknown network {other}"),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let params = build_params(&args.network)?;
    let now = unix_now();

    let chain = Arc::new(InMemoryChain::with_synthetic_blocks(
        params.clone(),
        args.demo_height,
        now - (args.demo_height as i64) * 150,
    ));

    let mut peer_infos = Vec::new();
    for peer in &args.peers {
        peer_infos.push(PeerInfo {
            addr: parse_net_address(peer)?,
            version: sn_types::PROTOCOL_VERSION,
            inbound: false,
            operator_conn: false,
        });
    }
    let hub: Arc<dyn PeerHub> = Arc::new(LoopbackHub { peers: peer_infos });

    let mut options = RegistryOptions::new(params.clone());
    options.watchdog_enabled = args.watchdog;

    let external_addr = args
        .external_addr
        .as_deref()
        .map(parse_net_address)
        .transpose()?;

    let ctx = Arc::new(NodeContext {
        chain: chain.clone(),
        registry: Mutex::new(OperatorRegistry::new(options)),
        payments: Mutex::new(PaymentQueue::new()),
        sync: Mutex::new(SyncController::new(now)),
        fulfilled: Mutex::new(FulfilledRequestCache::new()),
        active: Mutex::new(None),
        wallet: Mutex::new(MemoryWallet::empty()),
        probe: StaticProbe {
            local: external_addr,
            reflected: None,
            reachable: true,
        },
        hub: hub.clone(),
        store: SnapshotStore::open(&args.data_dir, args.fsync)?,
    });

    // konfigurierter Operator: Schlüssel binden, Treiber anlegen
    if let Some(key_hex) = &args.operator_key {
        let raw = hex::decode(key_hex)?;
        let secret: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("operator key must be 32 bytes of hex"))?;
        let keypair = OperatorKeypair::from_secret_bytes(&secret)?;
        info!(id = %hex::encode(keypair.key_id()), "operator key loaded");
        if let Ok(mut registry) = ctx.registry.lock() {
            registry.set_local_operator(LocalOperator {
                vin: TxIn::default(),
                service: external_addr.unwrap_or_default(),
                keypair: keypair.clone(),
            });
        }
        if let Ok(mut active) = ctx.active.lock() {
            *active = Some(ActiveOperator::new(keypair));
        }
    }

    ctx.restore()?;

    let handler = Arc::new(NodeHandler {
        ctx: ctx.clone(),
        svc: Mutex::new(None),
    });
    let (svc, svc_task) = spawn_service(P2pConfig::default(), handler.clone(), hub.clone())
        .map_err(|e| anyhow!("p2p service failed to start: {e}"))?;
    if let Ok(mut slot) = handler.svc.lock() {
        *slot = Some(svc.clone());
    }

    info!(network = %args.network, "sentinel node running");

    let mut sync_tick = interval(Duration::from_secs(SYNC_TICK_SECONDS as u64));
    let mut maintenance_tick = interval(Duration::from_secs(60));
    let mut persist_tick = interval(Duration::from_secs(15 * 60));
    let mut demo_block_tick = interval(Duration::from_secs(
        args.demo_block_seconds.max(1),
    ));
    let demo_blocks = args.demo_block_seconds > 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = sync_tick.tick() => {
                let now = unix_now();
                let steps = {
                    let peers = hub.peers();
                    let gov = NullGovernance;
                    match (ctx.sync.lock(), ctx.registry.lock(), ctx.payments.lock(), ctx.fulfilled.lock()) {
                        (Ok(mut sync), Ok(mut registry), Ok(payments), Ok(mut fulfilled)) => {
                            sync.process_tick(
                                ctx.chain.as_ref(),
                                &mut registry,
                                &payments,
                                &gov,
                                &mut fulfilled,
                                &peers,
                                now,
                            )
                        }
                        _ => Vec::new(),
                    }
                };
                for step in steps {
                    let out = match step {
                        SyncStep::Send(peer, msg) => Outbound::Direct(peer, msg),
                        SyncStep::Disconnect(peer) => Outbound::Disconnect(peer),
                    };
                    if let Err(e) = svc.outgoing(out).await {
                        warn!("sync step failed to queue: {e}");
                    }
                }
            }
            _ = maintenance_tick.tick() => {
                let now = unix_now();
                let sync = ctx.sync_flags();

                if let Ok(mut registry) = ctx.registry.lock() {
                    registry.check_and_remove(ctx.chain.as_ref(), now, sync);
                }

                // PoSe-Schritt als aktivierter Operator
                if let Some(local) = ctx.local_operator() {
                    if sync.fully_synced {
                        let requests = match (ctx.registry.lock(), ctx.fulfilled.lock()) {
                            (Ok(mut registry), Ok(mut fulfilled)) => registry
                                .do_verification_step(&local, ctx.chain.as_ref(), &mut fulfilled, now),
                            _ => Vec::new(),
                        };
                        for (addr, mnv) in requests {
                            let _ = svc
                                .outgoing(Outbound::ConnectAndSend(addr, NodeMessage::Verify(mnv)))
                                .await;
                        }
                    }
                }

                // geplante Recovery-Verbindungen abarbeiten
                loop {
                    let scheduled = match ctx.registry.lock() {
                        Ok(mut registry) => registry.pop_scheduled_recovery_connection(),
                        Err(_) => None,
                    };
                    let Some((addr, hashes)) = scheduled else { break };
                    debug!(%addr, count = hashes.len(), "requesting announces for recovery");
                    for hash in hashes {
                        let _ = svc
                            .outgoing(Outbound::AskFor(addr, Inv::new(InvType::Announce, hash)))
                            .await;
                    }
                }

                let steps = ctx.manage_active_state(now);
                for step in steps {
                    match step {
                        ActiveStep::RelayHeartbeat(hb) => {
                            let _ = svc
                                .outgoing(Outbound::BroadcastInv(Inv::new(
                                    InvType::Heartbeat,
                                    hb.digest(),
                                )))
                                .await;
                        }
                    }
                }

                for out in ctx.drain_registry_events(now) {
                    let _ = svc.outgoing(out).await;
                }

                let metrics = metrics_snapshot();
                if let Ok(registry) = ctx.registry.lock() {
                    info!(
                        "{} | inbound {} (dropped {}), outbound {}",
                        registry.summary(),
                        metrics.inbound_total,
                        metrics.inbound_dropped_rate,
                        metrics.outbound_total
                    );
                }
            }
            _ = persist_tick.tick() => {
                if let Err(e) = ctx.persist() {
                    warn!("persist failed: {e}");
                }
            }
            _ = demo_block_tick.tick(), if demo_blocks => {
                let now = unix_now();
                if let Ok(index) = chain.push_block(now) {
                    debug!(height = index.height, "synthetic block produced");
                    for out in ctx.updated_block_tip(now) {
                        let _ = svc.outgoing(out).await;
                    }
                    for out in ctx.drain_registry_events(now) {
                        let _ = svc.outgoing(out).await;
                    }
                }
            }
        }
    }

    ctx.persist()?;
    svc.shutdown().await.ok();
    svc_task.await.ok();
    Ok(())
}

fn genkey() -> Result<()> {
    use rand::RngCore;
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    // über den Hash gezogen, damit auch schwache RNG-Ausgaben gleichverteilt sind
    let secret = sha256_32(&seed);
    let keypair = OperatorKeypair::from_secret_bytes(&secret)?;
    println!("operator secret: {}", hex::encode(secret));
    println!("operator pubkey: {}", hex::encode(keypair.public_bytes()));
    println!(
        "operator id:     {}",
        hex::encode(PubKeyBytes::from_keypair(&keypair).id())
    );
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run(args))
        }
        Command::Genkey => genkey(),
    }
}
